//! Per-worker token-bucket rate limiting and cancellable pauses.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Sleeps for `duration` unless `cancel` fires first. Returns `false` when cancelled.
pub async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Token bucket with burst capacity equal to its per-second rate.
///
/// A rate of 0 disables limiting entirely.
pub struct SendGate {
    limiter: Option<DefaultDirectRateLimiter>,
}

impl SendGate {
    pub fn per_second(rate: u32) -> Self {
        let limiter = NonZeroU32::new(rate)
            .map(|r| RateLimiter::direct(Quota::per_second(r).allow_burst(r)));
        Self { limiter }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limiter.is_none()
    }

    /// Waits for one token. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(limiter) = &self.limiter else {
            return true;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = limiter.until_ready() => true,
        }
    }
}

//! Interval throughput tracking across periodic snapshots.
//!
//! The collector only knows cumulative counters. `ThroughputMeasurer` turns a
//! series of snapshots into per-interval send/receive rates and remembers the
//! slowest and fastest receive intervals of the run.

use crate::metrics::Snapshot;

/// Send and receive rates over one reporting interval
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct IntervalRates {
    pub tx: f64,
    pub rx: f64,
}

/// Slowest and fastest non-zero receive interval observed
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateRange {
    pub min_rx: f64,
    pub max_rx: f64,
}

/// Sliding window over successive snapshots
#[derive(Debug, Clone)]
pub struct ThroughputMeasurer {
    last_sent: u64,
    last_received: u64,
    last_elapsed: f64,
    /// Starts at MAX so the first non-zero interval becomes the minimum
    min_rx: f64,
    max_rx: f64,
}

impl Default for ThroughputMeasurer {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputMeasurer {
    pub fn new() -> Self {
        Self {
            last_sent: 0,
            last_received: 0,
            last_elapsed: 0.0,
            min_rx: f64::MAX,
            max_rx: 0.0,
        }
    }

    /// Computes the rates since the previous observation and slides the window
    ///
    /// A snapshot that is not newer than the previous one yields zero rates and
    /// leaves the window untouched.
    pub fn observe(&mut self, snap: &Snapshot) -> IntervalRates {
        let dt = snap.elapsed_sec - self.last_elapsed;
        if dt <= 0.0 {
            return IntervalRates::default();
        }
        let rates = IntervalRates {
            tx: snap.messages_sent.saturating_sub(self.last_sent) as f64 / dt,
            rx: snap.messages_received.saturating_sub(self.last_received) as f64 / dt,
        };

        // Idle intervals (e.g. before consumers attach) would pin the minimum at 0.
        if rates.rx > 0.0 {
            self.min_rx = self.min_rx.min(rates.rx);
            self.max_rx = self.max_rx.max(rates.rx);
        }

        self.last_sent = snap.messages_sent;
        self.last_received = snap.messages_received;
        self.last_elapsed = snap.elapsed_sec;
        rates
    }

    pub fn range(&self) -> RateRange {
        RateRange {
            min_rx: if self.min_rx == f64::MAX { 0.0 } else { self.min_rx },
            max_rx: self.max_rx,
        }
    }
}

//! Error taxonomy for broker sessions and load workers.
//!
//! `BrokerError` is what the broker client can fail with. `WorkerError` is how
//! a single producer or consumer worker terminates; none of its variants ever
//! escalate beyond the worker that produced them.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("topic not found: {0}")]
    TopicNotFound(String),
    #[error("subscription {subscription} on {topic} already has an exclusive consumer")]
    SubscriptionBusy { topic: String, subscription: String },
    #[error("consumer {0} is not subscribed")]
    NotSubscribed(String),
    #[error("producer {0} has not been created")]
    NotCreated(String),
    #[error("unknown message id {0}")]
    UnknownMessage(u64),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("no broker client for service url {0}")]
    UnsupportedScheme(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Why a worker stopped before the run ended.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Producer/consumer build or create failed.
    #[error("session setup failed: {0}")]
    Session(#[source] BrokerError),
    /// Subscription never succeeded within the retry budget.
    #[error("subscribe failed after {attempts} attempts: {source}")]
    Subscribe {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
    /// Receive stream broke.
    #[error("transport failure: {0}")]
    Transport(#[source] BrokerError),
    /// The shared cancellation signal fired. Not a failure.
    #[error("cancelled")]
    Cancelled,
}

impl WorkerError {
    /// Whether this outcome should be counted as an error.
    pub fn is_failure(&self) -> bool {
        !matches!(self, WorkerError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let errors = vec![
            BrokerError::TopicNotFound("/default/t".to_string()),
            BrokerError::SubscriptionBusy {
                topic: "/default/t".to_string(),
                subscription: "sub".to_string(),
            },
            BrokerError::NotSubscribed("c-0".to_string()),
            BrokerError::NotCreated("p-0".to_string()),
            BrokerError::UnknownMessage(7),
            BrokerError::Rejected("injected".to_string()),
            BrokerError::UnsupportedScheme("http://x".to_string()),
        ];

        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        assert!(!WorkerError::Cancelled.is_failure());
        assert!(WorkerError::Session(BrokerError::NotCreated("p-0".to_string())).is_failure());
        assert!(WorkerError::Transport(BrokerError::Rejected("reset".to_string())).is_failure());

        let err = WorkerError::Subscribe {
            attempts: 15,
            source: BrokerError::TopicNotFound("t".to_string()),
        };
        assert!(err.is_failure());
        assert!(err.to_string().contains("15 attempts"));
    }
}

//! brokerload - pub/sub broker load generation and measurement
//!
//! This library holds the load engine: producer and consumer worker pools,
//! the shared metrics collector and the reporting around them. The binary in
//! `main.rs` is a thin CLI over [`runner::Runner`].

pub mod args;
pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod measurer;
pub mod memory;
pub mod metrics;
pub mod payload;
pub mod producer;
pub mod rate;
pub mod report;
pub mod runner;
pub mod signals;
pub mod templates;
pub mod utils;

// Re-export commonly used types
pub use client::{connect, BrokerClient};
pub use config::RunConfig;
pub use metrics::{Collector, Snapshot};
pub use runner::{RunOutcome, Runner, StopReason};

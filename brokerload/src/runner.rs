//! Run orchestration
//!
//! The `Runner` owns one run end to end: it starts the producer pool, waits a
//! settling delay, starts the consumer pool, prints periodic status while the
//! run is live and, once the deadline passes or the caller cancels, waits for
//! every worker to exit before taking the final snapshot.

use crate::client::BrokerClient;
use crate::config::{OutputFormat, RunConfig};
use crate::consumer::{ConsumerPool, RetryPolicy};
use crate::error::WorkerError;
use crate::measurer::{RateRange, ThroughputMeasurer};
use crate::metrics::{Collector, Snapshot};
use crate::producer::ProducerPool;
use crate::report::status_line;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Delay between starting producers and starting consumers
///
/// Producers create their topics; consumers that start too early would burn
/// through subscribe retries.
pub const CONSUMER_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Why the run stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured duration elapsed
    Deadline,
    /// The caller's token fired (interrupt or upstream cancellation)
    Interrupted,
}

/// Everything the CLI needs after a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Final snapshot, taken after every worker exited
    pub snapshot: Snapshot,
    pub stop: StopReason,
    /// Slowest and fastest receive interval seen by the periodic reporter
    pub rates: RateRange,
    pub producers_started: usize,
    pub consumers_started: usize,
}

/// Drives producer and consumer pools for one run
pub struct Runner {
    client: Arc<dyn BrokerClient>,
    settle_delay: Duration,
    retry: RetryPolicy,
}

impl Runner {
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            settle_delay: CONSUMER_SETTLE_DELAY,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Executes one run of `cfg`
    ///
    /// Cancelling `shutdown` stops the run early. Worker failures never abort
    /// the run; they surface in the snapshot's error counter.
    ///
    /// # Returns
    /// * `Err(_)` - Only if the configured duration cannot be parsed
    pub async fn run(&self, cfg: &RunConfig, shutdown: CancellationToken) -> Result<RunOutcome> {
        let duration = cfg.duration()?;
        warn_unused_phases(cfg);

        // Workers watch a child token so that deadline expiry and caller
        // cancellation reach them through the same signal.
        let cancel = shutdown.child_token();
        let collector = Arc::new(Collector::new());
        let mut tasks = JoinSet::new();

        let producers = ProducerPool::new(Arc::clone(&self.client), Arc::clone(&collector));
        let consumers = ConsumerPool::new(Arc::clone(&self.client), Arc::clone(&collector))
            .with_retry_policy(self.retry);

        let producers_started = producers.start(cfg, &cancel, &mut tasks);
        info!(
            "Started {} producer workers; consumers start in {:?}",
            producers_started, self.settle_delay
        );

        let every = cfg.metrics.report_every();
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut measurer = ThroughputMeasurer::new();

        let deadline = sleep(duration);
        tokio::pin!(deadline);
        let settle = sleep(self.settle_delay);
        tokio::pin!(settle);
        let mut consumers_started = None;

        let stop = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Run interrupted, stopping workers");
                    break StopReason::Interrupted;
                }
                _ = &mut deadline => {
                    info!("Run duration of {:?} elapsed, stopping workers", duration);
                    cancel.cancel();
                    break StopReason::Deadline;
                }
                _ = &mut settle, if consumers_started.is_none() => {
                    let started = consumers.start(cfg, &cancel, &mut tasks);
                    info!("Started {} consumer workers", started);
                    consumers_started = Some(started);
                }
                _ = ticker.tick() => {
                    let snap = collector.snapshot();
                    let interval = measurer.observe(&snap);
                    if cfg.metrics.enabled {
                        match cfg.metrics.output_format {
                            OutputFormat::Terminal => info!(
                                "{} | interval tx={:.0}/s rx={:.0}/s",
                                status_line(&snap),
                                interval.tx,
                                interval.rx
                            ),
                            OutputFormat::Json => match serde_json::to_string(&snap) {
                                Ok(line) => info!("{}", line),
                                Err(e) => warn!("failed to encode status snapshot: {}", e),
                            },
                        }
                    }
                }
            }
        };

        // Quiesce before the final snapshot so no worker is still recording.
        let mut panicked = 0u64;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    panicked += 1;
                    error!("worker task panicked: {}", e);
                }
            }
        }
        collector.inc_error(panicked);
        debug!("All workers exited");

        let snapshot = collector.snapshot();
        measurer.observe(&snapshot);
        Ok(RunOutcome {
            snapshot,
            stop,
            rates: measurer.range(),
            producers_started,
            consumers_started: consumers_started.unwrap_or(0),
        })
    }
}

/// Records the outcome of one finished worker
///
/// Cancellation is the normal exit and is not counted; anything else costs
/// exactly one error.
pub(crate) fn settle_worker(
    role: &str,
    name: &str,
    result: Result<(), WorkerError>,
    collector: &Collector,
) {
    match result {
        Ok(()) => debug!("{} {} finished", role, name),
        Err(e) if !e.is_failure() => debug!("{} {} stopped", role, name),
        Err(e) => {
            collector.inc_error(1);
            warn!("{} {} failed: {}", role, name, e);
        }
    }
}

fn warn_unused_phases(cfg: &RunConfig) {
    let phases = [
        ("warmup_duration", &cfg.execution.warmup_duration),
        ("cooldown_duration", &cfg.execution.cooldown_duration),
    ];
    for (field, value) in phases {
        if let Some(value) = value {
            warn!(
                "execution.{} = {} is ignored; metrics cover the whole run",
                field, value
            );
        }
    }
}

//! Producer workers for rate-limited message production
//!
//! This module contains the `ProducerPool`, which spawns one `ProducerWorker`
//! per configured producer instance, and the worker loop that paces sends with
//! a per-worker token bucket and stamps every payload with a local sequence
//! number.

use crate::client::{BrokerClient, ProducerOptions, ProducerSession};
use crate::config::RunConfig;
use crate::error::WorkerError;
use crate::metrics::Collector;
use crate::payload::PayloadSpec;
use crate::rate::{pause, SendGate};
use crate::runner::settle_worker;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Pause after a failed send before moving on to the next sequence number.
pub const SEND_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Immutable description of one producer instance
///
/// Each worker owns its own broker session, rate limiter and sequence counter;
/// nothing is shared between workers except the metrics collector.
#[derive(Debug, Clone)]
pub struct ProducerWorker {
    /// Unique worker name, `<group>-<index>`
    pub name: String,
    /// Session options passed to the broker client
    pub options: ProducerOptions,
    /// Messages per second; 0 means unlimited
    pub rate_per_second: u32,
    /// Payload schema and target size
    pub payload: PayloadSpec,
}

impl ProducerWorker {
    /// Produces messages until `cancel` fires
    ///
    /// Per iteration: wait for a token, advance the sequence, build the payload
    /// and send it. A failed send is counted, followed by a short pause, and the
    /// message is not retried; the gap shows up downstream as loss.
    ///
    /// # Returns
    /// * `Err(WorkerError::Cancelled)` - The normal way a producer stops
    /// * `Err(WorkerError::Session)` - If the producer could not be built or created
    pub async fn run(
        &self,
        client: Arc<dyn BrokerClient>,
        collector: Arc<Collector>,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut session = client
            .producer(self.options.clone())
            .await
            .map_err(WorkerError::Session)?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            created = session.create() => created.map_err(WorkerError::Session)?,
        }
        debug!(
            "Producer {} created on {} (rate: {}/s)",
            self.name, self.options.topic, self.rate_per_second
        );

        let gate = SendGate::per_second(self.rate_per_second);
        self.produce(session.as_mut(), &gate, &collector, &cancel)
            .await
    }

    async fn produce(
        &self,
        session: &mut dyn ProducerSession,
        gate: &SendGate,
        collector: &Collector,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut seq = 0u64;
        loop {
            if !gate.acquire(cancel).await {
                return Err(WorkerError::Cancelled);
            }
            seq += 1;
            let payload = self.payload.generate(seq);

            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                sent = session.send(payload) => sent,
            };
            match sent {
                Ok(_) => collector.inc_sent(1),
                Err(e) => {
                    collector.inc_error(1);
                    warn!(
                        topic = %self.options.topic,
                        worker = %self.name,
                        seq,
                        "send error: {}",
                        e
                    );
                    if !pause(SEND_ERROR_BACKOFF, cancel).await {
                        return Err(WorkerError::Cancelled);
                    }
                }
            }

            // An unlimited in-process send never suspends; give siblings a turn.
            if gate.is_unlimited() {
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Spawns producer workers for every producer group of a run
pub struct ProducerPool {
    client: Arc<dyn BrokerClient>,
    collector: Arc<Collector>,
}

impl ProducerPool {
    pub fn new(client: Arc<dyn BrokerClient>, collector: Arc<Collector>) -> Self {
        Self { client, collector }
    }

    /// Expands producer groups into one worker description per instance
    pub fn plan(cfg: &RunConfig) -> Vec<ProducerWorker> {
        let mut workers = Vec::new();
        for group in &cfg.producers {
            let Some(topic) = cfg.topic(&group.topic) else {
                error!(
                    "Producer group '{}' references undeclared topic {}",
                    group.name, group.topic
                );
                continue;
            };
            let base = if group.name.is_empty() {
                "producer"
            } else {
                group.name.as_str()
            };
            for idx in 0..group.count {
                let name = format!("{base}-{idx}");
                workers.push(ProducerWorker {
                    options: ProducerOptions {
                        name: name.clone(),
                        topic: topic.name.clone(),
                        partitions: topic.partitions,
                        schema: topic.schema_type,
                        json_schema: topic.json_schema.clone(),
                        dispatch: topic.dispatch_strategy,
                    },
                    name,
                    rate_per_second: group.rate_per_second,
                    payload: PayloadSpec::new(topic.schema_type, group.message_size),
                });
            }
        }
        workers
    }

    /// Spawns every planned worker onto `tasks`; returns how many were started
    pub fn start(
        &self,
        cfg: &RunConfig,
        cancel: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) -> usize {
        let workers = Self::plan(cfg);
        let started = workers.len();
        for worker in workers {
            let client = Arc::clone(&self.client);
            let collector = Arc::clone(&self.collector);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = worker.run(client, Arc::clone(&collector), cancel).await;
                settle_worker("producer", &worker.name, result, &collector);
            });
        }
        started
    }
}

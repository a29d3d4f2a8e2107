//! Consumer workers for message reception and integrity tracking
//!
//! This module provides the `ConsumerPool`, which spawns one `ConsumerWorker`
//! per configured consumer instance. Each worker subscribes (retrying while
//! the topic may not exist yet), then receives, measures and acknowledges
//! messages until the run is cancelled. All cross-message state lives in the
//! shared metrics collector.

use crate::client::{BrokerClient, ConsumerOptions, ConsumerSession, Message, MessageStream};
use crate::config::{RunConfig, SchemaKind};
use crate::error::WorkerError;
use crate::metrics::Collector;
use crate::payload::parse_sequence;
use crate::rate::pause;
use crate::runner::settle_worker;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Bounded, fixed-interval retry policy for subscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total subscribe attempts before the worker gives up
    pub attempts: u32,
    /// Delay between consecutive attempts
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 15,
            interval: Duration::from_millis(200),
        }
    }
}

/// Immutable description of one consumer instance
#[derive(Debug, Clone)]
pub struct ConsumerWorker {
    /// Unique worker name, `<group>-<index>`
    pub name: String,
    /// Session options passed to the broker client
    pub options: ConsumerOptions,
    /// Payload schema of the topic, used to recover sequence numbers
    pub schema: SchemaKind,
}

/// Per-worker counters that are only reported, never aggregated
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStats {
    /// Messages whose publish time was in the future (clock skew)
    pub skewed: u64,
    /// Messages without a recoverable sequence number
    pub untracked: u64,
}

impl ConsumerWorker {
    /// Consumes messages until `cancel` fires
    ///
    /// # Returns
    /// * `Err(WorkerError::Cancelled)` - The normal way a consumer stops
    /// * `Ok(())` - If the broker closed the receive stream
    /// * `Err(WorkerError::Session | Subscribe | Transport)` - If this worker failed
    pub async fn run(
        &self,
        client: Arc<dyn BrokerClient>,
        collector: Arc<Collector>,
        cancel: CancellationToken,
        retry: RetryPolicy,
    ) -> Result<(), WorkerError> {
        let mut session = client
            .consumer(self.options.clone())
            .await
            .map_err(WorkerError::Session)?;
        self.subscribe(session.as_mut(), &cancel, retry).await?;

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
            stream = session.receive() => stream.map_err(WorkerError::Transport)?,
        };
        debug!(
            "Consumer {} receiving from {} ({})",
            self.name, self.options.topic, self.options.subscription
        );

        let mut stats = ReceiveStats::default();
        let result = self
            .consume(session.as_mut(), &mut stream, &collector, &cancel, &mut stats)
            .await;

        if stats.skewed > 0 {
            warn!(
                "Consumer {} skipped {} latency samples with a publish time in the future",
                self.name, stats.skewed
            );
        }
        if stats.untracked > 0 {
            debug!(
                "Consumer {} received {} messages without a sequence number",
                self.name, stats.untracked
            );
        }
        result
    }

    /// Subscribes with a bounded fixed-interval retry
    ///
    /// Consumers may start before a producer has created their topic, so a
    /// failed subscribe is retried until the policy is exhausted or the run is
    /// cancelled.
    async fn subscribe(
        &self,
        session: &mut dyn ConsumerSession,
        cancel: &CancellationToken,
        retry: RetryPolicy,
    ) -> Result<(), WorkerError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let subscribed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                subscribed = session.subscribe() => subscribed,
            };
            match subscribed {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("Consumer {} subscribed after {} attempts", self.name, attempt);
                    }
                    return Ok(());
                }
                Err(source) if attempt >= retry.attempts => {
                    return Err(WorkerError::Subscribe {
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    if attempt == 1 || attempt % 5 == 0 {
                        warn!(
                            topic = %self.options.topic,
                            worker = %self.name,
                            attempt,
                            "subscribe error (of {} attempts): {}",
                            retry.attempts,
                            e
                        );
                    }
                    if !pause(retry.interval, cancel).await {
                        return Err(WorkerError::Cancelled);
                    }
                }
            }
        }
    }

    async fn consume(
        &self,
        session: &mut dyn ConsumerSession,
        stream: &mut MessageStream,
        collector: &Collector,
        cancel: &CancellationToken,
        stats: &mut ReceiveStats,
    ) -> Result<(), WorkerError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                next = stream.next() => next,
            };
            let Some(received) = next else {
                debug!("Consumer {} stream closed by broker", self.name);
                return Ok(());
            };
            let message = received.map_err(WorkerError::Transport)?;

            self.observe(&message, collector, stats);

            let acked = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WorkerError::Cancelled),
                acked = session.ack(&message) => acked,
            };
            if let Err(e) = acked {
                collector.inc_error(1);
                warn!(
                    topic = %self.options.topic,
                    worker = %self.name,
                    message_id = message.id,
                    "ack error: {}",
                    e
                );
            }
        }
    }

    /// Records latency, sequence and the receive count for one message
    fn observe(&self, message: &Message, collector: &Collector, stats: &mut ReceiveStats) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let latency_ms = now_ms - message.publish_time;
        if latency_ms >= 0 {
            collector.record_latency(latency_ms as f64);
        } else {
            stats.skewed += 1;
        }

        match parse_sequence(self.schema, &message.payload) {
            Some(seq) => collector.record_seq(
                &self.options.topic,
                &self.options.subscription,
                &message.producer_name,
                seq,
            ),
            None => stats.untracked += 1,
        }
        collector.inc_received(1);
    }
}

/// Spawns consumer workers for every consumer group of a run
pub struct ConsumerPool {
    client: Arc<dyn BrokerClient>,
    collector: Arc<Collector>,
    retry: RetryPolicy,
}

impl ConsumerPool {
    pub fn new(client: Arc<dyn BrokerClient>, collector: Arc<Collector>) -> Self {
        Self {
            client,
            collector,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Expands consumer groups into one worker description per instance
    pub fn plan(cfg: &RunConfig) -> Vec<ConsumerWorker> {
        let mut workers = Vec::new();
        for group in &cfg.consumers {
            let Some(topic) = cfg.topic(&group.topic) else {
                error!(
                    "Consumer group '{}' references undeclared topic {}",
                    group.name, group.topic
                );
                continue;
            };
            let base = if group.name.is_empty() {
                "consumer"
            } else {
                group.name.as_str()
            };
            for idx in 0..group.count {
                let name = format!("{base}-{idx}");
                workers.push(ConsumerWorker {
                    options: ConsumerOptions {
                        name: name.clone(),
                        topic: group.topic.clone(),
                        subscription: group.subscription.clone(),
                        mode: group.subscription_type,
                    },
                    name,
                    schema: topic.schema_type,
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
            let retry = self.retry;
            tasks.spawn(async move {
                let result = worker
                    .run(client, Arc::clone(&collector), cancel, retry)
                    .await;
                settle_worker("consumer", &worker.name, result, &collector);
            });
        }
        started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ProducerOptions, ProducerSession};
    use crate::config::tests::VALID;
    use crate::config::{DispatchMode, SubscriptionMode};
    use crate::error::BrokerError;
    use crate::memory::MemoryBroker;
    use crate::payload::PayloadSpec;

    fn config() -> RunConfig {
        RunConfig::from_yaml(VALID).unwrap()
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            interval: Duration::from_millis(10),
        }
    }

    async fn producer(broker: &MemoryBroker, name: &str) -> Box<dyn ProducerSession> {
        let mut session = broker
            .producer(ProducerOptions {
                name: name.to_string(),
                topic: "/default/test".to_string(),
                partitions: 0,
                schema: SchemaKind::String,
                json_schema: None,
                dispatch: DispatchMode::NonReliable,
            })
            .await
            .unwrap();
        session.create().await.unwrap();
        session
    }

    #[test]
    fn test_default_retry_policy() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.attempts, 15);
        assert_eq!(retry.interval, Duration::from_millis(200));
    }

    #[test]
    fn test_plan_expands_groups() {
        let workers = ConsumerPool::plan(&config());
        assert_eq!(workers.len(), 3);
        assert_eq!(workers[2].name, "c-2");
        assert_eq!(workers[0].options.subscription, "sub_shared");
        assert_eq!(workers[0].options.mode, SubscriptionMode::Shared);
        assert_eq!(workers[0].schema, SchemaKind::String);
    }

    #[tokio::test]
    async fn test_subscribe_retries_exhausted() {
        let broker = MemoryBroker::new();
        let worker = ConsumerPool::plan(&config()).remove(0);
        let result = worker
            .run(
                Arc::new(broker),
                Arc::new(Collector::new()),
                CancellationToken::new(),
                fast_retry(3),
            )
            .await;
        match result {
            Err(WorkerError::Subscribe { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, BrokerError::TopicNotFound("/default/test".to_string()));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_succeeds_once_topic_appears() {
        let broker = MemoryBroker::new();
        let collector = Arc::new(Collector::new());
        let cancel = CancellationToken::new();
        let worker = ConsumerPool::plan(&config()).remove(0);

        let handle = {
            let client: Arc<dyn BrokerClient> = Arc::new(broker.clone());
            let collector = Arc::clone(&collector);
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.run(client, collector, cancel, fast_retry(50)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut producer = producer(&broker, "p-0").await;
        // Give the consumer time to attach before publishing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let spec = PayloadSpec::new(SchemaKind::String, 32);
        for seq in [1, 2, 4] {
            producer.send(spec.generate(seq)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), Err(WorkerError::Cancelled)));
        let snap = collector.snapshot();
        assert_eq!(snap.messages_received, 3);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.latency_samples, 3);
        assert_eq!(snap.estimated_loss, 1);
        let entry = &snap.integrity_breakdown[0];
        assert_eq!(entry.topic, "/default/test");
        assert_eq!(entry.subscription, "sub_shared");
        assert_eq!(entry.producer, "p-0");
    }

    #[tokio::test]
    async fn test_cancel_during_subscribe_retry_is_clean() {
        let broker = MemoryBroker::new();
        let cancel = CancellationToken::new();
        let worker = ConsumerPool::plan(&config()).remove(0);
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker
                    .run(
                        Arc::new(broker),
                        Arc::new(Collector::new()),
                        cancel,
                        RetryPolicy::default(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(WorkerError::Cancelled)));
    }

    #[tokio::test]
    async fn test_duplicates_are_tracked_per_producer() {
        let broker = MemoryBroker::new().with_duplicated_deliveries(2);
        let collector = Arc::new(Collector::new());
        let cancel = CancellationToken::new();
        let mut producer = producer(&broker, "p-7").await;

        let mut cfg = config();
        cfg.consumers[0].count = 1;
        let pool = ConsumerPool::new(Arc::new(broker.clone()), Arc::clone(&collector))
            .with_retry_policy(fast_retry(10));
        let mut tasks = JoinSet::new();
        assert_eq!(pool.start(&cfg, &cancel, &mut tasks), 1);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let spec = PayloadSpec::new(SchemaKind::String, 32);
        for seq in 1..=4 {
            producer.send(spec.generate(seq)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        while tasks.join_next().await.is_some() {}

        let snap = collector.snapshot();
        // Deliveries 2 and 4 are doubled; both copies ack cleanly.
        assert_eq!(snap.messages_received, 6);
        assert_eq!(snap.duplicates, 2);
        assert_eq!(snap.estimated_loss, 0);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.integrity_breakdown[0].producer, "p-7");
    }

    #[tokio::test]
    async fn test_failed_worker_counts_one_error() {
        let broker = MemoryBroker::new();
        let collector = Arc::new(Collector::new());
        let cancel = CancellationToken::new();
        let mut cfg = config();
        cfg.consumers[0].count = 2;
        let pool = ConsumerPool::new(Arc::new(broker), Arc::clone(&collector))
            .with_retry_policy(fast_retry(2));
        let mut tasks = JoinSet::new();
        pool.start(&cfg, &cancel, &mut tasks);
        while tasks.join_next().await.is_some() {}

        assert_eq!(collector.snapshot().errors, 2);
        assert!(!cancel.is_cancelled());
    }
}

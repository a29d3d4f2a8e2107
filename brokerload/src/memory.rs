//! In-process pub/sub broker.
//!
//! Implements the [`BrokerClient`] contract entirely in memory so scenarios can
//! run without external infrastructure. Semantics follow a subscription-based
//! broker:
//!
//! - a producer's `create` creates its topic if it does not exist yet;
//! - a subscription only sees messages published after it was created;
//! - shared subscriptions round-robin, exclusive subscriptions admit a single
//!   consumer, failover subscriptions deliver to the oldest attached consumer;
//! - with reliable dispatch, messages for a subscription with no attached
//!   consumer are buffered until one attaches; otherwise they are dropped.
//!
//! Fault injection knobs make send failures, silent loss and duplicate
//! delivery reproducible.

use crate::client::{
    BrokerClient, ConsumerOptions, ConsumerSession, Message, MessageStream, ProducerOptions,
    ProducerSession,
};
use crate::config::{DispatchMode, SubscriptionMode};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Deterministic fault injection, each knob counting from the broker's start.
#[derive(Debug, Clone, Copy, Default)]
struct FaultPlan {
    fail_every_nth_send: Option<u64>,
    drop_every_nth_publish: Option<u64>,
    duplicate_every_nth_delivery: Option<u64>,
}

fn hits(every: Option<u64>, count: u64) -> bool {
    matches!(every, Some(n) if n > 0 && count % n == 0)
}

struct AttachedConsumer {
    id: u64,
    tx: UnboundedSender<BrokerResult<Message>>,
}

struct SubscriptionState {
    mode: SubscriptionMode,
    consumers: Vec<AttachedConsumer>,
    cursor: usize,
    backlog: VecDeque<Message>,
    /// Outstanding deliveries per message id; redeliveries raise the count.
    unacked: HashMap<u64, u32>,
}

impl SubscriptionState {
    fn new(mode: SubscriptionMode) -> Self {
        Self {
            mode,
            consumers: Vec::new(),
            cursor: 0,
            backlog: VecDeque::new(),
            unacked: HashMap::new(),
        }
    }

    fn prune_closed(&mut self) {
        self.consumers.retain(|c| !c.tx.is_closed());
    }

    /// Hands `message` to the consumer chosen by the subscription mode.
    /// Gives the message back if nobody could take it.
    fn dispatch(&mut self, message: Message, copies: usize) -> Option<Message> {
        self.prune_closed();
        if self.consumers.is_empty() {
            return Some(message);
        }
        let target = match self.mode {
            SubscriptionMode::Exclusive | SubscriptionMode::Failover => 0,
            SubscriptionMode::Shared => {
                let idx = self.cursor % self.consumers.len();
                self.cursor = self.cursor.wrapping_add(1);
                idx
            }
        };
        let tx = &self.consumers[target].tx;
        let id = message.id;
        let mut delivered = 0u32;
        for _ in 1..copies {
            if tx.unbounded_send(Ok(message.clone())).is_ok() {
                delivered += 1;
            }
        }
        let undelivered = match tx.unbounded_send(Ok(message)) {
            Ok(()) => {
                delivered += 1;
                None
            }
            Err(err) => err.into_inner().ok(),
        };
        if delivered > 0 {
            *self.unacked.entry(id).or_insert(0) += delivered;
        }
        undelivered
    }
}

impl SubscriptionState {
    /// Consumes one outstanding delivery of `id`. False if none is left.
    fn settle(&mut self, id: u64) -> bool {
        let Some(outstanding) = self.unacked.get_mut(&id) else {
            return false;
        };
        *outstanding -= 1;
        if *outstanding == 0 {
            self.unacked.remove(&id);
        }
        true
    }
}

struct TopicState {
    partitions: u32,
    dispatch: DispatchMode,
    next_message_id: u64,
    published: u64,
    subscriptions: HashMap<String, SubscriptionState>,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicState>,
    sends: u64,
    publishes: u64,
    deliveries: u64,
    next_consumer_id: u64,
}

impl BrokerState {
    fn deliver(&mut self, faults: &FaultPlan, topic: &str, message: Message) {
        let Some(state) = self.topics.get_mut(topic) else {
            return;
        };
        let reliable = state.dispatch == DispatchMode::Reliable;
        for sub in state.subscriptions.values_mut() {
            self.deliveries += 1;
            let copies = if hits(faults.duplicate_every_nth_delivery, self.deliveries) {
                2
            } else {
                1
            };
            if let Some(undelivered) = sub.dispatch(message.clone(), copies) {
                if reliable {
                    sub.backlog.push_back(undelivered);
                }
            }
        }
    }
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    faults: FaultPlan,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `n`th send is rejected with an error.
    pub fn with_send_failures(mut self, n: u64) -> Self {
        self.faults.fail_every_nth_send = Some(n);
        self
    }

    /// Every `n`th accepted message is acknowledged to the producer but never delivered.
    pub fn with_dropped_messages(mut self, n: u64) -> Self {
        self.faults.drop_every_nth_publish = Some(n);
        self
    }

    /// Every `n`th delivery is sent to the consumer twice.
    pub fn with_duplicated_deliveries(mut self, n: u64) -> Self {
        self.faults.duplicate_every_nth_delivery = Some(n);
        self
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.lock().topics.contains_key(topic)
    }

    pub fn topic_partitions(&self, topic: &str) -> Option<u32> {
        self.state.lock().topics.get(topic).map(|t| t.partitions)
    }

    /// Number of messages accepted on `topic`.
    pub fn published(&self, topic: &str) -> u64 {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.published)
    }

    pub fn backlog_len(&self, topic: &str, subscription: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.subscriptions.get(subscription))
            .map_or(0, |s| s.backlog.len())
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn producer(&self, options: ProducerOptions) -> BrokerResult<Box<dyn ProducerSession>> {
        if options.topic.is_empty() {
            return Err(BrokerError::Rejected("producer topic is empty".to_string()));
        }
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
            options,
            created: false,
        }))
    }

    async fn consumer(&self, options: ConsumerOptions) -> BrokerResult<Box<dyn ConsumerSession>> {
        if options.subscription.is_empty() {
            return Err(BrokerError::Rejected("subscription name is empty".to_string()));
        }
        let id = {
            let mut state = self.state.lock();
            state.next_consumer_id += 1;
            state.next_consumer_id
        };
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            options,
            id,
            subscribed: false,
            rx: None,
        }))
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    options: ProducerOptions,
    created: bool,
}

#[async_trait]
impl ProducerSession for MemoryProducer {
    async fn create(&mut self) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state
            .topics
            .entry(self.options.topic.clone())
            .or_insert_with(|| {
                debug!(
                    "memory broker: creating topic {} ({} partitions, {:?})",
                    self.options.topic, self.options.partitions, self.options.dispatch
                );
                TopicState {
                    partitions: self.options.partitions,
                    dispatch: self.options.dispatch,
                    next_message_id: 0,
                    published: 0,
                    subscriptions: HashMap::new(),
                }
            });
        self.created = true;
        Ok(())
    }

    async fn send(&mut self, payload: Bytes) -> BrokerResult<u64> {
        if !self.created {
            return Err(BrokerError::NotCreated(self.options.name.clone()));
        }
        let faults = self.broker.faults;
        let mut state = self.broker.state.lock();
        state.sends += 1;
        if hits(faults.fail_every_nth_send, state.sends) {
            return Err(BrokerError::Rejected("injected send failure".to_string()));
        }
        state.publishes += 1;
        let dropped = hits(faults.drop_every_nth_publish, state.publishes);

        let topic = state
            .topics
            .get_mut(&self.options.topic)
            .ok_or_else(|| BrokerError::TopicNotFound(self.options.topic.clone()))?;
        topic.next_message_id += 1;
        topic.published += 1;
        let id = topic.next_message_id;

        let mut attributes = HashMap::new();
        if topic.partitions > 0 {
            let partition = id % u64::from(topic.partitions);
            attributes.insert("partition".to_string(), partition.to_string());
        }
        let message = Message {
            id,
            topic: self.options.topic.clone(),
            producer_name: self.options.name.clone(),
            payload,
            publish_time: chrono::Utc::now().timestamp_millis(),
            attributes,
        };

        if !dropped {
            state.deliver(&faults, &self.options.topic, message);
        }
        Ok(id)
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    options: ConsumerOptions,
    id: u64,
    subscribed: bool,
    rx: Option<UnboundedReceiver<BrokerResult<Message>>>,
}

#[async_trait]
impl ConsumerSession for MemoryConsumer {
    async fn subscribe(&mut self) -> BrokerResult<()> {
        if self.subscribed {
            return Ok(());
        }
        let mut state = self.broker.state.lock();
        let topic = state
            .topics
            .get_mut(&self.options.topic)
            .ok_or_else(|| BrokerError::TopicNotFound(self.options.topic.clone()))?;
        let sub = topic
            .subscriptions
            .entry(self.options.subscription.clone())
            .or_insert_with(|| SubscriptionState::new(self.options.mode));
        if sub.mode != self.options.mode {
            return Err(BrokerError::Rejected(format!(
                "subscription {} is {:?}, not {:?}",
                self.options.subscription, sub.mode, self.options.mode
            )));
        }
        sub.prune_closed();
        if sub.mode == SubscriptionMode::Exclusive && !sub.consumers.is_empty() {
            return Err(BrokerError::SubscriptionBusy {
                topic: self.options.topic.clone(),
                subscription: self.options.subscription.clone(),
            });
        }

        let (tx, rx) = unbounded();
        sub.consumers.push(AttachedConsumer { id: self.id, tx });
        while let Some(message) = sub.backlog.pop_front() {
            if let Some(undelivered) = sub.dispatch(message, 1) {
                sub.backlog.push_front(undelivered);
                break;
            }
        }

        self.rx = Some(rx);
        self.subscribed = true;
        Ok(())
    }

    async fn receive(&mut self) -> BrokerResult<MessageStream> {
        if !self.subscribed {
            return Err(BrokerError::NotSubscribed(self.options.name.clone()));
        }
        self.rx
            .take()
            .map(|rx| Box::pin(rx) as MessageStream)
            .ok_or_else(|| BrokerError::Rejected("receive stream already open".to_string()))
    }

    async fn ack(&mut self, message: &Message) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        let acked = state
            .topics
            .get_mut(&self.options.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.options.subscription))
            .is_some_and(|s| s.settle(message.id));
        if acked {
            Ok(())
        } else {
            Err(BrokerError::UnknownMessage(message.id))
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if !self.subscribed {
            return;
        }
        let mut state = self.broker.state.lock();
        if let Some(sub) = state
            .topics
            .get_mut(&self.options.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.options.subscription))
        {
            sub.consumers.retain(|c| c.id != self.id);
        }
    }
}

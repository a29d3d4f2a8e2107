//! Broker capability contract.
//!
//! The load engine never talks to a wire protocol directly. It drives
//! producers and consumers through these traits, and [`connect`] picks the
//! implementation for a configured service URL.

use crate::config::{DispatchMode, SchemaKind, SubscriptionMode};
use crate::error::{BrokerError, BrokerResult};
use crate::memory::MemoryBroker;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

/// URL scheme served by the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Broker-assigned id, unique per topic.
    pub id: u64,
    pub topic: String,
    /// Name of the producer session that published the message.
    pub producer_name: String,
    pub payload: Bytes,
    /// Broker publish time in milliseconds since the Unix epoch.
    pub publish_time: i64,
    pub attributes: HashMap<String, String>,
}

pub type MessageStream = BoxStream<'static, BrokerResult<Message>>;

/// Options for building a producer session.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub name: String,
    pub topic: String,
    pub partitions: u32,
    pub schema: SchemaKind,
    pub json_schema: Option<String>,
    pub dispatch: DispatchMode,
}

/// Options for building a consumer session.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub name: String,
    pub topic: String,
    pub subscription: String,
    pub mode: SubscriptionMode,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn producer(&self, options: ProducerOptions) -> BrokerResult<Box<dyn ProducerSession>>;

    async fn consumer(&self, options: ConsumerOptions) -> BrokerResult<Box<dyn ConsumerSession>>;
}

#[async_trait]
pub trait ProducerSession: Send {
    /// Registers the producer (and its topic) with the broker.
    async fn create(&mut self) -> BrokerResult<()>;

    /// Publishes one payload, returning the broker-assigned message id.
    async fn send(&mut self, payload: Bytes) -> BrokerResult<u64>;
}

#[async_trait]
pub trait ConsumerSession: Send {
    /// Attaches to the subscription. Safe to call again after a failure.
    async fn subscribe(&mut self) -> BrokerResult<()>;

    /// Opens the delivery stream. Only valid after a successful subscribe.
    async fn receive(&mut self) -> BrokerResult<MessageStream>;

    async fn ack(&mut self, message: &Message) -> BrokerResult<()>;
}

/// Resolves a broker client for `service_url`.
pub fn connect(service_url: &str) -> BrokerResult<Arc<dyn BrokerClient>> {
    if service_url.starts_with(MEMORY_SCHEME) {
        Ok(Arc::new(MemoryBroker::new()))
    } else {
        Err(BrokerError::UnsupportedScheme(service_url.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_memory_scheme() {
        assert!(connect("memory://local").is_ok());
    }

    #[test]
    fn test_connect_unsupported_scheme() {
        match connect("127.0.0.1:6650") {
            Err(BrokerError::UnsupportedScheme(url)) => assert_eq!(url, "127.0.0.1:6650"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected an error"),
        }
    }
}

// src/rabbitmq/transport.rs
// The operations the runtime needs from an AMQP 0-9-1 client. Everything
// above this module is written against these traits only.

use super::errors::Result;
use super::topology::{BindingDefinition, ExchangeDefinition, QueueDefinition};
use crate::config::BrokerEndpoint;
use crate::message::Delivery;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Deliveries pushed by the broker for one consumer subscription.
///
/// The stream ends when the subscription is cancelled or the channel closes;
/// an `Err` item means the channel or connection failed underneath it.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishProperties {
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl PublishProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some("application/json".to_string()),
            ..Self::default()
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }
}

/// Factory for broker connections.
#[async_trait]
pub trait AmqpTransport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>>;

    async fn close(&self) -> Result<()>;
}

/// One logical channel. Callers must not use a channel from two tasks at
/// once; the channel pool hands each one to a single owner.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<()>;

    /// Returns the number of ready messages in the queue.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32>;

    /// Passive declare: ready message count of an existing queue.
    async fn queue_depth(&self, queue: &str) -> Result<u32>;

    async fn bind_queue(&self, def: &BindingDefinition) -> Result<()>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

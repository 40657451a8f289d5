// src/rabbitmq/publisher.rs

use super::channel_manager::{ChannelConfig, ChannelPool};
use super::errors::{RabbitMQError, Result};
use super::transport::PublishProperties;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// Publishes to one exchange through the channel pool.
#[derive(Clone)]
pub struct Publisher {
    channels: ChannelPool,
    exchange: String,
}

impl Publisher {
    pub fn new(channels: ChannelPool, exchange: &str) -> Self {
        Self {
            channels,
            exchange: exchange.to_string(),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let channel = self.channels.acquire(&ChannelConfig::default()).await?;
        // A failed channel is dropped, not returned to the pool.
        channel
            .publish(&self.exchange, routing_key, payload, properties)
            .await?;
        self.channels.release(channel).await;

        debug!(
            exchange = %self.exchange,
            routing_key,
            bytes = payload.len(),
            "Published message"
        );
        Ok(())
    }

    /// Serialize `message` as JSON and publish it with a fresh message id.
    pub async fn publish_json<T: Serialize>(&self, routing_key: &str, message: &T) -> Result<String> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| RabbitMQError::PublishError(format!("Failed to serialize message: {}", e)))?;
        let message_id = Uuid::new_v4().to_string();
        let properties = PublishProperties::json().with_message_id(message_id.clone());
        self.publish(routing_key, &payload, &properties).await?;
        Ok(message_id)
    }
}

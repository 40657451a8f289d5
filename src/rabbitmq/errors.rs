// src/rabbitmq/errors.rs

use lapin::Error as LapinError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Unroutable delivery on queue '{queue}' with routing key '{routing_key}'")]
    UnroutableDelivery { queue: String, routing_key: String },

    #[error("Handler exceeded its time budget of {0:?}")]
    HandlerTimeout(Duration),

    #[error("Handler failed permanently: {0}")]
    HandlerFatal(String),

    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Channel pool exhausted ({capacity} channels in use)")]
    PoolExhausted { capacity: usize },

    #[error("Connection recovery gave up after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },

    #[error("Topology error: {0}")]
    TopologyError(String),

    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    #[error("Consumer tag '{0}' is already in use")]
    ConsumerTagCollision(String),

    #[error("A handler is already registered for queue '{queue}' and route '{route}'")]
    DuplicateRoute { queue: String, route: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Delivery tag {delivery_tag} is not tracked on channel {channel}")]
    UnknownDeliveryTag { channel: u64, delivery_tag: u64 },

    #[error("Shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Operation timed out: {0}")]
    TimeoutError(String),
}

impl RabbitMQError {
    /// Broker-level failures the runtime recovers from on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RabbitMQError::ConnectionError(_) | RabbitMQError::ChannelError(_)
        )
    }
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

// lapin reports most failures through a handful of variants; everything that
// is not clearly channel-scoped is treated as a connection problem.
impl From<LapinError> for RabbitMQError {
    fn from(error: LapinError) -> Self {
        match &error {
            LapinError::InvalidChannel(_)
            | LapinError::InvalidChannelState(_)
            | LapinError::ChannelsLimitReached => RabbitMQError::ChannelError(error.to_string()),
            LapinError::ProtocolError(_) => RabbitMQError::ChannelError(error.to_string()),
            _ => RabbitMQError::ConnectionError(error.to_string()),
        }
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::TimeoutError("Connection timed out".to_string())
    }
}

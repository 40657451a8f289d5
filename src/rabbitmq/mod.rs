// src/rabbitmq/mod.rs
// Consumer runtime for RabbitMQ: connection recovery, channel pooling,
// elastic consumer pools, routing and acknowledgment tracking.

pub mod errors;
pub mod transport;
pub mod amqp_client;
pub mod in_memory;
pub mod topology;
pub mod connection;
pub mod channel_manager;
pub mod tracker;
pub mod dispatcher;
pub mod tag;
pub mod scaling;
pub mod consumer;
pub mod pool;
pub mod publisher;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinTransport;
pub use channel_manager::{ChannelConfig, ChannelPool, PooledChannel};
pub use connection::{ConnectionEvent, ConnectionManager};
pub use consumer::{ConsumerSnapshot, ConsumerState};
pub use dispatcher::{DispatchOutcome, DispatchRouter, RoutingKey};
pub use errors::{RabbitMQError, Result};
pub use in_memory::InMemoryBroker;
pub use pool::{ConsumerPool, PoolHandle, PoolStats, ShutdownReport};
pub use publisher::Publisher;
pub use scaling::{Autoscaler, BacklogProbe, BacklogSample, QueueDepthProbe, ScalingAction};
pub use tag::{ConsumerTagStrategy, IncrementingTagStrategy};
pub use topology::{BindingDefinition, ExchangeDefinition, ExchangeKind, QueueDefinition, Topology};
pub use tracker::AckTracker;
pub use transport::{AmqpChannel, AmqpConnection, AmqpTransport, PublishProperties};

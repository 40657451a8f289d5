// src/rabbitmq/topology.rs
// Exchange, queue and binding definitions, declared idempotently at startup
// and again after every connection recovery.

use super::errors::{RabbitMQError, Result};
use super::transport::AmqpChannel;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

/// Extra `x-` arguments passed through to the broker untouched.
pub type Arguments = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    pub name: String,
    #[serde(default)]
    pub kind: ExchangeKind,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default = "default_true")]
    pub durable: bool,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: Arguments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingDefinition {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    #[serde(default)]
    pub arguments: Arguments,
}

fn default_true() -> bool {
    true
}

impl ExchangeDefinition {
    pub fn new(name: &str, kind: ExchangeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            durable: true,
            auto_delete: false,
            arguments: Arguments::new(),
        }
    }
}

impl QueueDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: Arguments::new(),
        }
    }

    pub fn with_argument(mut self, key: &str, value: serde_json::Value) -> Self {
        self.arguments.insert(key.to_string(), value);
        self
    }
}

impl BindingDefinition {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> Self {
        Self {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments: Arguments::new(),
        }
    }
}

/// Everything the runtime declares on the broker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub exchanges: Vec<ExchangeDefinition>,
    #[serde(default)]
    pub queues: Vec<QueueDefinition>,
    #[serde(default)]
    pub bindings: Vec<BindingDefinition>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn binding(mut self, def: BindingDefinition) -> Self {
        self.bindings.push(def);
        self
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    /// Reject duplicate names and bindings that point at nothing.
    ///
    /// The default exchange (`""`) and the broker's predeclared `amq.*`
    /// exchanges may be bound to without being declared here.
    pub fn validate(&self) -> Result<()> {
        let mut exchanges = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.name.is_empty() || exchange.name.starts_with("amq.") {
                return Err(RabbitMQError::TopologyError(format!(
                    "exchange name '{}' is reserved",
                    exchange.name
                )));
            }
            if !exchanges.insert(exchange.name.as_str()) {
                return Err(RabbitMQError::TopologyError(format!(
                    "exchange '{}' declared twice",
                    exchange.name
                )));
            }
        }

        let mut queues = HashSet::new();
        for queue in &self.queues {
            if queue.name.is_empty() {
                return Err(RabbitMQError::TopologyError(
                    "queue name must not be empty".to_string(),
                ));
            }
            if !queues.insert(queue.name.as_str()) {
                return Err(RabbitMQError::TopologyError(format!(
                    "queue '{}' declared twice",
                    queue.name
                )));
            }
        }

        for binding in &self.bindings {
            if !queues.contains(binding.queue.as_str()) {
                return Err(RabbitMQError::TopologyError(format!(
                    "binding refers to undeclared queue '{}'",
                    binding.queue
                )));
            }
            let predeclared = binding.exchange.is_empty() || binding.exchange.starts_with("amq.");
            if !predeclared && !exchanges.contains(binding.exchange.as_str()) {
                return Err(RabbitMQError::TopologyError(format!(
                    "binding refers to undeclared exchange '{}'",
                    binding.exchange
                )));
            }
        }

        Ok(())
    }

    /// Declare exchanges, then queues, then bindings on `channel`.
    ///
    /// AMQP declarations are idempotent as long as the definitions do not
    /// change, so this is safe to call again after a reconnect.
    pub async fn declare(&self, channel: &dyn AmqpChannel) -> Result<()> {
        for exchange in &self.exchanges {
            channel.declare_exchange(exchange).await.map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "Failed to declare exchange {}: {}",
                    exchange.name, e
                ))
            })?;
            debug!(exchange = %exchange.name, kind = ?exchange.kind, "Exchange declared");
        }

        for queue in &self.queues {
            let depth = channel.declare_queue(queue).await.map_err(|e| {
                RabbitMQError::TopologyError(format!("Failed to declare queue {}: {}", queue.name, e))
            })?;
            debug!(queue = %queue.name, messages = depth, "Queue declared");
        }

        for binding in &self.bindings {
            channel.bind_queue(binding).await.map_err(|e| {
                RabbitMQError::TopologyError(format!(
                    "Failed to bind queue {} to {}: {}",
                    binding.queue, binding.exchange, e
                ))
            })?;
        }

        info!(
            exchanges = self.exchanges.len(),
            queues = self.queues.len(),
            bindings = self.bindings.len(),
            "Topology declared"
        );
        Ok(())
    }
}

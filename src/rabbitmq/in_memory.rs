// src/rabbitmq/in_memory.rs
// A single-process broker that behaves like RabbitMQ for the parts the
// runtime relies on: exchange routing, per-channel prefetch, unacked
// tracking, requeue on channel loss and broker-side dead-lettering.
// It can also drop every connection or refuse new ones to exercise recovery.

use super::errors::{RabbitMQError, Result};
use super::topology::{BindingDefinition, ExchangeDefinition, ExchangeKind, QueueDefinition};
use super::transport::{
    AmqpChannel, AmqpConnection, AmqpTransport, DeliveryStream, PublishProperties,
};
use crate::config::BrokerEndpoint;
use crate::message::Delivery;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type ChannelKey = (u64, u16);

/// Counters a test can assert on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connections_opened: u64,
    pub connections_refused: u64,
    pub channels_opened: u64,
    pub exchange_declarations: u64,
    pub queue_declarations: u64,
    pub binding_declarations: u64,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
}

/// A message waiting in, or copied out of, a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: PublishProperties,
    pub redelivered: bool,
    /// How many times the message was handed back to the queue.
    pub delivery_count: u32,
}

#[derive(Clone)]
struct ConsumerEntry {
    tag: String,
    channel: ChannelKey,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerEntry>,
    next_consumer: usize,
}

struct Unacked {
    queue: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct ChannelState {
    prefetch: u16,
    last_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<BindingDefinition>,
    connections: HashSet<u64>,
    channels: HashMap<ChannelKey, ChannelState>,
    next_connection: u64,
    next_channel: HashMap<u64, u16>,
    refuse_connections: u32,
    stats: BrokerStats,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let mut state = BrokerState::default();
        for (name, kind) in [
            ("amq.direct", ExchangeKind::Direct),
            ("amq.fanout", ExchangeKind::Fanout),
            ("amq.topic", ExchangeKind::Topic),
            ("amq.headers", ExchangeKind::Headers),
        ] {
            state
                .exchanges
                .insert(name.to_string(), ExchangeDefinition::new(name, kind));
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panicking test thread must not wedge every other broker user.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    /// Drop every open connection as if the network failed.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let connections: Vec<u64> = state.connections.iter().copied().collect();
        for connection in connections {
            state.close_connection(connection, true);
        }
        warn!("In-memory broker severed all connections");
    }

    /// Refuse the next `attempts` connection attempts.
    pub fn refuse_connections(&self, attempts: u32) {
        self.lock().refuse_connections = attempts;
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    /// Ready (not yet delivered) messages in `queue`.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Delivered but not yet acknowledged messages from `queue`.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|u| u.queue == queue)
            .count()
    }

    pub fn consumer_tags(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    /// Copies of the ready messages in `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Publish without a client connection.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: PublishProperties,
    ) -> Result<()> {
        let mut state = self.lock();
        state.route(exchange, routing_key, payload.to_vec(), properties)?;
        state.pump();
        Ok(())
    }
}

impl BrokerState {
    fn close_channel(&mut self, key: ChannelKey, failed: bool) {
        for queue in self.queues.values_mut() {
            queue.consumers.retain(|consumer| {
                if consumer.channel != key {
                    return true;
                }
                if failed {
                    let _ = consumer.sender.send(Err(RabbitMQError::ConnectionError(
                        "connection reset by broker".to_string(),
                    )));
                }
                false
            });
        }

        if let Some(channel) = self.channels.remove(&key) {
            // Unacked messages go back to the head of their queue, in order.
            for (_, unacked) in channel.unacked.into_iter().rev() {
                let mut message = unacked.message;
                message.redelivered = true;
                message.delivery_count += 1;
                if let Some(queue) = self.queues.get_mut(&unacked.queue) {
                    queue.ready.push_front(message);
                }
            }
        }
    }

    fn close_connection(&mut self, connection: u64, failed: bool) {
        self.connections.remove(&connection);
        let keys: Vec<ChannelKey> = self
            .channels
            .keys()
            .filter(|(conn, _)| *conn == connection)
            .copied()
            .collect();
        for key in keys {
            self.close_channel(key, failed);
        }
        self.pump();
    }

    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: PublishProperties,
    ) -> Result<()> {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let def = self.exchanges.get(exchange).ok_or_else(|| {
                RabbitMQError::ChannelError(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            let mut targets: Vec<String> = self
                .bindings
                .iter()
                .filter(|b| b.exchange == exchange)
                .filter(|b| binding_matches(def.kind, b, routing_key, &properties))
                .map(|b| b.queue.clone())
                .collect();
            targets.sort();
            targets.dedup();
            targets
        };

        self.stats.published += 1;
        let message = QueuedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            properties,
            redelivered: false,
            delivery_count: 0,
        };
        for target in targets {
            match self.queues.get_mut(&target) {
                Some(queue) => queue.ready.push_back(message.clone()),
                None => debug!(queue = %target, "Dropping message for missing queue"),
            }
        }
        Ok(())
    }

    fn pump(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.pump_queue(&name);
        }
    }

    fn pump_queue(&mut self, name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let mut chosen = None;
            for offset in 0..count {
                let idx = (queue.next_consumer + offset) % count;
                let has_room = self
                    .channels
                    .get(&queue.consumers[idx].channel)
                    .is_some_and(|c| c.prefetch == 0 || c.unacked.len() < usize::from(c.prefetch));
                if has_room {
                    chosen = Some(idx);
                    break;
                }
            }
            let Some(idx) = chosen else {
                return;
            };
            queue.next_consumer = (idx + 1) % count;

            let consumer = queue.consumers[idx].clone();
            let Some(channel) = self.channels.get_mut(&consumer.channel) else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            channel.last_tag += 1;
            let tag = channel.last_tag;
            let quorum = queue
                .def
                .arguments
                .get("x-queue-type")
                .and_then(|v| v.as_str())
                == Some("quorum");
            let delivery = to_delivery(&message, name, &consumer.tag, tag, quorum);

            match consumer.sender.send(Ok(delivery)) {
                Ok(()) => {
                    channel.unacked.insert(
                        tag,
                        Unacked {
                            queue: name.to_string(),
                            message,
                        },
                    );
                    self.stats.delivered += 1;
                }
                Err(_) => {
                    queue
                        .consumers
                        .retain(|c| !(c.tag == consumer.tag && c.channel == consumer.channel));
                    queue.ready.push_front(message);
                }
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, mut message: QueuedMessage) {
        let Some(def) = self.queues.get(queue).map(|q| q.def.clone()) else {
            return;
        };
        let Some(exchange) = def
            .arguments
            .get("x-dead-letter-exchange")
            .and_then(|v| v.as_str())
        else {
            return;
        };
        let routing_key = def
            .arguments
            .get("x-dead-letter-routing-key")
            .and_then(|v| v.as_str())
            .unwrap_or(message.routing_key.as_str())
            .to_string();
        message
            .properties
            .headers
            .insert("x-first-death-queue".to_string(), queue.to_string());
        if let Err(e) = self.route(exchange, &routing_key, message.payload, message.properties) {
            warn!(error = %e, "Broker-side dead-lettering failed");
        }
    }
}

fn to_delivery(
    message: &QueuedMessage,
    queue: &str,
    consumer_tag: &str,
    delivery_tag: u64,
    quorum: bool,
) -> Delivery {
    let mut headers = message.properties.headers.clone();
    let broker_delivery_count = if quorum && message.delivery_count > 0 {
        headers.insert(
            "x-delivery-count".to_string(),
            message.delivery_count.to_string(),
        );
        Some(message.delivery_count)
    } else {
        None
    };

    Delivery {
        delivery_tag,
        channel: 0,
        consumer_tag: consumer_tag.to_string(),
        queue: queue.to_string(),
        exchange: message.exchange.clone(),
        routing_key: message.routing_key.clone(),
        redelivered: message.redelivered,
        redelivery_count: 0,
        broker_delivery_count,
        message_id: message.properties.message_id.clone(),
        content_type: message.properties.content_type.clone(),
        headers,
        payload: message.payload.clone(),
        received_at: Utc::now(),
    }
}

fn binding_matches(
    kind: ExchangeKind,
    binding: &BindingDefinition,
    routing_key: &str,
    properties: &PublishProperties,
) -> bool {
    match kind {
        ExchangeKind::Direct => binding.routing_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
        ExchangeKind::Headers => headers_match(binding, properties),
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` is zero or more.
pub(crate) fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

fn headers_match(binding: &BindingDefinition, properties: &PublishProperties) -> bool {
    let match_any = binding.arguments.get("x-match").and_then(|v| v.as_str()) == Some("any");
    let mut expected = binding
        .arguments
        .iter()
        .filter(|(key, _)| !key.starts_with("x-"))
        .map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            properties.headers.get(key) == Some(&value)
        });
    if match_any {
        expected.any(|hit| hit)
    } else {
        expected.all(|hit| hit)
    }
}

#[async_trait]
impl AmqpTransport for InMemoryBroker {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn AmqpConnection>> {
        let mut state = self.lock();
        if state.refuse_connections > 0 {
            state.refuse_connections -= 1;
            state.stats.connections_refused += 1;
            return Err(RabbitMQError::ConnectionError(format!(
                "Connection refused by {}",
                endpoint.display_address()
            )));
        }
        state.next_connection += 1;
        let id = state.next_connection;
        state.connections.insert(id);
        state.stats.connections_opened += 1;
        debug!(connection = id, "In-memory connection opened");
        Ok(Arc::new(InMemoryConnection {
            broker: self.clone(),
            id,
        }))
    }
}

pub struct InMemoryConnection {
    broker: InMemoryBroker,
    id: u64,
}

#[async_trait]
impl AmqpConnection for InMemoryConnection {
    fn is_connected(&self) -> bool {
        self.broker.lock().connections.contains(&self.id)
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        let mut state = self.broker.lock();
        if !state.connections.contains(&self.id) {
            return Err(RabbitMQError::ConnectionError(
                "Connection is closed".to_string(),
            ));
        }
        let next = state.next_channel.entry(self.id).or_insert(0);
        *next += 1;
        let key = (self.id, *next);
        state.channels.insert(key, ChannelState::default());
        state.stats.channels_opened += 1;
        Ok(Box::new(InMemoryChannel {
            broker: self.broker.clone(),
            key,
        }))
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_connection(self.id, false);
        Ok(())
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    key: ChannelKey,
}

impl InMemoryChannel {
    fn open_state<'a>(&self, state: &'a mut BrokerState) -> Result<&'a mut ChannelState> {
        state
            .channels
            .get_mut(&self.key)
            .ok_or_else(|| RabbitMQError::ChannelError(format!("Channel {} is closed", self.key.1)))
    }
}

#[async_trait]
impl AmqpChannel for InMemoryChannel {
    fn id(&self) -> u16 {
        self.key.1
    }

    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.key)
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.broker.lock();
        self.open_state(&mut state)?.prefetch = count;
        state.pump();
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<()> {
        let mut state = self.broker.lock();
        self.open_state(&mut state)?;
        if let Some(existing) = state.exchanges.get(&def.name) {
            if existing.kind != def.kind || existing.durable != def.durable {
                return Err(RabbitMQError::ChannelError(format!(
                    "PRECONDITION_FAILED - inequivalent arg for exchange '{}'",
                    def.name
                )));
            }
        }
        state.exchanges.insert(def.name.clone(), def.clone());
        state.stats.exchange_declarations += 1;
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32> {
        let mut state = self.broker.lock();
        self.open_state(&mut state)?;
        state.stats.queue_declarations += 1;
        let queue = state
            .queues
            .entry(def.name.clone())
            .or_insert_with(|| QueueState {
                def: def.clone(),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
            });
        if queue.def.durable != def.durable || queue.def.arguments != def.arguments {
            return Err(RabbitMQError::ChannelError(format!(
                "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                def.name
            )));
        }
        Ok(queue.ready.len() as u32)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let mut state = self.broker.lock();
        self.open_state(&mut state)?;
        state
            .queues
            .get(queue)
            .map(|q| q.ready.len() as u32)
            .ok_or_else(|| RabbitMQError::ChannelError(format!("NOT_FOUND - no queue '{}'", queue)))
    }

    async fn bind_queue(&self, def: &BindingDefinition) -> Result<()> {
        let mut state = self.broker.lock();
        self.open_state(&mut state)?;
        if !state.queues.contains_key(&def.queue) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no queue '{}'",
                def.queue
            )));
        }
        if !state.exchanges.contains_key(&def.exchange) {
            return Err(RabbitMQError::ChannelError(format!(
                "NOT_FOUND - no exchange '{}'",
                def.exchange
            )));
        }
        state.stats.binding_declarations += 1;
        if !state.bindings.contains(def) {
            state.bindings.push(def.clone());
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let (sender, receiver) = mpsc::unbounded_channel();
        {
            let mut state = self.broker.lock();
            self.open_state(&mut state)?;
            let key = self.key;
            let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
                RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            let duplicate = queue_state
                .consumers
                .iter()
                .any(|c| c.tag == consumer_tag && c.channel == key);
            if duplicate {
                return Err(RabbitMQError::ConsumeError(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                    consumer_tag
                )));
            }
            queue_state.consumers.push(ConsumerEntry {
                tag: consumer_tag.to_string(),
                channel: key,
                sender,
            });
            state.pump();
        }

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        let key = self.key;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel == key));
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.broker.lock();
        let channel = self.open_state(&mut state)?;
        if channel.unacked.remove(&delivery_tag).is_none() {
            return Err(RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        }
        state.stats.acked += 1;
        state.pump();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let channel = self.open_state(&mut state)?;
        let Some(unacked) = channel.unacked.remove(&delivery_tag) else {
            return Err(RabbitMQError::AckError(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery_tag
            )));
        };

        let mut message = unacked.message;
        if requeue {
            message.redelivered = true;
            message.delivery_count += 1;
            if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                queue.ready.push_front(message);
            }
            state.stats.requeued += 1;
        } else {
            state.stats.discarded += 1;
            state.dead_letter(&unacked.queue, message);
        }
        state.pump();
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut state = self.broker.lock();
        self.open_state(&mut state)?;
        state
            .route(exchange, routing_key, payload.to_vec(), properties.clone())
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        state.pump();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state.close_channel(self.key, false);
        state.pump();
        Ok(())
    }
}

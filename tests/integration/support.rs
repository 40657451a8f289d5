use rabbit_consumer::config::{DeadLetterConfig, RuntimeConfig};
use rabbit_consumer::rabbitmq::{
    BindingDefinition, ChannelPool, ConnectionManager, ExchangeDefinition, ExchangeKind,
    InMemoryBroker, PublishProperties, QueueDefinition, Topology,
};
use std::sync::Arc;
use std::time::Duration;

pub const QUEUE: &str = "orders.add";
pub const EXCHANGE: &str = "orders";
pub const DEAD_LETTER_EXCHANGE: &str = "orders.dlx";
pub const DEAD_LETTER_QUEUE: &str = "orders.dead";

pub fn topology() -> Topology {
    Topology::new()
        .exchange(ExchangeDefinition::new(EXCHANGE, ExchangeKind::Direct))
        .exchange(ExchangeDefinition::new(DEAD_LETTER_EXCHANGE, ExchangeKind::Fanout))
        .queue(QueueDefinition::new(QUEUE))
        .queue(QueueDefinition::new(DEAD_LETTER_QUEUE))
        .binding(BindingDefinition::new(QUEUE, EXCHANGE, "add"))
        .binding(BindingDefinition::new(QUEUE, EXCHANGE, "unknown"))
        .binding(BindingDefinition::new(DEAD_LETTER_QUEUE, DEAD_LETTER_EXCHANGE, ""))
}

/// Fast timings, fixed pool size and no autoscaling.
pub fn config(min: usize, max: usize) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.topology = topology();
    config.consumer.queue = QUEUE.to_string();
    config.consumer.min_concurrency = min;
    config.consumer.max_concurrency = max;
    config.consumer.max_in_flight = 10;
    config.consumer.shutdown_timeout_ms = 500;
    config.dispatch.handler_timeout_ms = 2_000;
    config.recovery.network_recovery_interval_ms = 20;
    config.recovery.watchdog_interval_ms = 20;
    config.channel_pool.capacity = max + 2;
    config.scaling.enabled = false;
    config
}

pub fn with_dead_letter(mut config: RuntimeConfig) -> RuntimeConfig {
    config.dispatch.dead_letter = Some(DeadLetterConfig {
        exchange: DEAD_LETTER_EXCHANGE.to_string(),
        routing_key: None,
    });
    config
}

pub async fn connect(
    broker: &InMemoryBroker,
    config: &RuntimeConfig,
) -> (Arc<ConnectionManager>, ChannelPool) {
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        config.endpoint.clone(),
        config.topology.clone(),
        config.recovery.clone(),
    ));
    manager.connect().await.expect("in-memory broker accepts connections");
    let channels = ChannelPool::new(Arc::clone(&manager), config.channel_pool.capacity);
    (manager, channels)
}

pub fn publish(broker: &InMemoryBroker, routing_key: &str, id: &str) {
    let properties = PublishProperties::json().with_message_id(id);
    let payload = format!(r#"{{"order_id":"{}"}}"#, id);
    broker
        .publish(EXCHANGE, routing_key, payload.as_bytes(), properties)
        .expect("publish to declared exchange");
}

/// Publish without a message id, leaving the queue's redelivered flag as
/// the only hint the broker gives on a retry.
pub fn publish_anonymous(broker: &InMemoryBroker, routing_key: &str, payload: &str) {
    broker
        .publish(EXCHANGE, routing_key, payload.as_bytes(), PublishProperties::json())
        .expect("publish to declared exchange");
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    waited.is_ok()
}

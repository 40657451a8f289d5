use crate::support::{self, eventually, publish, QUEUE};
use async_trait::async_trait;
use rabbit_consumer::rabbitmq::{
    BacklogProbe, ChannelConfig, ChannelPool, ConsumerPool, ConsumerState, DispatchRouter,
    InMemoryBroker, RabbitMQError, RoutingKey,
};
use rabbit_consumer::{Delivery, HandlerError};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn ack_all(config: &rabbit_consumer::config::RuntimeConfig) -> DispatchRouter {
    DispatchRouter::new(&config.dispatch)
        .route(QUEUE, RoutingKey::Default, |_: Delivery| async {
            Ok::<(), HandlerError>(())
        })
        .unwrap()
}

#[tokio::test]
async fn start_rejects_inverted_bounds() {
    let broker = InMemoryBroker::new();
    let config = support::config(3, 3);
    let (manager, channels) = support::connect(&broker, &config).await;

    let mut inverted = config.clone();
    inverted.consumer.min_concurrency = 4;
    let started = ConsumerPool::new(manager, channels, ack_all(&config), &inverted)
        .start()
        .await;
    assert!(matches!(started, Err(RabbitMQError::ConfigError(_))));
    assert!(broker.consumer_tags(QUEUE).is_empty());
}

#[tokio::test]
async fn start_rejects_invalid_configuration_without_subscribing() {
    let broker = InMemoryBroker::new();
    let config = support::config(2, 2);
    let (manager, channels) = support::connect(&broker, &config).await;
    let opened = broker.stats().channels_opened;

    let mut no_in_flight = config.clone();
    no_in_flight.consumer.max_in_flight = 0;
    let started = tokio::time::timeout(
        Duration::from_secs(1),
        ConsumerPool::new(manager.clone(), channels.clone(), ack_all(&config), &no_in_flight).start(),
    )
    .await
    .expect("start returns instead of waiting for a slot");
    assert!(matches!(started, Err(RabbitMQError::ConfigError(msg)) if msg.contains("max_in_flight")));

    let mut no_sampling = config.clone();
    no_sampling.scaling.sample_interval_ms = 0;
    let started = ConsumerPool::new(manager, channels, ack_all(&config), &no_sampling)
        .start()
        .await;
    assert!(matches!(started, Err(RabbitMQError::ConfigError(msg)) if msg.contains("sample_interval_ms")));

    assert!(broker.consumer_tags(QUEUE).is_empty());
    assert_eq!(broker.stats().channels_opened, opened);
}

#[tokio::test]
async fn start_rejects_routes_for_other_queues() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 1);
    let (manager, channels) = support::connect(&broker, &config).await;

    let router = ack_all(&config)
        .route("orders.cancel", RoutingKey::Default, |_: Delivery| async {
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    let started = ConsumerPool::new(manager, channels, router, &config).start().await;
    assert!(matches!(started, Err(RabbitMQError::ConfigError(_))));
}

#[tokio::test]
async fn starts_min_consumers_and_clamps_scale_requests() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 3);
    let (manager, channels) = support::connect(&broker, &config).await;
    let pool = ConsumerPool::new(manager, channels, ack_all(&config), &config)
        .start()
        .await
        .unwrap();
    assert_eq!(pool.bounds(), (1, 3));
    assert_eq!(pool.active_consumers(), 1);

    assert_eq!(pool.scale(10).await.unwrap(), 3);
    pool.wait_for_active(3, Duration::from_secs(5)).await.unwrap();
    assert_eq!(broker.consumer_tags(QUEUE).len(), 3);

    assert_eq!(pool.scale(0).await.unwrap(), 1);
    assert!(eventually(Duration::from_secs(5), || pool.consumer_count() == 1).await);
    assert_eq!(broker.consumer_tags(QUEUE).len(), 1);

    let snapshots = pool.consumers();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].state, ConsumerState::Active);
    assert_eq!(snapshots[0].queue, QUEUE);
    assert!(snapshots[0].channel.is_some());

    let report = pool.stop().await.unwrap();
    assert_eq!(report.consumers_stopped, 1);
    assert!(broker.consumer_tags(QUEUE).is_empty());
}

#[tokio::test]
async fn shutdown_requeues_deliveries_still_in_flight() {
    let broker = InMemoryBroker::new();
    let mut config = support::config(1, 1);
    config.consumer.shutdown_timeout_ms = 100;
    config.dispatch.handler_timeout_ms = 30_000;
    let (manager, channels) = support::connect(&broker, &config).await;

    let started = Arc::new(AtomicUsize::new(0));
    let handler = {
        let started = Arc::clone(&started);
        move |_: Delivery| {
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<(), HandlerError>(())
            }
        }
    };
    let router = DispatchRouter::new(&config.dispatch)
        .route(QUEUE, RoutingKey::key("add"), handler)
        .unwrap();
    let pool = ConsumerPool::new(manager, channels, router, &config)
        .start()
        .await
        .unwrap();

    publish(&broker, "add", "order-1");
    publish(&broker, "add", "order-2");
    assert!(eventually(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 2).await);

    let report = tokio::time::timeout(Duration::from_secs(2), pool.stop())
        .await
        .expect("stop is bounded by the shutdown timeout")
        .unwrap();
    assert_eq!(report.forced_requeues, 2);
    assert_eq!(broker.ready_count(QUEUE), 2);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert!(broker.messages(QUEUE).iter().all(|m| m.redelivered));
}

#[tokio::test]
async fn shutdown_lets_running_handlers_finish() {
    let broker = InMemoryBroker::new();
    let mut config = support::config(1, 1);
    config.consumer.shutdown_timeout_ms = 2_000;
    let (manager, channels) = support::connect(&broker, &config).await;

    let started = Arc::new(AtomicUsize::new(0));
    let handler = {
        let started = Arc::clone(&started);
        move |_: Delivery| {
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<(), HandlerError>(())
            }
        }
    };
    let router = DispatchRouter::new(&config.dispatch)
        .route(QUEUE, RoutingKey::key("add"), handler)
        .unwrap();
    let pool = ConsumerPool::new(manager, channels, router, &config)
        .start()
        .await
        .unwrap();

    publish(&broker, "add", "order-1");
    assert!(eventually(Duration::from_secs(5), || started.load(Ordering::SeqCst) == 1).await);

    let report = pool.stop().await.unwrap();
    assert_eq!(report.forced_requeues, 0);
    assert_eq!(broker.stats().acked, 1);
    assert_eq!(broker.unacked_count(QUEUE), 0);
}

#[tokio::test]
async fn channel_pool_exhaustion_is_reported_or_waited_out() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 1);
    let (manager, _) = support::connect(&broker, &config).await;
    let channels = ChannelPool::new(manager, 1);

    let held = channels.acquire(&ChannelConfig::default()).await.unwrap();
    assert_eq!(channels.in_use(), 1);
    assert!(matches!(
        channels.try_acquire(&ChannelConfig::default()).await,
        Err(RabbitMQError::PoolExhausted { capacity: 1 })
    ));

    let waiter = {
        let channels = channels.clone();
        tokio::spawn(async move { channels.acquire(&ChannelConfig::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    let key = held.key();
    channels.release(held).await;
    let reused = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter gets the released channel")
        .unwrap()
        .unwrap();
    assert_eq!(reused.key(), key);
    assert_eq!(broker.stats().channels_opened, 2);
}

#[tokio::test]
async fn colliding_consumer_tags_are_rejected() {
    let broker = InMemoryBroker::new();
    let config = support::config(2, 2);
    let (manager, channels) = support::connect(&broker, &config).await;

    let started = ConsumerPool::new(manager, channels, ack_all(&config), &config)
        .with_tag_strategy(|_: &str| "orders-worker".to_string())
        .start()
        .await;
    assert!(matches!(
        started,
        Err(RabbitMQError::ConsumerTagCollision(tag)) if tag == "orders-worker"
    ));
    assert!(eventually(Duration::from_secs(1), || broker.consumer_tags(QUEUE).is_empty()).await);
}

#[tokio::test]
async fn a_fixed_tag_caps_the_pool_at_one_consumer() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 3);
    let (manager, channels) = support::connect(&broker, &config).await;

    let pool = ConsumerPool::new(manager, channels, ack_all(&config), &config)
        .with_tag_strategy(|queue: &str| format!("{}-only", queue))
        .start()
        .await
        .unwrap();
    assert_eq!(pool.scale(3).await.unwrap(), 1);
    assert_eq!(broker.consumer_tags(QUEUE), vec!["orders.add-only".to_string()]);
    pool.stop().await.unwrap();
}

struct FixedBacklog(Arc<AtomicU32>);

#[async_trait]
impl BacklogProbe for FixedBacklog {
    async fn backlog(&self) -> rabbit_consumer::rabbitmq::Result<u32> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[tokio::test]
async fn backlog_drives_the_consumer_count_between_bounds() {
    let broker = InMemoryBroker::new();
    let mut config = support::config(1, 3);
    config.scaling.enabled = true;
    config.scaling.sample_interval_ms = 10;
    config.scaling.consecutive_active_trigger = 2;
    config.scaling.consecutive_idle_trigger = 2;
    config.scaling.start_consumer_min_interval_ms = 0;
    config.scaling.stop_consumer_min_interval_ms = 0;
    let (manager, channels) = support::connect(&broker, &config).await;

    let backlog = Arc::new(AtomicU32::new(500));
    let pool = ConsumerPool::new(manager, channels, ack_all(&config), &config)
        .with_backlog_probe(FixedBacklog(Arc::clone(&backlog)))
        .start()
        .await
        .unwrap();

    pool.wait_for_active(3, Duration::from_secs(5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.consumer_count(), 3);

    backlog.store(0, Ordering::SeqCst);
    assert!(eventually(Duration::from_secs(5), || pool.consumer_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.consumer_count(), 1);
    pool.stop().await.unwrap();
}

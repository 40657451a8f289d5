use crate::support::{self, eventually, publish, QUEUE};
use rabbit_consumer::rabbitmq::{
    ConnectionEvent, ConsumerPool, DispatchRouter, InMemoryBroker, RabbitMQError, RoutingKey,
};
use rabbit_consumer::{Delivery, HandlerError};
use std::time::Duration;

fn router(config: &rabbit_consumer::config::RuntimeConfig) -> DispatchRouter {
    DispatchRouter::new(&config.dispatch)
        .route(QUEUE, RoutingKey::Default, |_: Delivery| async {
            Ok::<(), HandlerError>(())
        })
        .unwrap()
}

fn sorted(mut tags: Vec<String>) -> Vec<String> {
    tags.sort();
    tags
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumers_resume_with_their_tags_after_the_connection_drops() {
    let broker = InMemoryBroker::new();
    let config = support::config(3, 3);
    let (manager, channels) = support::connect(&broker, &config).await;
    let mut events = manager.subscribe();

    let pool = ConsumerPool::new(manager.clone(), channels, router(&config), &config)
        .start()
        .await
        .unwrap();
    let tags = sorted(broker.consumer_tags(QUEUE));
    assert_eq!(tags, vec!["orders-add-1", "orders-add-2", "orders-add-3"]);
    let declared_queues = broker.stats().queue_declarations;
    assert_eq!(declared_queues, config.topology.queues.len() as u64);

    broker.sever_connections();

    assert!(
        eventually(Duration::from_secs(5), || {
            manager.generation() == 2 && sorted(broker.consumer_tags(QUEUE)) == tags
        })
        .await
    );
    assert!(pool.wait_for_active(3, Duration::from_secs(5)).await.is_ok());

    // One recovery for all three consumers.
    assert_eq!(broker.open_connections(), 1);
    assert_eq!(
        broker.stats().queue_declarations,
        2 * config.topology.queues.len() as u64
    );

    let mut recovered = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ConnectionEvent::Recovered { generation: 2, .. }) {
            recovered += 1;
        }
    }
    assert_eq!(recovered, 1);

    publish(&broker, "add", "after-recovery");
    assert!(eventually(Duration::from_secs(5), || pool.stats().acked == 1).await);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn refused_reconnects_are_retried() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 1);
    let (manager, channels) = support::connect(&broker, &config).await;
    let pool = ConsumerPool::new(manager.clone(), channels, router(&config), &config)
        .start()
        .await
        .unwrap();

    broker.refuse_connections(2);
    broker.sever_connections();

    assert!(eventually(Duration::from_secs(5), || manager.generation() == 2).await);
    assert!(pool.wait_for_active(1, Duration::from_secs(5)).await.is_ok());
    assert_eq!(broker.stats().connections_refused, 2);
    assert!(!manager.is_fatal());
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn recovery_gives_up_after_the_attempt_limit() {
    let broker = InMemoryBroker::new();
    let mut config = support::config(2, 2);
    config.recovery.max_attempts = Some(3);
    let (manager, channels) = support::connect(&broker, &config).await;
    let pool = ConsumerPool::new(manager.clone(), channels, router(&config), &config)
        .start()
        .await
        .unwrap();

    broker.refuse_connections(u32::MAX);
    broker.sever_connections();

    let fatal = tokio::time::timeout(Duration::from_secs(5), pool.fatal())
        .await
        .expect("recovery should give up");
    assert!(matches!(fatal, RabbitMQError::RecoveryExhausted { attempts: 3 }));
    assert!(manager.is_fatal());
    assert_eq!(broker.stats().connections_refused, 3);

    // Failed consumers are not restarted once the connection is gone for good.
    assert!(eventually(Duration::from_secs(5), || pool.consumer_count() == 0).await);
    let report = pool.stop().await.unwrap();
    assert_eq!(report.forced_requeues, 0);
}

#[tokio::test]
async fn in_flight_deliveries_come_back_after_recovery() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 1);
    let (manager, channels) = support::connect(&broker, &config).await;

    let router = DispatchRouter::new(&config.dispatch)
        .route(QUEUE, RoutingKey::key("add"), |delivery: Delivery| async move {
            if !delivery.redelivered {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    let pool = ConsumerPool::new(manager.clone(), channels, router, &config)
        .start()
        .await
        .unwrap();

    publish(&broker, "add", "order-interrupted");
    assert!(eventually(Duration::from_secs(5), || broker.unacked_count(QUEUE) == 1).await);
    broker.sever_connections();

    assert!(eventually(Duration::from_secs(5), || pool.stats().acked == 1).await);
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    pool.stop().await.unwrap();
}

use crate::support::{self, eventually, publish, publish_anonymous, DEAD_LETTER_QUEUE, QUEUE};
use rabbit_consumer::rabbitmq::consumer::{
    HEADER_FAILURE_REASON, HEADER_ORIGINAL_EXCHANGE, HEADER_ORIGINAL_QUEUE,
    HEADER_ORIGINAL_ROUTING_KEY, HEADER_REDELIVERY_COUNT,
};
use rabbit_consumer::rabbitmq::{ConsumerPool, DispatchRouter, InMemoryBroker, RoutingKey};
use rabbit_consumer::{Delivery, HandlerError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_delivery_is_handled_and_acked_once() {
    let broker = InMemoryBroker::new();
    let config = support::config(4, 4);
    let (manager, channels) = support::connect(&broker, &config).await;

    let seen = Arc::new(Mutex::new(HashSet::new()));
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let seen = Arc::clone(&seen);
        let calls = Arc::clone(&calls);
        move |delivery: Delivery| {
            let seen = Arc::clone(&seen);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(delivery.redelivery_count, 0);
                if let Some(id) = delivery.message_id {
                    seen.lock().unwrap().insert(id);
                }
                Ok::<(), HandlerError>(())
            }
        }
    };
    let mut router = DispatchRouter::new(&config.dispatch);
    router.register(QUEUE, RoutingKey::key("add"), handler).unwrap();

    let pool = ConsumerPool::new(manager, channels, router, &config)
        .start()
        .await
        .unwrap();
    for n in 0..1000 {
        publish(&broker, "add", &format!("order-{}", n));
    }

    assert!(eventually(Duration::from_secs(10), || broker.stats().acked == 1000).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1000);
    assert_eq!(seen.lock().unwrap().len(), 1000);

    let stats = broker.stats();
    assert_eq!(stats.requeued, 0);
    assert_eq!(stats.discarded, 0);
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    assert_eq!(pool.stats().acked, 1000);

    let report = pool.stop().await.unwrap();
    assert_eq!(report.consumers_stopped, 4);
    assert_eq!(report.forced_requeues, 0);
}

#[tokio::test]
async fn recoverable_failures_are_retried_with_a_growing_count() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 1);
    let (manager, channels) = support::connect(&broker, &config).await;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let observed = Arc::clone(&observed);
        move |delivery: Delivery| {
            let observed = Arc::clone(&observed);
            async move {
                let attempts = {
                    let mut observed = observed.lock().unwrap();
                    observed.push(delivery.redelivery_count);
                    observed.len()
                };
                if attempts <= 2 {
                    return Err(HandlerError::Recoverable("inventory locked".to_string()));
                }
                Ok(())
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
    publish(&broker, "add", "order-flaky");

    assert!(eventually(Duration::from_secs(5), || broker.stats().acked == 1).await);
    assert_eq!(*observed.lock().unwrap(), vec![0, 1, 2]);

    let stats = pool.stats();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.handler_failures, 2);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn unroutable_deliveries_are_discarded_without_stopping_the_consumer() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 1);
    let (manager, channels) = support::connect(&broker, &config).await;

    let router = DispatchRouter::new(&config.dispatch)
        .route(QUEUE, RoutingKey::key("add"), |_: Delivery| async {
            Ok::<(), HandlerError>(())
        })
        .unwrap();
    let pool = ConsumerPool::new(manager, channels, router, &config)
        .start()
        .await
        .unwrap();

    publish(&broker, "unknown", "order-lost");
    assert!(eventually(Duration::from_secs(5), || pool.stats().unroutable == 1).await);
    assert_eq!(pool.stats().discarded, 1);
    assert_eq!(broker.stats().discarded, 1);
    assert_eq!(pool.active_consumers(), 1);

    publish(&broker, "add", "order-fine");
    assert!(eventually(Duration::from_secs(5), || pool.stats().acked == 1).await);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn exhausted_redeliveries_are_dead_lettered_with_their_origin() {
    let broker = InMemoryBroker::new();
    let mut config = support::with_dead_letter(support::config(1, 1));
    config.dispatch.redelivery_limit = 3;
    let (manager, channels) = support::connect(&broker, &config).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |_: Delivery| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::Recoverable("database busy".to_string()))
            }
        }
    };
    let router = DispatchRouter::new(&config.dispatch)
        .route(QUEUE, RoutingKey::Default, handler)
        .unwrap();
    let pool = ConsumerPool::new(manager, channels, router, &config)
        .start()
        .await
        .unwrap();

    publish(&broker, "add", "order-doomed");
    assert!(eventually(Duration::from_secs(5), || broker.ready_count(DEAD_LETTER_QUEUE) == 1).await);

    // First attempt plus three redeliveries.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let dead = broker.messages(DEAD_LETTER_QUEUE);
    let headers = &dead[0].properties.headers;
    assert_eq!(headers[HEADER_ORIGINAL_EXCHANGE], "orders");
    assert_eq!(headers[HEADER_ORIGINAL_ROUTING_KEY], "add");
    assert_eq!(headers[HEADER_ORIGINAL_QUEUE], QUEUE);
    assert_eq!(headers[HEADER_REDELIVERY_COUNT], "3");
    assert!(headers[HEADER_FAILURE_REASON].contains("database busy"));
    assert_eq!(dead[0].properties.message_id.as_deref(), Some("order-doomed"));

    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    let stats = pool.stats();
    assert_eq!(stats.requeued, 3);
    assert_eq!(stats.dead_lettered, 1);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn deliveries_without_a_message_id_stop_at_the_redelivery_limit() {
    let broker = InMemoryBroker::new();
    let mut config = support::config(1, 1);
    config.dispatch.redelivery_limit = 3;
    let (manager, channels) = support::connect(&broker, &config).await;

    let observed = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let observed = Arc::clone(&observed);
        move |delivery: Delivery| {
            let observed = Arc::clone(&observed);
            async move {
                assert!(delivery.message_id.is_none());
                assert!(delivery.broker_delivery_count.is_none());
                observed.lock().unwrap().push(delivery.redelivery_count);
                Err::<(), _>(HandlerError::Recoverable("warehouse offline".to_string()))
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

    publish_anonymous(&broker, "add", r#"{"order_id":"walk-in"}"#);
    assert!(eventually(Duration::from_secs(5), || broker.stats().discarded == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(*observed.lock().unwrap(), vec![0, 1, 2, 3]);
    let stats = pool.stats();
    assert_eq!(stats.requeued, 3);
    assert_eq!(stats.discarded, 1);
    assert_eq!(broker.ready_count(QUEUE), 0);
    assert_eq!(broker.unacked_count(QUEUE), 0);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn anonymous_deliveries_keep_separate_counts_per_payload() {
    let broker = InMemoryBroker::new();
    let mut config = support::config(1, 1);
    config.dispatch.redelivery_limit = 1;
    let (manager, channels) = support::connect(&broker, &config).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |_: Delivery| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::Recoverable("warehouse offline".to_string()))
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

    publish_anonymous(&broker, "add", r#"{"order_id":"walk-in-1"}"#);
    publish_anonymous(&broker, "add", r#"{"order_id":"walk-in-2"}"#);
    assert!(eventually(Duration::from_secs(5), || broker.stats().discarded == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One attempt and one retry each.
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(pool.stats().requeued, 2);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn fatal_failures_are_not_retried() {
    let broker = InMemoryBroker::new();
    let config = support::config(1, 1);
    let (manager, channels) = support::connect(&broker, &config).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |_: Delivery| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(HandlerError::Fatal("malformed order".to_string()))
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

    publish(&broker, "add", "order-bad");
    assert!(eventually(Duration::from_secs(5), || broker.stats().discarded == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.stats().requeued, 0);
    pool.stop().await.unwrap();
}

#[tokio::test]
async fn slow_handlers_time_out_and_are_requeued() {
    let broker = InMemoryBroker::new();
    let mut config = support::config(1, 1);
    config.dispatch.handler_timeout_ms = 30;
    let (manager, channels) = support::connect(&broker, &config).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |_: Delivery| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
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

    publish(&broker, "add", "order-slow");
    assert!(eventually(Duration::from_secs(5), || pool.stats().acked == 1).await);
    assert_eq!(pool.stats().requeued, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    pool.stop().await.unwrap();
}

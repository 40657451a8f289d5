// src/rabbitmq/dispatcher.rs

use super::errors::{RabbitMQError, Result};
use crate::config::DispatchConfig;
use crate::message::{AckDecision, Delivery, DeliveryHandler, HandlerError};
use futures::FutureExt;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Route selector inside one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RoutingKey {
    Key(String),
    /// Fallback for routing keys without an explicit route.
    Default,
}

impl RoutingKey {
    pub fn key(key: &str) -> Self {
        RoutingKey::Key(key.to_string())
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingKey::Key(key) => f.write_str(key),
            RoutingKey::Default => f.write_str("<default>"),
        }
    }
}

/// Decision for one delivery plus the failure behind it, if any.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub decision: AckDecision,
    pub error: Option<RabbitMQError>,
}

impl DispatchOutcome {
    fn ack() -> Self {
        Self {
            decision: AckDecision::Ack,
            error: None,
        }
    }

    fn with_error(decision: AckDecision, error: RabbitMQError) -> Self {
        Self {
            decision,
            error: Some(error),
        }
    }
}

#[derive(Default)]
struct QueueRoutes {
    by_key: HashMap<String, Arc<dyn DeliveryHandler>>,
    default: Option<Arc<dyn DeliveryHandler>>,
}

/// Route table from (queue, routing key) to handler.
///
/// Built before consumers start and read-only afterwards; share it behind an
/// `Arc`.
pub struct DispatchRouter {
    routes: HashMap<String, QueueRoutes>,
    handler_timeout: Duration,
    redelivery_limit: u32,
}

impl DispatchRouter {
    pub fn new(config: &DispatchConfig) -> Self {
        Self::with_limits(config.handler_timeout(), config.redelivery_limit)
    }

    pub fn with_limits(handler_timeout: Duration, redelivery_limit: u32) -> Self {
        Self {
            routes: HashMap::new(),
            handler_timeout,
            redelivery_limit,
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    pub fn redelivery_limit(&self) -> u32 {
        self.redelivery_limit
    }

    pub fn register<H>(&mut self, queue: &str, route: RoutingKey, handler: H) -> Result<()>
    where
        H: DeliveryHandler,
    {
        let routes = self.routes.entry(queue.to_string()).or_default();
        let handler: Arc<dyn DeliveryHandler> = Arc::new(handler);
        let slot = match &route {
            RoutingKey::Key(key) => {
                if routes.by_key.contains_key(key) {
                    None
                } else {
                    routes.by_key.insert(key.clone(), handler);
                    Some(())
                }
            }
            RoutingKey::Default => {
                if routes.default.is_some() {
                    None
                } else {
                    routes.default = Some(handler);
                    Some(())
                }
            }
        };
        slot.ok_or_else(|| RabbitMQError::DuplicateRoute {
            queue: queue.to_string(),
            route: route.to_string(),
        })?;
        debug!(queue, route = %route, "Registered handler");
        Ok(())
    }

    /// Builder form of [`register`](Self::register).
    pub fn route<H>(mut self, queue: &str, route: RoutingKey, handler: H) -> Result<Self>
    where
        H: DeliveryHandler,
    {
        self.register(queue, route, handler)?;
        Ok(self)
    }

    pub fn queues(&self) -> Vec<&str> {
        let mut queues: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        queues.sort_unstable();
        queues
    }

    /// Every consumed queue has a route and every route targets a consumed queue.
    pub fn validate(&self, consumed: &[&str]) -> Result<()> {
        for queue in consumed {
            let routed = self
                .routes
                .get(*queue)
                .is_some_and(|r| r.default.is_some() || !r.by_key.is_empty());
            if !routed {
                return Err(RabbitMQError::ConfigError(format!(
                    "No handler registered for consumed queue '{}'",
                    queue
                )));
            }
        }
        for queue in self.routes.keys() {
            if !consumed.contains(&queue.as_str()) {
                return Err(RabbitMQError::ConfigError(format!(
                    "Handlers registered for queue '{}' which is not consumed",
                    queue
                )));
            }
        }
        Ok(())
    }

    fn handler_for(&self, queue: &str, routing_key: &str) -> Option<Arc<dyn DeliveryHandler>> {
        let routes = self.routes.get(queue)?;
        routes
            .by_key
            .get(routing_key)
            .or(routes.default.as_ref())
            .cloned()
    }

    /// Run the matching handler and turn its result into an ack decision.
    #[instrument(
        name = "dispatch",
        skip_all,
        fields(
            queue = %delivery.queue,
            routing_key = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag,
            redelivery_count = delivery.redelivery_count,
        )
    )]
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        let Some(handler) = self.handler_for(&delivery.queue, &delivery.routing_key) else {
            let error = RabbitMQError::UnroutableDelivery {
                queue: delivery.queue.clone(),
                routing_key: delivery.routing_key.clone(),
            };
            warn!(error = %error, "No route for delivery");
            return DispatchOutcome::with_error(AckDecision::NackDiscard, error);
        };

        let invocation = AssertUnwindSafe(handler.handle(delivery)).catch_unwind();
        let failure = match tokio::time::timeout(self.handler_timeout, invocation).await {
            Ok(Ok(Ok(()))) => return DispatchOutcome::ack(),
            Ok(Ok(Err(HandlerError::Recoverable(reason)))) => {
                RabbitMQError::HandlerFailed(reason)
            }
            Ok(Ok(Err(HandlerError::Fatal(reason)))) => {
                return DispatchOutcome::with_error(
                    AckDecision::NackDiscard,
                    RabbitMQError::HandlerFatal(reason),
                );
            }
            Ok(Err(panic)) => {
                return DispatchOutcome::with_error(
                    AckDecision::NackDiscard,
                    RabbitMQError::HandlerFatal(format!("handler panicked: {}", panic_message(panic.as_ref()))),
                );
            }
            Err(_) => RabbitMQError::HandlerTimeout(self.handler_timeout),
        };

        if delivery.redelivery_count >= self.redelivery_limit {
            warn!(
                limit = self.redelivery_limit,
                error = %failure,
                "Redelivery limit reached, discarding"
            );
            DispatchOutcome::with_error(AckDecision::NackDiscard, failure)
        } else {
            DispatchOutcome::with_error(AckDecision::NackRequeue, failure)
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::fixtures::delivery;
    use crate::message::HandlerResult;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn ok(_: Delivery) -> HandlerResult {
        Ok(())
    }

    async fn flaky(_: Delivery) -> HandlerResult {
        Err(HandlerError::Recoverable("database busy".into()))
    }

    async fn broken(_: Delivery) -> HandlerResult {
        Err(HandlerError::Fatal("bad order".into()))
    }

    async fn slow(_: Delivery) -> HandlerResult {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    }

    async fn panics(_: Delivery) -> HandlerResult {
        panic!("boom")
    }

    fn router() -> DispatchRouter {
        DispatchRouter::with_limits(Duration::from_millis(50), 3)
    }

    #[tokio::test]
    async fn exact_key_wins_over_default() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let router = router()
            .route("orders.add", RoutingKey::key("add"), move |_d: Delivery| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })
            .unwrap()
            .route("orders.add", RoutingKey::Default, broken)
            .unwrap();

        let outcome = router.dispatch(&delivery("orders.add", "add", 1)).await;
        assert_eq!(outcome.decision, AckDecision::Ack);
        assert!(outcome.error.is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let outcome = router.dispatch(&delivery("orders.add", "other", 2)).await;
        assert_eq!(outcome.decision, AckDecision::NackDiscard);
    }

    #[tokio::test]
    async fn unknown_key_without_default_is_unroutable() {
        let router = router().route("orders.add", RoutingKey::key("add"), ok).unwrap();
        let outcome = router.dispatch(&delivery("orders.add", "unknown", 1)).await;
        assert_eq!(outcome.decision, AckDecision::NackDiscard);
        assert!(matches!(
            outcome.error,
            Some(RabbitMQError::UnroutableDelivery { ref routing_key, .. }) if routing_key == "unknown"
        ));
    }

    #[tokio::test]
    async fn recoverable_failures_requeue_until_the_limit() {
        let router = router().route("orders.add", RoutingKey::key("add"), flaky).unwrap();
        let mut d = delivery("orders.add", "add", 1);

        d.redelivery_count = 2;
        let outcome = router.dispatch(&d).await;
        assert_eq!(outcome.decision, AckDecision::NackRequeue);
        assert!(matches!(outcome.error, Some(RabbitMQError::HandlerFailed(_))));

        d.redelivery_count = 3;
        assert_eq!(router.dispatch(&d).await.decision, AckDecision::NackDiscard);
    }

    #[tokio::test]
    async fn fatal_failures_discard_immediately() {
        let router = router().route("orders.add", RoutingKey::key("add"), broken).unwrap();
        let outcome = router.dispatch(&delivery("orders.add", "add", 1)).await;
        assert_eq!(outcome.decision, AckDecision::NackDiscard);
        assert!(matches!(outcome.error, Some(RabbitMQError::HandlerFatal(_))));
    }

    #[tokio::test]
    async fn slow_handlers_time_out_as_recoverable() {
        let router = router().route("orders.add", RoutingKey::key("add"), slow).unwrap();
        let outcome = router.dispatch(&delivery("orders.add", "add", 1)).await;
        assert_eq!(outcome.decision, AckDecision::NackRequeue);
        assert!(matches!(outcome.error, Some(RabbitMQError::HandlerTimeout(_))));
    }

    #[tokio::test]
    async fn panicking_handler_is_fatal() {
        let router = router().route("orders.add", RoutingKey::key("add"), panics).unwrap();
        let outcome = router.dispatch(&delivery("orders.add", "add", 1)).await;
        assert_eq!(outcome.decision, AckDecision::NackDiscard);
        assert!(matches!(
            outcome.error,
            Some(RabbitMQError::HandlerFatal(ref msg)) if msg.contains("boom")
        ));
    }

    #[test]
    fn duplicate_routes_are_rejected() {
        let mut router = router();
        router.register("orders.add", RoutingKey::key("add"), ok).unwrap();
        router.register("orders.add", RoutingKey::Default, ok).unwrap();
        assert!(matches!(
            router.register("orders.add", RoutingKey::key("add"), ok),
            Err(RabbitMQError::DuplicateRoute { .. })
        ));
        assert!(router.register("orders.add", RoutingKey::Default, ok).is_err());
    }

    #[test]
    fn validation_checks_both_directions() {
        let router = router().route("orders.add", RoutingKey::key("add"), ok).unwrap();
        assert!(router.validate(&["orders.add"]).is_ok());
        assert!(router.validate(&["orders.add", "orders.del"]).is_err());
        assert!(router.validate(&[]).is_err());
    }
}

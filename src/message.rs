use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use thiserror::Error;

/// One message handed from the broker to a consumer.
///
/// A delivery lives for a single dispatch cycle: it is tracked when it is
/// received and forgotten once its decision has been sent back to the broker.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Broker-scoped sequence number, only meaningful on `channel`.
    pub delivery_tag: u64,
    /// Pool-assigned key of the channel the delivery arrived on.
    pub channel: u64,
    pub consumer_tag: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// Number of earlier attempts, filled in by the tracker before dispatch.
    pub redelivery_count: u32,
    /// Count announced by the broker itself (`x-delivery-count` or `x-death`).
    pub broker_delivery_count: Option<u32>,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Deserialize a JSON payload.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| HandlerError::Fatal(format!("malformed payload: {}", e)))
    }
}

/// What the router wants the broker to do with a delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckDecision {
    Ack,
    NackRequeue,
    NackDiscard,
}

/// What actually happened to a delivery on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Disposition {
    Acked,
    Requeued,
    Discarded,
    DeadLettered,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Disposition::Acked => "acked",
            Disposition::Requeued => "requeued",
            Disposition::Discarded => "discarded",
            Disposition::DeadLettered => "dead-lettered",
        };
        f.write_str(name)
    }
}

/// Failure reported by application handler code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Worth another attempt: the delivery is requeued until the redelivery limit.
    #[error("recoverable handler failure: {0}")]
    Recoverable(String),

    /// Retrying will not help: the delivery is discarded or dead-lettered.
    #[error("fatal handler failure: {0}")]
    Fatal(String),
}

pub type HandlerResult = Result<(), HandlerError>;

/// Business logic plugged into the dispatch router.
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> DeliveryHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> HandlerResult {
        (self)(delivery.clone()).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Order {
        order_id: String,
    }

    #[test]
    fn json_payload_decodes() {
        let delivery = fixtures::delivery("orders.add", "add", 1);
        let order: Order = delivery.json().unwrap();
        assert_eq!(order.order_id, "A-1");
    }

    #[test]
    fn malformed_payload_is_fatal() {
        let mut delivery = fixtures::delivery("orders.add", "add", 1);
        delivery.payload = b"not json".to_vec();
        let err = delivery.json::<Order>().unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }

    #[test]
    fn payload_text_replaces_invalid_utf8() {
        let mut delivery = fixtures::delivery("orders.add", "add", 1);
        assert_eq!(delivery.payload_str(), r#"{"order_id":"A-1"}"#);
        delivery.payload = vec![b'o', 0xff, b'k'];
        assert_eq!(delivery.payload_str(), "o\u{fffd}k");
    }

    #[tokio::test]
    async fn closures_are_handlers() {
        let handler = |d: Delivery| async move {
            if d.routing_key == "add" {
                Ok(())
            } else {
                Err(HandlerError::Recoverable("wrong key".into()))
            }
        };
        assert!(handler.handle(&fixtures::delivery("q", "add", 1)).await.is_ok());
        assert!(handler.handle(&fixtures::delivery("q", "del", 2)).await.is_err());
    }
}

//! Concurrent AMQP consumer runtime.
//!
//! A [`rabbitmq::ConsumerPool`] keeps a bounded, elastic set of consumers on
//! one queue, routes each delivery to a handler by routing key and settles
//! it on the channel it arrived on. Connection loss is recovered
//! transparently and every delivery is acked, requeued or discarded exactly
//! once.

pub mod config;
pub mod env;
pub mod message;
pub mod rabbitmq;
pub mod telemetry;

pub use message::{AckDecision, Delivery, DeliveryHandler, Disposition, HandlerError, HandlerResult};

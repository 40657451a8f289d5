// src/rabbitmq/amqp_client.rs
// The transport seam implemented on top of lapin.

use super::errors::{RabbitMQError, Result};
use super::topology::{
    Arguments, BindingDefinition, ExchangeDefinition, ExchangeKind, QueueDefinition,
};
use super::transport::{
    AmqpChannel, AmqpConnection, AmqpTransport, DeliveryStream, PublishProperties,
};
use crate::config::BrokerEndpoint;
use crate::message::Delivery;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    options::*,
    types::{AMQPValue, FieldArray, FieldTable},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";
pub const HEADER_X_DEATH: &str = "x-death";

/// Connects to a real broker with lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport {
    /// Enable publisher confirms on every channel.
    pub confirm_mode: bool,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self { confirm_mode: true }
    }
}

pub(crate) fn amqp_uri(endpoint: &BrokerEndpoint) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: endpoint.username.clone(),
                password: endpoint.password.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.virtual_host.clone(),
        query: AMQPQueryString {
            heartbeat: Some(endpoint.heartbeat_seconds),
            connection_timeout: Some(endpoint.connection_timeout_ms),
            ..AMQPQueryString::default()
        },
    }
}

pub(crate) fn connection_properties(endpoint: &BrokerEndpoint) -> ConnectionProperties {
    let mut properties = ConnectionProperties::default()
        .with_connection_name(endpoint.connection_name().into());

    let client = &endpoint.client;
    for (key, value) in [
        ("principal", &client.principal),
        ("description", &client.description),
        ("emailAddress", &client.contact),
    ] {
        properties
            .client_properties
            .insert(key.into(), AMQPValue::LongString(value.clone().into()));
    }
    properties
}

#[async_trait]
impl AmqpTransport for LapinTransport {
    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Arc<dyn AmqpConnection>> {
        info!("Attempting to connect to RabbitMQ at {}", endpoint.display_address());

        let connection = tokio::time::timeout(
            endpoint.connection_timeout(),
            Connection::connect_uri(amqp_uri(endpoint), connection_properties(endpoint)),
        )
        .await
        .map_err(|_| {
            RabbitMQError::ConnectionError(format!(
                "Connection to {} timed out after {:?}",
                endpoint.display_address(),
                endpoint.connection_timeout()
            ))
        })?
        .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;

        connection.on_error(|err| {
            error!(error = %err, "RabbitMQ connection reported an error");
        });

        info!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection {
            connection,
            confirm_mode: self.confirm_mode,
        }))
    }
}

pub struct LapinConnection {
    connection: Connection,
    confirm_mode: bool,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn create_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;

        if self.confirm_mode {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        debug!(channel_id = channel.id(), "Channel created");
        Ok(Box::new(LapinChannel { channel }))
    }

    async fn close(&self) -> Result<()> {
        info!("Closing RabbitMQ connection gracefully");
        self.connection.close(200, "Closing connection").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(format!("Failed to set QoS: {}", e)))
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<()> {
        self.channel
            .exchange_declare(
                &def.name,
                exchange_kind(def.kind),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    auto_delete: def.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(&def.arguments),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<u32> {
        let queue = self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                field_table(&def.arguments),
            )
            .await?;
        Ok(queue.message_count())
    }

    async fn queue_depth(&self, queue: &str) -> Result<u32> {
        let queue = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.message_count())
    }

    async fn bind_queue(&self, def: &BindingDefinition) -> Result<()> {
        self.channel
            .queue_bind(
                &def.queue,
                &def.exchange,
                &def.routing_key,
                QueueBindOptions::default(),
                field_table(&def.arguments),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))?;

        let queue = queue.to_string();
        let consumer_tag = consumer_tag.to_string();
        let stream = consumer.map(move |result| match result {
            Ok(delivery) => Ok(convert_delivery(delivery, &queue, &consumer_tag)),
            Err(e) => Err(RabbitMQError::from(e)),
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ConsumeError(e.to_string()))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> Result<()> {
        let mut props = BasicProperties::default().with_delivery_mode(2);
        if let Some(id) = &properties.message_id {
            props = props.with_message_id(id.clone().into());
        }
        if let Some(content_type) = &properties.content_type {
            props = props.with_content_type(content_type.clone().into());
        }
        if !properties.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (key, value) in &properties.headers {
                headers.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
            }
            props = props.with_headers(headers);
        }

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                props,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(RabbitMQError::PublishError(format!(
                "Broker refused message for {}/{}",
                exchange, routing_key
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.channel.status().connected() {
            self.channel
                .close(200, "Closing channel")
                .await
                .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        }
        Ok(())
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn field_table(arguments: &Arguments) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        table.insert(key.clone().into(), amqp_value(value));
    }
    table
}

fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    use serde_json::Value;
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        Value::Array(items) => {
            let values: Vec<AMQPValue> = items.iter().map(amqp_value).collect();
            AMQPValue::FieldArray(FieldArray::from(values))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, value) in map {
                table.insert(key.clone().into(), amqp_value(value));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn render_value(value: &AMQPValue) -> String {
    match value {
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        AMQPValue::ShortString(s) => s.as_str().to_string(),
        AMQPValue::Boolean(b) => b.to_string(),
        AMQPValue::ShortShortInt(i) => i.to_string(),
        AMQPValue::ShortShortUInt(i) => i.to_string(),
        AMQPValue::ShortInt(i) => i.to_string(),
        AMQPValue::ShortUInt(i) => i.to_string(),
        AMQPValue::LongInt(i) => i.to_string(),
        AMQPValue::LongUInt(i) => i.to_string(),
        AMQPValue::LongLongInt(i) => i.to_string(),
        other => format!("{:?}", other),
    }
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count = match value {
        AMQPValue::ShortShortInt(i) => i64::from(*i),
        AMQPValue::ShortShortUInt(i) => i64::from(*i),
        AMQPValue::ShortInt(i) => i64::from(*i),
        AMQPValue::ShortUInt(i) => i64::from(*i),
        AMQPValue::LongInt(i) => i64::from(*i),
        AMQPValue::LongUInt(i) => i64::from(*i),
        AMQPValue::LongLongInt(i) => *i,
        _ => return None,
    };
    u32::try_from(count).ok()
}

/// Broker-maintained attempt count: quorum queues send `x-delivery-count`,
/// dead-letter cycles leave an `x-death` array whose first entry has a `count`.
fn broker_delivery_count(headers: &FieldTable) -> Option<u32> {
    let inner = headers.inner();
    if let Some(count) = inner.get(HEADER_DELIVERY_COUNT).and_then(as_count) {
        return Some(count);
    }
    inner
        .get(HEADER_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(|first| first.as_field_table())
        .and_then(|table| table.inner().get("count"))
        .and_then(as_count)
}

fn convert_delivery(delivery: lapin::message::Delivery, queue: &str, consumer_tag: &str) -> Delivery {
    let properties = &delivery.properties;
    let (headers, broker_delivery_count) = match properties.headers() {
        Some(table) => {
            let rendered: BTreeMap<String, String> = table
                .inner()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), render_value(v)))
                .collect();
            (rendered, broker_delivery_count(table))
        }
        None => (BTreeMap::new(), None),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        channel: 0,
        consumer_tag: consumer_tag.to_string(),
        queue: queue.to_string(),
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        redelivery_count: 0,
        broker_delivery_count,
        message_id: properties.message_id().as_ref().map(|id| id.as_str().to_string()),
        content_type: properties.content_type().as_ref().map(|ct| ct.as_str().to_string()),
        headers,
        payload: delivery.data,
        received_at: Utc::now(),
    }
}

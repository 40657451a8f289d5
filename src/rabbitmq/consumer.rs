// src/rabbitmq/consumer.rs
// One consumer = one task owning one pooled channel. Handlers run on
// separate tasks; their outcomes come back here so every ack or nack is
// sent on the owning channel.

use super::channel_manager::{ChannelConfig, ChannelPool, PooledChannel};
use super::connection::ConnectionManager;
use super::dispatcher::{DispatchOutcome, DispatchRouter};
use super::errors::{RabbitMQError, Result};
use super::pool::Counters;
use super::tracker::{AckTracker, InFlightPermit};
use super::transport::{DeliveryStream, PublishProperties};
use crate::config::DeadLetterConfig;
use crate::message::{AckDecision, Delivery, Disposition};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const HEADER_ORIGINAL_EXCHANGE: &str = "x-original-exchange";
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
pub const HEADER_ORIGINAL_QUEUE: &str = "x-original-queue";
pub const HEADER_REDELIVERY_COUNT: &str = "x-redelivery-count";
pub const HEADER_FAILURE_REASON: &str = "x-failure-reason";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConsumerState {
    Starting,
    Active,
    Draining,
    Stopped,
    Failed,
}

/// Read-only view of one consumer.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub tag: String,
    pub queue: String,
    /// Pool key of the channel the consumer currently owns.
    pub channel: Option<u64>,
    pub state: ConsumerState,
    pub started_at: DateTime<Utc>,
}

/// State of one consumer shared between its task and the pool.
pub(crate) struct ConsumerShared {
    tag: String,
    queue: String,
    state: watch::Sender<ConsumerState>,
    channel: AtomicU64,
    started_at: Mutex<DateTime<Utc>>,
}

impl ConsumerShared {
    pub(crate) fn new(tag: &str, queue: &str) -> Self {
        let (state, _) = watch::channel(ConsumerState::Starting);
        Self {
            tag: tag.to_string(),
            queue: queue.to_string(),
            state,
            channel: AtomicU64::new(0),
            started_at: Mutex::new(Utc::now()),
        }
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    pub(crate) fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }

    pub(crate) fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub(crate) fn channel(&self) -> Option<u64> {
        let channel = self.channel.load(Ordering::SeqCst);
        (channel != 0).then_some(channel)
    }

    fn set_channel(&self, key: Option<u64>) {
        self.channel.store(key.unwrap_or(0), Ordering::SeqCst);
    }

    fn mark_started(&self) {
        *self.started_at.lock().unwrap_or_else(|p| p.into_inner()) = Utc::now();
    }

    pub(crate) fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            tag: self.tag.clone(),
            queue: self.queue.clone(),
            channel: self.channel(),
            state: self.state(),
            started_at: *self.started_at.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

/// Everything a consumer task needs, shared by all consumers of a pool.
pub(crate) struct ConsumerContext {
    pub connection: Arc<ConnectionManager>,
    pub channels: ChannelPool,
    pub router: Arc<DispatchRouter>,
    pub tracker: Arc<AckTracker>,
    pub workers: Arc<Semaphore>,
    pub dead_letter: Option<DeadLetterConfig>,
    pub counters: Arc<Counters>,
    pub queue: String,
    pub prefetch: u16,
    pub shutdown_timeout: Duration,
    /// Pause before re-subscribing when the channel failed but the
    /// connection stayed up.
    pub retry_delay: Duration,
}

#[derive(Debug)]
pub(crate) enum ConsumerExit {
    Stopped { forced_requeues: usize },
    Failed(RabbitMQError),
}

enum SessionEnd {
    Stopped { forced_requeues: usize },
    Lost(RabbitMQError),
    Failed(RabbitMQError),
}

type Completed = (Delivery, DispatchOutcome);

/// Body of a consumer task. Returns when stopped or when it cannot go on.
pub(crate) async fn run_consumer(
    ctx: Arc<ConsumerContext>,
    shared: Arc<ConsumerShared>,
    mut stop: watch::Receiver<bool>,
    start_delay: Duration,
) -> ConsumerExit {
    shared.set_state(ConsumerState::Starting);
    if !start_delay.is_zero() {
        tokio::select! {
            _ = sleep(start_delay) => {}
            _ = stop.changed() => {
                shared.set_state(ConsumerState::Stopped);
                return ConsumerExit::Stopped { forced_requeues: 0 };
            }
        }
    }

    let worker = ConsumerWorker { ctx, shared };
    loop {
        if *stop.borrow_and_update() {
            worker.shared.set_state(ConsumerState::Stopped);
            return ConsumerExit::Stopped { forced_requeues: 0 };
        }

        let generation = worker.ctx.connection.generation();
        match worker.session(&mut stop).await {
            SessionEnd::Stopped { forced_requeues } => {
                worker.shared.set_channel(None);
                worker.shared.set_state(ConsumerState::Stopped);
                info!(consumer_tag = %worker.shared.tag, forced_requeues, "Consumer stopped");
                return ConsumerExit::Stopped { forced_requeues };
            }
            SessionEnd::Failed(err) => {
                worker.shared.set_channel(None);
                worker.shared.set_state(ConsumerState::Failed);
                error!(consumer_tag = %worker.shared.tag, error = %err, "Consumer failed");
                return ConsumerExit::Failed(err);
            }
            SessionEnd::Lost(err) => {
                worker.shared.set_channel(None);
                worker.shared.set_state(ConsumerState::Starting);
                warn!(consumer_tag = %worker.shared.tag, error = %err, "Consumer lost its channel");
            }
        }

        let connection = &worker.ctx.connection;
        let resumed = if connection.generation() != generation {
            Ok(())
        } else if connection.is_connected() {
            sleep(worker.ctx.retry_delay).await;
            Ok(())
        } else {
            tokio::select! {
                recovered = connection.recover(generation) => recovered.map(|_| ()),
                _ = stop.changed() => Ok(()),
            }
        };
        if let Err(err) = resumed {
            worker.shared.set_state(ConsumerState::Failed);
            error!(consumer_tag = %worker.shared.tag, error = %err, "Consumer cannot resume");
            return ConsumerExit::Failed(err);
        }
    }
}

struct ConsumerWorker {
    ctx: Arc<ConsumerContext>,
    shared: Arc<ConsumerShared>,
}

impl ConsumerWorker {
    async fn session(&self, stop: &mut watch::Receiver<bool>) -> SessionEnd {
        let ctx = &self.ctx;
        let tag = self.shared.tag.as_str();

        let config = ChannelConfig::with_prefetch(ctx.prefetch);
        let acquired = tokio::select! {
            acquired = ctx.channels.acquire(&config) => acquired,
            _ = stop.changed() => return SessionEnd::Stopped { forced_requeues: 0 },
        };
        let channel = match acquired {
            Ok(channel) => channel,
            Err(e) if e.is_transient() => return SessionEnd::Lost(e),
            Err(e) => return SessionEnd::Failed(e),
        };
        let key = channel.key();

        let deliveries = match channel.consume(&ctx.queue, tag).await {
            Ok(stream) => stream,
            Err(e) => {
                if let Err(close) = channel.close().await {
                    debug!(channel = key, error = %close, "Channel close after failed subscribe failed");
                }
                if e.is_transient() || !ctx.connection.is_connected() {
                    return SessionEnd::Lost(e);
                }
                return SessionEnd::Failed(e);
            }
        };

        self.shared.set_channel(Some(key));
        self.shared.mark_started();
        self.shared.set_state(ConsumerState::Active);
        info!(consumer_tag = tag, queue = %ctx.queue, channel = key, "Started consuming");

        self.consume(channel, deliveries, stop).await
    }

    async fn consume(
        &self,
        channel: PooledChannel,
        mut deliveries: DeliveryStream,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let ctx = &self.ctx;
        let key = channel.key();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completed>();
        let mut in_handlers = 0usize;
        let mut permit: Option<InFlightPermit> = None;

        let lost = loop {
            if *stop.borrow_and_update() {
                break None;
            }

            // Hold an in-flight slot before pulling the next delivery.
            if permit.is_none() {
                tokio::select! {
                    biased;
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break None;
                        }
                    }
                    Some((delivery, outcome)) = done_rx.recv() => {
                        in_handlers -= 1;
                        if let Err(e) = self.settle(&channel, delivery, outcome).await {
                            break Some(e);
                        }
                    }
                    reserved = ctx.tracker.reserve(key) => match reserved {
                        Ok(reserved) => permit = Some(reserved),
                        Err(e) => break Some(e),
                    },
                }
                continue;
            }

            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() {
                        break None;
                    }
                }
                Some((delivery, outcome)) = done_rx.recv() => {
                    in_handlers -= 1;
                    if let Err(e) = self.settle(&channel, delivery, outcome).await {
                        break Some(e);
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(mut delivery)) => {
                        delivery.channel = key;
                        delivery.redelivery_count = ctx.tracker.redelivery_count(&delivery);
                        let Some(reserved) = permit.take() else {
                            continue;
                        };
                        if let Err(e) = ctx.tracker.track(&delivery, reserved) {
                            break Some(e);
                        }
                        in_handlers += 1;
                        self.spawn_dispatch(delivery, done_tx.clone());
                    }
                    Some(Err(e)) => break Some(e),
                    None => {
                        break Some(RabbitMQError::ConsumeError(format!(
                            "Subscription '{}' was cancelled by the broker",
                            self.shared.tag
                        )));
                    }
                },
            }
        };

        drop(permit);
        match lost {
            Some(err) => {
                let cleared = ctx.tracker.clear_channel(key);
                debug!(consumer_tag = %self.shared.tag, cleared, "Abandoning channel");
                if let Err(e) = channel.close().await {
                    debug!(channel = key, error = %e, "Channel close after loss failed");
                }
                SessionEnd::Lost(err)
            }
            None => {
                drop(deliveries);
                self.drain(channel, done_rx, in_handlers).await
            }
        }
    }

    fn spawn_dispatch(&self, delivery: Delivery, done: mpsc::UnboundedSender<Completed>) {
        let router = Arc::clone(&self.ctx.router);
        let workers = Arc::clone(&self.ctx.workers);
        tokio::spawn(async move {
            let outcome = match workers.acquire_owned().await {
                Ok(_worker) => router.dispatch(&delivery).await,
                Err(_) => DispatchOutcome {
                    decision: AckDecision::NackRequeue,
                    error: Some(RabbitMQError::ChannelError(
                        "Dispatch workers are shut down".to_string(),
                    )),
                },
            };
            let delivery_tag = delivery.delivery_tag;
            if done.send((delivery, outcome)).is_err() {
                debug!(
                    delivery_tag,
                    "Consumer left its channel before the handler finished, broker will redeliver"
                );
            }
        });
    }

    /// Cancel the subscription, let running handlers finish until the
    /// shutdown timeout, then requeue whatever is still unresolved.
    async fn drain(
        &self,
        channel: PooledChannel,
        mut done_rx: mpsc::UnboundedReceiver<Completed>,
        mut in_handlers: usize,
    ) -> SessionEnd {
        let ctx = &self.ctx;
        let key = channel.key();
        self.shared.set_state(ConsumerState::Draining);
        info!(consumer_tag = %self.shared.tag, in_flight = in_handlers, "Draining consumer");

        if let Err(e) = channel.cancel(&self.shared.tag).await {
            warn!(consumer_tag = %self.shared.tag, error = %e, "Failed to cancel subscription");
        }

        let deadline = sleep(ctx.shutdown_timeout);
        tokio::pin!(deadline);
        while in_handlers > 0 {
            tokio::select! {
                Some((delivery, outcome)) = done_rx.recv() => {
                    in_handlers -= 1;
                    if let Err(e) = self.settle(&channel, delivery, outcome).await {
                        warn!(consumer_tag = %self.shared.tag, error = %e, "Channel failed while draining");
                        break;
                    }
                }
                _ = &mut deadline => break,
            }
        }

        let mut forced_requeues = 0;
        for delivery_tag in ctx.tracker.pending_tags(key) {
            match channel.nack(delivery_tag, true).await {
                Ok(()) => forced_requeues += 1,
                Err(e) => {
                    warn!(delivery_tag, error = %e, "Failed to requeue in-flight delivery");
                    break;
                }
            }
        }
        if forced_requeues > 0 {
            warn!(
                consumer_tag = %self.shared.tag,
                forced_requeues,
                timeout_ms = ctx.shutdown_timeout.as_millis() as u64,
                "Requeued deliveries still in flight at shutdown timeout"
            );
            ctx.counters
                .forced_requeues
                .fetch_add(forced_requeues as u64, Ordering::Relaxed);
        }
        ctx.tracker.clear_channel(key);
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Channel close after drain failed");
        }
        SessionEnd::Stopped { forced_requeues }
    }

    /// Send the outcome of one dispatch cycle to the broker.
    ///
    /// Any error returned here abandons the channel so the broker requeues
    /// everything still unacknowledged on it.
    async fn settle(
        &self,
        channel: &PooledChannel,
        delivery: Delivery,
        outcome: DispatchOutcome,
    ) -> Result<()> {
        let ctx = &self.ctx;
        let tag = delivery.delivery_tag;
        if let Err(e) = ctx.tracker.resolve(channel.key(), tag, outcome.decision) {
            warn!(
                consumer_tag = %self.shared.tag,
                delivery_tag = tag,
                error = %e,
                "Delivery no longer tracked, abandoning channel"
            );
            return Err(e);
        }

        match &outcome.error {
            Some(RabbitMQError::UnroutableDelivery { .. }) => ctx.counters.incr_unroutable(),
            Some(_) => ctx.counters.incr_handler_failures(),
            None => {}
        }

        let disposition = match outcome.decision {
            AckDecision::Ack => {
                channel.ack(tag).await?;
                Disposition::Acked
            }
            AckDecision::NackRequeue => {
                channel.nack(tag, true).await?;
                Disposition::Requeued
            }
            AckDecision::NackDiscard => match &ctx.dead_letter {
                Some(config) => {
                    self.dead_letter(channel, &delivery, outcome.error.as_ref(), config)
                        .await?
                }
                None => {
                    channel.nack(tag, false).await?;
                    Disposition::Discarded
                }
            },
        };
        ctx.counters.record(disposition);

        let reason = outcome
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        if disposition == Disposition::Acked {
            debug!(
                delivery_tag = tag,
                routing_key = %delivery.routing_key,
                queue = %delivery.queue,
                consumer_tag = %self.shared.tag,
                redelivery_count = delivery.redelivery_count,
                disposition = %disposition,
                "Delivery settled"
            );
        } else {
            warn!(
                delivery_tag = tag,
                routing_key = %delivery.routing_key,
                queue = %delivery.queue,
                consumer_tag = %self.shared.tag,
                redelivery_count = delivery.redelivery_count,
                disposition = %disposition,
                reason = %reason,
                "Delivery settled"
            );
        }
        Ok(())
    }

    /// Republish to the dead-letter exchange, then ack the original.
    async fn dead_letter(
        &self,
        channel: &PooledChannel,
        delivery: &Delivery,
        error: Option<&RabbitMQError>,
        config: &DeadLetterConfig,
    ) -> Result<Disposition> {
        let properties = dead_letter_properties(delivery, error);
        let routing_key = config
            .routing_key
            .as_deref()
            .unwrap_or(delivery.routing_key.as_str());

        match channel
            .publish(&config.exchange, routing_key, &delivery.payload, &properties)
            .await
        {
            Ok(()) => {
                channel.ack(delivery.delivery_tag).await?;
                Ok(Disposition::DeadLettered)
            }
            Err(e) => {
                warn!(
                    exchange = %config.exchange,
                    error = %e,
                    "Dead-letter publish failed, rejecting without requeue"
                );
                channel.nack(delivery.delivery_tag, false).await?;
                Ok(Disposition::Discarded)
            }
        }
    }
}

pub(crate) fn dead_letter_properties(
    delivery: &Delivery,
    error: Option<&RabbitMQError>,
) -> PublishProperties {
    let reason = error.map_or_else(|| "rejected".to_string(), ToString::to_string);
    PublishProperties {
        message_id: delivery.message_id.clone(),
        content_type: delivery.content_type.clone(),
        headers: delivery.headers.clone(),
    }
    .with_header(HEADER_ORIGINAL_EXCHANGE, delivery.exchange.clone())
    .with_header(HEADER_ORIGINAL_ROUTING_KEY, delivery.routing_key.clone())
    .with_header(HEADER_ORIGINAL_QUEUE, delivery.queue.clone())
    .with_header(HEADER_REDELIVERY_COUNT, delivery.redelivery_count.to_string())
    .with_header(HEADER_FAILURE_REASON, reason)
}

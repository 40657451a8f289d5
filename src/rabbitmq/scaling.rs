// src/rabbitmq/scaling.rs

use super::channel_manager::{ChannelConfig, ChannelPool};
use super::errors::Result;
use crate::config::ScalingConfig;
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

/// Load observed at one sampling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogSample {
    /// Ready messages waiting in the queue.
    pub backlog: u32,
    /// Deliveries currently held by consumers.
    pub in_flight: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalingAction {
    Up,
    Down,
    Hold,
}

/// Decides when to add or remove a consumer.
///
/// Pure: time comes in through `observe`, so tests drive it with synthetic
/// instants.
#[derive(Debug)]
pub struct Autoscaler {
    min: usize,
    max: usize,
    active_trigger: u32,
    idle_trigger: u32,
    start_interval: Duration,
    stop_interval: Duration,
    backlog_threshold: u32,
    consecutive_busy: u32,
    consecutive_idle: u32,
    last_start: Option<Instant>,
    last_stop: Option<Instant>,
}

impl Autoscaler {
    pub fn new(config: &ScalingConfig, min: usize, max: usize) -> Self {
        Self {
            min,
            max,
            active_trigger: config.consecutive_active_trigger.max(1),
            idle_trigger: config.consecutive_idle_trigger.max(1),
            start_interval: Duration::from_millis(config.start_consumer_min_interval_ms),
            stop_interval: Duration::from_millis(config.stop_consumer_min_interval_ms),
            backlog_threshold: config.backlog_threshold,
            consecutive_busy: 0,
            consecutive_idle: 0,
            last_start: None,
            last_stop: None,
        }
    }

    /// Count the consumer started at `now` against the start cooldown.
    pub fn note_started(&mut self, now: Instant) {
        self.last_start = Some(now);
    }

    pub fn observe(&mut self, sample: BacklogSample, active: usize, now: Instant) -> ScalingAction {
        let busy = sample.backlog > self.backlog_threshold;
        let idle = sample.backlog == 0 && sample.in_flight < active;

        if busy {
            self.consecutive_idle = 0;
            self.consecutive_busy = self.consecutive_busy.saturating_add(1);
            if self.consecutive_busy >= self.active_trigger
                && active < self.max
                && cooled_down(self.last_start, self.start_interval, now)
            {
                self.consecutive_busy = 0;
                self.last_start = Some(now);
                debug!(backlog = sample.backlog, active, "Scaling up");
                return ScalingAction::Up;
            }
        } else if idle {
            self.consecutive_busy = 0;
            self.consecutive_idle = self.consecutive_idle.saturating_add(1);
            if self.consecutive_idle >= self.idle_trigger
                && active > self.min
                && cooled_down(self.last_stop, self.stop_interval, now)
            {
                self.consecutive_idle = 0;
                self.last_stop = Some(now);
                debug!(in_flight = sample.in_flight, active, "Scaling down");
                return ScalingAction::Down;
            }
        } else {
            self.consecutive_busy = 0;
            self.consecutive_idle = 0;
        }
        ScalingAction::Hold
    }
}

fn cooled_down(last: Option<Instant>, interval: Duration, now: Instant) -> bool {
    last.map_or(true, |at| now.saturating_duration_since(at) >= interval)
}

/// Source of the backlog figure fed to the autoscaler.
#[async_trait]
pub trait BacklogProbe: Send + Sync + 'static {
    async fn backlog(&self) -> Result<u32>;
}

/// Ready-message count from a passive queue declare.
pub struct QueueDepthProbe {
    channels: ChannelPool,
    queue: String,
}

impl QueueDepthProbe {
    pub fn new(channels: ChannelPool, queue: &str) -> Self {
        Self {
            channels,
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl BacklogProbe for QueueDepthProbe {
    async fn backlog(&self) -> Result<u32> {
        let channel = self.channels.try_acquire(&ChannelConfig::default()).await?;
        match channel.queue_depth(&self.queue).await {
            Ok(depth) => {
                self.channels.release(channel).await;
                Ok(depth)
            }
            Err(e) => {
                if let Err(close) = channel.close().await {
                    debug!(error = %close, "Queue depth channel close failed");
                }
                Err(e)
            }
        }
    }
}

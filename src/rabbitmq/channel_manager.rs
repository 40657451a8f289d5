// src/rabbitmq/channel_manager.rs

use super::connection::ConnectionManager;
use super::errors::{RabbitMQError, Result};
use super::transport::AmqpChannel;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Per-acquire channel settings.
#[derive(Debug, Clone, Default)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 leaves QoS untouched)
    pub prefetch_count: u16,
}

impl ChannelConfig {
    pub fn with_prefetch(prefetch_count: u16) -> Self {
        Self { prefetch_count }
    }
}

struct IdleChannel {
    key: u64,
    generation: u64,
    channel: Box<dyn AmqpChannel>,
}

struct PoolInner {
    connection: Arc<ConnectionManager>,
    capacity: usize,
    slots: Arc<Semaphore>,
    idle: Mutex<Vec<IdleChannel>>,
    next_key: AtomicU64,
}

impl PoolInner {
    fn idle(&self) -> MutexGuard<'_, Vec<IdleChannel>> {
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bounded set of logical channels multiplexed over the managed connection.
///
/// Channels are opened lazily. Each one is handed to exactly one owner as a
/// [`PooledChannel`]; the pool never shares a channel between two holders.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    pub fn new(connection: Arc<ConnectionManager>, capacity: usize) -> Self {
        debug!(capacity, "Creating channel pool");
        Self {
            inner: Arc::new(PoolInner {
                connection,
                capacity,
                slots: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::new()),
                next_key: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Channels currently held by callers.
    pub fn in_use(&self) -> usize {
        self.inner.capacity - self.inner.slots.available_permits()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle().len()
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.inner.connection
    }

    /// Take a channel, waiting while every slot is in use.
    pub async fn acquire(&self, config: &ChannelConfig) -> Result<PooledChannel> {
        let permit = Arc::clone(&self.inner.slots)
            .acquire_owned()
            .await
            .map_err(|_| RabbitMQError::ChannelError("Channel pool is closed".to_string()))?;
        self.checkout(permit, config).await
    }

    /// Take a channel, failing with `PoolExhausted` instead of waiting.
    pub async fn try_acquire(&self, config: &ChannelConfig) -> Result<PooledChannel> {
        let permit = Arc::clone(&self.inner.slots)
            .try_acquire_owned()
            .map_err(|_| RabbitMQError::PoolExhausted {
                capacity: self.inner.capacity,
            })?;
        self.checkout(permit, config).await
    }

    async fn checkout(
        &self,
        permit: OwnedSemaphorePermit,
        config: &ChannelConfig,
    ) -> Result<PooledChannel> {
        let generation = self.inner.connection.generation();
        let reusable = loop {
            let candidate = self.inner.idle().pop();
            match candidate {
                Some(idle) if idle.generation == generation && idle.channel.is_open() => {
                    break Some(idle);
                }
                Some(stale) => {
                    debug!(channel = stale.key, generation = stale.generation, "Evicting stale channel");
                    if let Err(e) = stale.channel.close().await {
                        debug!(channel = stale.key, error = %e, "Stale channel close failed");
                    }
                }
                None => break None,
            }
        };

        let (key, generation, channel) = match reusable {
            Some(idle) => (idle.key, idle.generation, idle.channel),
            None => {
                let (generation, channel) = self.inner.connection.open_channel().await?;
                let key = self.inner.next_key.fetch_add(1, Ordering::SeqCst);
                debug!(channel = key, amqp_channel = channel.id(), generation, "Opened channel");
                (key, generation, channel)
            }
        };

        if config.prefetch_count > 0 {
            if let Err(e) = channel.set_prefetch(config.prefetch_count).await {
                if let Err(close) = channel.close().await {
                    debug!(channel = key, error = %close, "Channel close after failed qos failed");
                }
                return Err(e);
            }
        }

        Ok(PooledChannel {
            key,
            generation,
            channel: Some(channel),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Hand a channel back. Closed or stale channels are discarded.
    pub async fn release(&self, mut pooled: PooledChannel) {
        let Some(channel) = pooled.channel.take() else {
            return;
        };
        let current = self.inner.connection.generation();
        if pooled.generation == current && channel.is_open() {
            self.inner.idle().push(IdleChannel {
                key: pooled.key,
                generation: pooled.generation,
                channel,
            });
        } else {
            debug!(channel = pooled.key, "Discarding released channel");
            if let Err(e) = channel.close().await {
                debug!(channel = pooled.key, error = %e, "Released channel close failed");
            }
        }
    }
}

/// Exclusive lease on one channel. Not `Clone`.
///
/// Dropping it without [`ChannelPool::release`] frees the slot and closes
/// the channel in the background.
pub struct PooledChannel {
    key: u64,
    generation: u64,
    channel: Option<Box<dyn AmqpChannel>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledChannel {
    /// Pool-assigned key, stable for the life of the channel and never reused.
    pub fn key(&self) -> u64 {
        self.key
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Open and belonging to the live connection.
    pub fn is_usable(&self) -> bool {
        self.generation == self.pool.connection.generation()
            && self.channel.as_ref().is_some_and(|c| c.is_open())
    }

    pub async fn close(mut self) -> Result<()> {
        match self.channel.take() {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }
}

impl Deref for PooledChannel {
    type Target = dyn AmqpChannel;

    fn deref(&self) -> &Self::Target {
        match self.channel.as_deref() {
            Some(channel) => channel,
            None => unreachable!("pooled channel is only emptied when consumed"),
        }
    }
}

impl fmt::Debug for PooledChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledChannel")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let key = self.key;
                handle.spawn(async move {
                    if let Err(e) = channel.close().await {
                        debug!(channel = key, error = %e, "Dropped channel close failed");
                    }
                });
            }
            Err(_) => warn!(channel = self.key, "Dropping channel outside of a runtime"),
        }
    }
}

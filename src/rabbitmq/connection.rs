// src/rabbitmq/connection.rs

use super::errors::{RabbitMQError, Result};
use super::topology::Topology;
use super::transport::{AmqpChannel, AmqpConnection, AmqpTransport};
use crate::config::{BackoffKind, BrokerEndpoint, RecoveryConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Lifecycle notifications for whoever holds a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { generation: u64 },
    Lost { generation: u64 },
    Recovered { generation: u64, attempts: u32 },
    Fatal { attempts: u32 },
}

/// Owns the single broker connection and brings it back after failures.
///
/// Every successful (re)connect bumps the generation. Channels opened under
/// an older generation are dead and must not be used again.
pub struct ConnectionManager {
    transport: Arc<dyn AmqpTransport>,
    endpoint: BrokerEndpoint,
    topology: Topology,
    recovery: RecoveryConfig,
    connection: RwLock<Option<Arc<dyn AmqpConnection>>>,
    generation: AtomicU64,
    recovery_lock: Mutex<()>,
    closed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    fatal: watch::Sender<Option<u32>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn AmqpTransport>,
        endpoint: BrokerEndpoint,
        topology: Topology,
        recovery: RecoveryConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (fatal, _) = watch::channel(None);
        Self {
            transport,
            endpoint,
            topology,
            recovery,
            connection: RwLock::new(None),
            generation: AtomicU64::new(0),
            recovery_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            events,
            fatal,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Generation of the current connection; 0 before the first connect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn current(&self) -> Option<Arc<dyn AmqpConnection>> {
        self.connection
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn install(&self, connection: Option<Arc<dyn AmqpConnection>>) {
        *self
            .connection
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = connection;
    }

    pub fn is_connected(&self) -> bool {
        self.current().is_some_and(|c| c.is_connected())
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.borrow().is_some()
    }

    /// Establish the first connection and declare the topology on it.
    pub async fn connect(&self) -> Result<()> {
        self.topology.validate()?;
        info!(address = %self.endpoint.display_address(), "Connecting to RabbitMQ");

        let _guard = self.recovery_lock.lock().await;
        let connection = self.establish().await?;
        self.install(Some(connection));
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        info!(generation, "Connected to RabbitMQ");
        let _ = self.events.send(ConnectionEvent::Connected { generation });
        Ok(())
    }

    async fn establish(&self) -> Result<Arc<dyn AmqpConnection>> {
        let connection = self.transport.connect(&self.endpoint).await?;
        if let Err(e) = self.declare_topology(connection.as_ref()).await {
            if let Err(close) = connection.close().await {
                debug!(error = %close, "Connection close after failed declaration failed");
            }
            return Err(e);
        }
        Ok(connection)
    }

    async fn declare_topology(&self, connection: &dyn AmqpConnection) -> Result<()> {
        let channel = connection.create_channel().await?;
        let declared = self.topology.declare(channel.as_ref()).await;
        if let Err(e) = channel.close().await {
            debug!(error = %e, "Declaration channel close failed");
        }
        declared?;
        debug!(
            exchanges = self.topology.exchanges.len(),
            queues = self.topology.queues.len(),
            bindings = self.topology.bindings.len(),
            "Topology declared"
        );
        Ok(())
    }

    /// Open a fresh channel tagged with the generation it belongs to.
    pub async fn open_channel(&self) -> Result<(u64, Box<dyn AmqpChannel>)> {
        let generation = self.generation();
        let connection = self
            .current()
            .filter(|c| c.is_connected())
            .ok_or_else(|| RabbitMQError::ConnectionError("No active connection".to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| match e {
                RabbitMQError::ConnectionError(msg) => RabbitMQError::ConnectionError(msg),
                other => RabbitMQError::ChannelError(other.to_string()),
            })?;
        Ok((generation, channel))
    }

    /// Reconnect after `observed_generation` was seen to fail.
    ///
    /// Only one recovery runs at a time. A caller that arrives after another
    /// caller already recovered past `observed_generation` gets the new
    /// generation back without touching the broker.
    pub async fn recover(&self, observed_generation: u64) -> Result<u64> {
        let _guard = self.recovery_lock.lock().await;

        if let Some(attempts) = *self.fatal.borrow() {
            return Err(RabbitMQError::RecoveryExhausted { attempts });
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(RabbitMQError::ConnectionError(
                "Connection manager is closed".to_string(),
            ));
        }
        let generation = self.generation();
        if generation > observed_generation && self.is_connected() {
            return Ok(generation);
        }

        warn!(generation, "Connection lost, starting recovery");
        let _ = self.events.send(ConnectionEvent::Lost { generation });
        if let Some(stale) = self.current() {
            if let Err(e) = stale.close().await {
                debug!(generation, error = %e, "Closing lost connection failed");
            }
        }
        self.install(None);

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let delay = self.retry_delay(attempts);
            debug!(attempt = attempts, delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
            sleep(delay).await;

            if self.closed.load(Ordering::SeqCst) {
                return Err(RabbitMQError::ConnectionError(
                    "Connection manager is closed".to_string(),
                ));
            }

            match self.establish().await {
                Ok(connection) => {
                    self.install(Some(connection));
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(generation, attempts, "Connection recovered");
                    let _ = self
                        .events
                        .send(ConnectionEvent::Recovered { generation, attempts });
                    return Ok(generation);
                }
                Err(err) => {
                    error!(
                        "Failed to reconnect to RabbitMQ (attempt {}/{}): {}",
                        attempts,
                        self.recovery
                            .max_attempts
                            .map_or_else(|| "unbounded".to_string(), |m| m.to_string()),
                        err
                    );
                    if self.recovery.max_attempts.is_some_and(|max| attempts >= max) {
                        error!("Max reconnection attempts reached. Giving up.");
                        self.fatal.send_replace(Some(attempts));
                        let _ = self.events.send(ConnectionEvent::Fatal { attempts });
                        return Err(RabbitMQError::RecoveryExhausted { attempts });
                    }
                }
            }
        }
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        retry_delay(&self.recovery, attempt, rand::random::<f64>())
    }

    /// Resolves once recovery has been given up for good.
    pub async fn wait_fatal(&self) -> RabbitMQError {
        let mut fatal = self.fatal.subscribe();
        let err = match fatal.wait_for(|state| state.is_some()).await {
            Ok(state) => RabbitMQError::RecoveryExhausted {
                attempts: state.unwrap_or_default(),
            },
            Err(_) => RabbitMQError::ConnectionError("Connection manager dropped".to_string()),
        };
        err
    }

    /// Poll the connection and trigger recovery when it drops on its own.
    pub fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.recovery.watchdog_interval();
        tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if manager.closed.load(Ordering::SeqCst) || manager.is_fatal() {
                    break;
                }
                if manager.is_connected() {
                    continue;
                }
                let generation = manager.generation();
                if let Err(e) = manager.recover(generation).await {
                    if !matches!(e, RabbitMQError::ConnectionError(_)) {
                        warn!(error = %e, "Connection watchdog stopping");
                    }
                    break;
                }
            }
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(connection) = self.current() {
            info!("Closing RabbitMQ connection gracefully");
            connection.close().await?;
        }
        self.install(None);
        Ok(())
    }
}

/// Delay before reconnect attempt number `attempt` (1-based).
///
/// `noise` is a uniform sample in [0, 1); jitter spreads the delay by ±15%.
pub(crate) fn retry_delay(config: &RecoveryConfig, attempt: u32, noise: f64) -> Duration {
    let base = config.network_recovery_interval_ms;
    let mut delay = match config.backoff {
        BackoffKind::Fixed => base,
        BackoffKind::Exponential => {
            let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
            base.saturating_mul(factor).min(config.max_interval_ms.max(base))
        }
    };
    if config.jitter {
        let jitter = (noise * 0.3 - 0.15) * delay as f64;
        delay = (delay as f64 + jitter).max(0.0) as u64;
    }
    Duration::from_millis(delay)
}

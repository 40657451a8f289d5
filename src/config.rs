// src/config.rs
use crate::rabbitmq::errors::RabbitMQError;
use crate::rabbitmq::topology::{
    BindingDefinition, ExchangeDefinition, ExchangeKind, QueueDefinition, Topology,
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "rabbit-consumer.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub endpoint: BrokerEndpoint,
    #[serde(default = "default_topology")]
    pub topology: Topology,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub channel_pool: ChannelPoolConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
}

/// Where the broker lives and how this client introduces itself.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerEndpoint {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_vhost")]
    pub virtual_host: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_password")]
    pub password: String,
    #[serde(default)]
    pub client: ClientIdentity,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

/// Announced to the broker as client properties, visible in the management UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientIdentity {
    pub principal: String,
    pub description: String,
    pub contact: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_min_concurrency")]
    pub min_concurrency: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Unacknowledged deliveries one consumer may hold (also its prefetch).
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: u16,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_handler_timeout")]
    pub handler_timeout_ms: u64,
    #[serde(default = "default_redelivery_limit")]
    pub redelivery_limit: u32,
    /// Handler executions allowed at once across all consumers of a pool.
    #[serde(default = "default_dispatch_workers")]
    pub dispatch_workers: usize,
    #[serde(default = "default_ledger_capacity")]
    pub redelivery_ledger_capacity: usize,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterConfig {
    pub exchange: String,
    #[serde(default)]
    pub routing_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_recovery_interval")]
    pub network_recovery_interval_ms: u64,
    /// `None` keeps retrying forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_max_recovery_interval")]
    pub max_interval_ms: u64,
    #[serde(default)]
    pub jitter: bool,
    /// How often the watchdog checks the connection between failures.
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelPoolConfig {
    #[serde(default = "default_channel_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_trigger")]
    pub consecutive_active_trigger: u32,
    #[serde(default = "default_trigger")]
    pub consecutive_idle_trigger: u32,
    #[serde(default = "default_start_interval")]
    pub start_consumer_min_interval_ms: u64,
    #[serde(default = "default_stop_interval")]
    pub stop_consumer_min_interval_ms: u64,
    /// Ready messages above which a sample counts as backlog.
    #[serde(default)]
    pub backlog_threshold: u32,
}

// Default values
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 5672 }
fn default_vhost() -> String { "/".to_string() }
fn default_username() -> String { "guest".to_string() }
fn default_password() -> String { "guest".to_string() }
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 30 }
fn default_queue() -> String { "orders.add".to_string() }
fn default_min_concurrency() -> usize { 5 }
fn default_max_concurrency() -> usize { 10 }
fn default_max_in_flight() -> u16 { 10 }
fn default_shutdown_timeout() -> u64 { 5000 }
fn default_tag_prefix() -> String { "orders-add".to_string() }
fn default_handler_timeout() -> u64 { 30_000 }
fn default_redelivery_limit() -> u32 { 5 }
fn default_dispatch_workers() -> usize { 32 }
fn default_ledger_capacity() -> usize { 10_000 }
fn default_recovery_interval() -> u64 { 10_000 }
fn default_max_recovery_interval() -> u64 { 30_000 }
fn default_watchdog_interval() -> u64 { 1000 }
fn default_channel_capacity() -> usize { 25 }
fn default_true() -> bool { true }
fn default_sample_interval() -> u64 { 1000 }
fn default_trigger() -> u32 { 10 }
fn default_start_interval() -> u64 { 10_000 }
fn default_stop_interval() -> u64 { 60_000 }

fn default_topology() -> Topology {
    Topology::new()
        .exchange(ExchangeDefinition::new("orders", ExchangeKind::Direct))
        .queue(QueueDefinition::new("orders.add"))
        .binding(BindingDefinition::new("orders.add", "orders", "add"))
}

impl Default for BrokerEndpoint {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            virtual_host: default_vhost(),
            username: default_username(),
            password: default_password(),
            client: ClientIdentity::default(),
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
        }
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"***")
            .field("client", &self.client)
            .finish()
    }
}

impl BrokerEndpoint {
    pub fn connection_name(&self) -> String {
        format!("{} ({})", self.client.principal, self.client.description)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// `host:port/vhost`, safe to log.
    pub fn display_address(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.virtual_host)
    }
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            principal: "rabbit-consumer".to_string(),
            description: "Order processing consumer".to_string(),
            contact: "ops@example.com".to_string(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            min_concurrency: default_min_concurrency(),
            max_concurrency: default_max_concurrency(),
            max_in_flight: default_max_in_flight(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            tag_prefix: default_tag_prefix(),
        }
    }
}

impl ConsumerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            handler_timeout_ms: default_handler_timeout(),
            redelivery_limit: default_redelivery_limit(),
            dispatch_workers: default_dispatch_workers(),
            redelivery_ledger_capacity: default_ledger_capacity(),
            dead_letter: None,
        }
    }
}

impl DispatchConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            network_recovery_interval_ms: default_recovery_interval(),
            max_attempts: None,
            backoff: BackoffKind::Fixed,
            max_interval_ms: default_max_recovery_interval(),
            jitter: false,
            watchdog_interval_ms: default_watchdog_interval(),
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.network_recovery_interval_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

impl Default for ChannelPoolConfig {
    fn default() -> Self {
        Self {
            capacity: default_channel_capacity(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_interval_ms: default_sample_interval(),
            consecutive_active_trigger: default_trigger(),
            consecutive_idle_trigger: default_trigger(),
            start_consumer_min_interval_ms: default_start_interval(),
            stop_consumer_min_interval_ms: default_stop_interval(),
            backlog_threshold: 0,
        }
    }
}

impl ScalingConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: BrokerEndpoint::default(),
            topology: default_topology(),
            consumer: ConsumerConfig::default(),
            dispatch: DispatchConfig::default(),
            recovery: RecoveryConfig::default(),
            channel_pool: ChannelPoolConfig::default(),
            scaling: ScalingConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> std::result::Result<(), RabbitMQError> {
        let consumer = &self.consumer;
        if consumer.queue.is_empty() {
            return Err(RabbitMQError::ConfigError(
                "consumer.queue cannot be empty".to_string(),
            ));
        }
        if consumer.min_concurrency == 0 {
            return Err(RabbitMQError::ConfigError(
                "consumer.min_concurrency must be at least 1".to_string(),
            ));
        }
        if consumer.min_concurrency > consumer.max_concurrency {
            return Err(RabbitMQError::ConfigError(format!(
                "consumer.min_concurrency ({}) exceeds consumer.max_concurrency ({})",
                consumer.min_concurrency, consumer.max_concurrency
            )));
        }
        if consumer.max_in_flight == 0 {
            return Err(RabbitMQError::ConfigError(
                "consumer.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.dispatch.dispatch_workers == 0 {
            return Err(RabbitMQError::ConfigError(
                "dispatch.dispatch_workers must be at least 1".to_string(),
            ));
        }
        // One channel per consumer plus one for declarations, probes and publishing.
        if self.channel_pool.capacity < consumer.max_concurrency + 1 {
            return Err(RabbitMQError::ConfigError(format!(
                "channel_pool.capacity ({}) must exceed consumer.max_concurrency ({})",
                self.channel_pool.capacity, consumer.max_concurrency
            )));
        }
        if self.dispatch.handler_timeout_ms == 0 {
            return Err(RabbitMQError::ConfigError(
                "dispatch.handler_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.scaling.sample_interval_ms == 0 {
            return Err(RabbitMQError::ConfigError(
                "scaling.sample_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.recovery.watchdog_interval_ms == 0 {
            return Err(RabbitMQError::ConfigError(
                "recovery.watchdog_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.recovery.max_attempts == Some(0) {
            return Err(RabbitMQError::ConfigError(
                "recovery.max_attempts must be at least 1 when set".to_string(),
            ));
        }
        self.topology.validate()
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Config directory", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, ./config or your home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config_from(path: &Path) -> Result<RuntimeConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: RuntimeConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    Ok(config)
}

pub fn load_config() -> Result<RuntimeConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&RuntimeConfig::default())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}

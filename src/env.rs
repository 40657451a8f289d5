use crate::config::RuntimeConfig;
use anyhow::{Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;

pub const AMQP_HOST: &str = "AMQP_HOST";
pub const AMQP_PORT: &str = "AMQP_PORT";
pub const AMQP_VHOST: &str = "AMQP_VHOST";
pub const AMQP_USERNAME: &str = "AMQP_USERNAME";
pub const AMQP_PASSWORD: &str = "AMQP_PASSWORD";
pub const CONSUMER_QUEUE: &str = "CONSUMER_QUEUE";
pub const CONSUMER_MIN_CONCURRENCY: &str = "CONSUMER_MIN_CONCURRENCY";
pub const CONSUMER_MAX_CONCURRENCY: &str = "CONSUMER_MAX_CONCURRENCY";

/// Overlay `.env` / process environment values on top of a loaded config.
pub fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    dotenv().ok();
    apply_overrides_with(config, |key| env::var(key).ok())
}

/// Same as [`apply_env_overrides`] with an explicit variable source.
pub fn apply_overrides_with<F>(config: &mut RuntimeConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup(AMQP_HOST) {
        config.endpoint.host = host;
    }
    if let Some(port) = parse_var(&lookup, AMQP_PORT)? {
        config.endpoint.port = port;
    }
    if let Some(vhost) = lookup(AMQP_VHOST) {
        config.endpoint.virtual_host = vhost;
    }
    if let Some(username) = lookup(AMQP_USERNAME) {
        config.endpoint.username = username;
    }
    if let Some(password) = lookup(AMQP_PASSWORD) {
        config.endpoint.password = password;
    }
    if let Some(queue) = lookup(CONSUMER_QUEUE) {
        config.consumer.queue = queue;
    }
    if let Some(min) = parse_var(&lookup, CONSUMER_MIN_CONCURRENCY)? {
        config.consumer.min_concurrency = min;
    }
    if let Some(max) = parse_var(&lookup, CONSUMER_MAX_CONCURRENCY)? {
        config.consumer.max_concurrency = max;
    }
    Ok(())
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(val) => Ok(Some(
            val.parse::<T>()
                .with_context(|| format!("{} has an invalid value '{}'", key, val))?,
        )),
        None => Ok(None),
    }
}

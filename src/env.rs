// src/env.rs
// Environment overrides on top of the config file
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use dotenv::dotenv;

use crate::config::Config;

pub const CONFIG_PATH_VAR: &str = "TASKBUS_CONFIG";

/// Explicit config file location, if one is set.
pub fn config_path_override<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(CONFIG_PATH_VAR)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Loads `.env` (when present) and applies the process environment.
pub fn apply_env_overrides(config: &mut Config) -> Result<()> {
    dotenv().ok();
    apply_overrides(config, |key| env::var(key).ok())
}

pub fn apply_overrides<F>(config: &mut Config, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("RABBITMQ_URL") {
        config.rabbitmq.url = url;
    }
    if let Some(count) = parse(&lookup, "RABBITMQ_PREFETCH_COUNT")? {
        config.rabbitmq.prefetch_count = count;
    }
    if let Some(timeout) = parse(&lookup, "RABBITMQ_CONFIRM_TIMEOUT_MS")? {
        config.rabbitmq.confirm_timeout_ms = timeout;
    }
    if let Some(attempts) = parse(&lookup, "RABBITMQ_RECONNECT_ATTEMPTS")? {
        config.rabbitmq.reconnect_attempts = attempts;
    }
    if let Some(debug) = parse(&lookup, "TASKBUS_DEBUG")? {
        config.debug = debug;
    }
    Ok(())
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .context(format!("Invalid value for {}: {:?}", key, value)),
        None => Ok(None),
    }
}

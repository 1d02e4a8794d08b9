use std::collections::HashSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::db::PoolConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has invalid value '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Message bus backend selected by `BUS_TYPE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    InMemory,
    Nats,
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub pool: PoolConfig,
    pub bus_type: BusType,
    pub nats_url: String,
    pub host: String,
    pub port: u16,
    pub outbox_sweep_interval: Duration,
    pub outbox_batch_size: i64,
    pub outbox_max_attempts: i32,
    pub outbox_backoff_initial: Duration,
    pub outbox_backoff_max: Duration,
    pub outbox_retention_days: i64,
    pub outbox_retention_interval: Duration,
    pub listener_max_deliveries: u32,
    /// Upper-cased event types that never produce notifications
    pub blocked_event_types: HashSet<String>,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let pool = pool_config(&lookup)?;

        let bus_type = match lookup("BUS_TYPE")
            .unwrap_or_else(|| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "inmemory" => BusType::InMemory,
            "nats" => BusType::Nats,
            other => {
                return Err(ConfigError::Invalid {
                    key: "BUS_TYPE",
                    value: other.to_string(),
                })
            }
        };

        let nats_url = lookup("NATS_URL").unwrap_or_else(|| "nats://localhost:4222".to_string());
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port: u16 = parse(&lookup, "PORT", 8089)?;

        let outbox_sweep_interval =
            Duration::from_millis(positive(&lookup, "OUTBOX_SWEEP_INTERVAL_MS", 1000)?);
        let outbox_batch_size = positive(&lookup, "OUTBOX_BATCH_SIZE", 100)?;
        let outbox_max_attempts = positive(&lookup, "OUTBOX_MAX_ATTEMPTS", 5)?;
        let outbox_backoff_initial =
            Duration::from_millis(positive(&lookup, "OUTBOX_BACKOFF_INITIAL_MS", 500)?);
        let outbox_backoff_max =
            Duration::from_millis(positive(&lookup, "OUTBOX_BACKOFF_MAX_MS", 60_000)?);
        let outbox_retention_days = positive(&lookup, "OUTBOX_RETENTION_DAYS", 30)?;
        let outbox_retention_interval =
            Duration::from_secs(positive(&lookup, "OUTBOX_RETENTION_INTERVAL_SECS", 3600)?);
        let listener_max_deliveries = positive(&lookup, "LISTENER_MAX_DELIVERIES", 5)?;

        let blocked_event_types = lookup("NOTIFICATIONS_BLOCKED_EVENT_TYPES")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let log_json = lookup("LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(Config {
            database_url,
            pool,
            bus_type,
            nats_url,
            host,
            port,
            outbox_sweep_interval,
            outbox_batch_size,
            outbox_max_attempts,
            outbox_backoff_initial,
            outbox_backoff_max,
            outbox_retention_days,
            outbox_retention_interval,
            listener_max_deliveries,
            blocked_event_types,
            log_json,
        })
    }
}

fn pool_config<F>(lookup: &F) -> Result<PoolConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = PoolConfig::default();
    let max_connections = positive(lookup, "DB_MAX_CONNECTIONS", defaults.max_connections)?;
    let min_connections = parse(lookup, "DB_MIN_CONNECTIONS", defaults.min_connections)?;
    if min_connections > max_connections {
        return Err(ConfigError::Invalid {
            key: "DB_MIN_CONNECTIONS",
            value: min_connections.to_string(),
        });
    }
    let acquire_timeout = Duration::from_secs(positive(
        lookup,
        "DB_ACQUIRE_TIMEOUT_SECS",
        defaults.acquire_timeout.as_secs(),
    )?);

    Ok(PoolConfig {
        max_connections,
        min_connections,
        acquire_timeout,
    })
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn positive<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default + ToString,
{
    let value = parse(lookup, key, default)?;
    if value <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        });
    }
    Ok(value)
}

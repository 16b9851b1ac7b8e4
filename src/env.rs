use dotenv::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::rabbitmq::{QueueManagerConfig, ReconnectConfig};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} has invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub amqp_addrs: Vec<String>,
    pub reconnect_interval_ms: u64,
    pub reconnect_max_attempt: u32,
    pub rabbitmq_prefetch_count: u16,
    pub rabbitmq_connect_timeout_seconds: u64,
}

fn default_reconnect_interval_ms() -> u64 {
    1000
}

fn default_reconnect_max_attempt() -> u32 {
    5
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

impl EnvConfig {
    /// Reads `.env` (if present) and then the process environment.
    pub fn load() -> Result<Self, EnvError> {
        dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, EnvError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let amqp_addrs: Vec<String> = lookup("AMQP_ADDR")
            .ok_or(EnvError::Missing("AMQP_ADDR"))?
            .split(',')
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect();
        if amqp_addrs.is_empty() {
            return Err(EnvError::Missing("AMQP_ADDR"));
        }

        Ok(EnvConfig {
            amqp_addrs,
            reconnect_interval_ms: parse_or(&lookup, "RMQ_RECONNECT_INTERVAL_MS", default_reconnect_interval_ms)?,
            reconnect_max_attempt: parse_or(&lookup, "RMQ_RECONNECT_MAX_ATTEMPT", default_reconnect_max_attempt)?,
            rabbitmq_prefetch_count: parse_or(&lookup, "RABBITMQ_PREFETCH_COUNT", default_prefetch_count)?,
            rabbitmq_connect_timeout_seconds: parse_or(
                &lookup,
                "RABBITMQ_CONNECT_TIMEOUT_SECONDS",
                default_connect_timeout_seconds,
            )?,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.rabbitmq_connect_timeout_seconds)
    }

    pub fn manager_config(&self) -> QueueManagerConfig {
        QueueManagerConfig {
            reconnect: ReconnectConfig {
                interval_ms: self.reconnect_interval_ms,
                max_attempt: self.reconnect_max_attempt,
            },
            connect_timeout_ms: self.rabbitmq_connect_timeout_seconds.saturating_mul(1000),
            ..QueueManagerConfig::new(self.amqp_addrs.clone())
        }
    }
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: fn() -> T) -> Result<T, EnvError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| EnvError::Invalid { name, value }),
        None => Ok(default()),
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! [`BrokerConfig`] can be deserialized from the host application's
//! configuration file or loaded from environment variables through [`FromEnv`]:
//!
//! - `BROKER_URL` (required)
//! - `BROKER_USERNAME`, `BROKER_PASSWORD`
//! - `BROKER_HEALTH_CHECK_MS` (default 2000)
//! - `BROKER_SHUTDOWN_WAIT_SECS` (default 20)
//! - `BROKER_TTL_SECS` (default -1, no TTL)
//! - `BROKER_POOL_MAX_CONNECTIONS` (default 1)
//! - `BROKER_POOL_MAX_SESSIONS` (default 500)
//! - `BROKER_POOL_BLOCK_IF_FULL` (default true)

use crate::errors::ConfigError;
use serde::Deserialize;
use std::{env, fmt, str::FromStr, time::Duration};

/// Configuration that can be loaded from environment variables.
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Value of `key`, or `default` when unset.
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Value of `key`, or an error when unset.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_parse<T>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    env_or_default(key, default)
        .parse()
        .map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{}", e),
        })
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    pub max_connections: usize,
    #[serde(alias = "maximumActiveSessionPerConnection")]
    pub max_sessions_per_connection: usize,
    pub block_if_session_pool_is_full: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_connections: 1,
            max_sessions_per_connection: 500,
            block_if_session_pool_is_full: true,
        }
    }
}

impl FromEnv for PoolConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(PoolConfig {
            max_connections: env_parse("BROKER_POOL_MAX_CONNECTIONS", "1")?,
            max_sessions_per_connection: env_parse("BROKER_POOL_MAX_SESSIONS", "500")?,
            block_if_session_pool_is_full: env_parse("BROKER_POOL_BLOCK_IF_FULL", "true")?,
        })
    }
}

/// Settings of one broker.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    pub broker_url: String,
    #[serde(default)]
    pub broker_username: Option<String>,
    #[serde(default)]
    pub broker_password: Option<String>,
    #[serde(default = "default_health_check_millis")]
    pub health_check_milliseconds_to_wait: u64,
    #[serde(default = "default_shutdown_wait")]
    pub shutdown_wait_in_seconds: u64,
    /// Default time to live of sent messages. Zero or negative disables it.
    #[serde(default = "default_ttl")]
    pub time_to_live_in_seconds: i64,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_health_check_millis() -> u64 {
    2000
}

fn default_shutdown_wait() -> u64 {
    20
}

fn default_ttl() -> i64 {
    -1
}

impl BrokerConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        BrokerConfig {
            broker_url: broker_url.into(),
            broker_username: None,
            broker_password: None,
            health_check_milliseconds_to_wait: default_health_check_millis(),
            shutdown_wait_in_seconds: default_shutdown_wait(),
            time_to_live_in_seconds: default_ttl(),
            pool: PoolConfig::default(),
        }
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.broker_username = Some(username.to_owned());
        self.broker_password = Some(password.to_owned());
        self
    }

    pub fn health_check_wait(&self) -> Duration {
        Duration::from_millis(self.health_check_milliseconds_to_wait)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_in_seconds)
    }

    /// TTL applied to senders created without one, `None` when disabled.
    pub fn default_ttl(&self) -> Option<Duration> {
        u64::try_from(self.time_to_live_in_seconds)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("broker_url", &self.broker_url)
            .field("broker_username", &self.broker_username)
            .field(
                "broker_password",
                &self.broker_password.as_ref().map(|_| "<redacted>"),
            )
            .field(
                "health_check_milliseconds_to_wait",
                &self.health_check_milliseconds_to_wait,
            )
            .field("shutdown_wait_in_seconds", &self.shutdown_wait_in_seconds)
            .field("time_to_live_in_seconds", &self.time_to_live_in_seconds)
            .field("pool", &self.pool)
            .finish()
    }
}

impl FromEnv for BrokerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(BrokerConfig {
            broker_url: env_required("BROKER_URL")?,
            broker_username: env::var("BROKER_USERNAME").ok(),
            broker_password: env::var("BROKER_PASSWORD").ok(),
            health_check_milliseconds_to_wait: env_parse("BROKER_HEALTH_CHECK_MS", "2000")?,
            shutdown_wait_in_seconds: env_parse("BROKER_SHUTDOWN_WAIT_SECS", "20")?,
            time_to_live_in_seconds: env_parse("BROKER_TTL_SECS", "-1")?,
            pool: PoolConfig::from_env()?,
        })
    }
}

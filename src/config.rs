use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cleanup::{CleanupSettings, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_path: PathBuf,

    // Cleanup defaults
    pub inactivity_days: u32,
    pub chunk_size: NonZeroUsize,

    // Run lock
    pub lock_key: String,
    pub lock_ttl: Duration,
    pub lock_backend: LockBackendKind,
    pub lock_timeout: Duration,

    // Scheduler
    pub schedule_enabled: bool,
    pub schedule_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,

    // Web Server
    pub web_host: String,
    pub web_port: u16,
}

/// Where the cleanup run lock lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackendKind {
    /// A row in the shared SQLite database, visible to every process using it
    Sqlite,
    /// Process-local map; only guards runs within one process
    Memory,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an unparseable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Database
            database_path: PathBuf::from(env_or_default("DATABASE_PATH", "./data/users.sqlite")),

            // Cleanup defaults
            inactivity_days: parse_env_u32("INACTIVITY_DAYS", 30)?,
            chunk_size: parse_env_nonzero_usize("CLEANUP_CHUNK_SIZE", 1000)?,

            // Run lock
            lock_key: env_or_default("CLEANUP_LOCK_KEY", "cleanup_inactive_lock_v1"),
            lock_ttl: Duration::from_secs(parse_env_u64("CLEANUP_LOCK_TTL_SECS", 3600)?),
            lock_backend: parse_lock_backend(&env_or_default("LOCK_BACKEND", "sqlite"))?,
            lock_timeout: Duration::from_secs(parse_env_u64("LOCK_TIMEOUT_SECS", 5)?),

            // Scheduler
            schedule_enabled: parse_env_bool("CLEANUP_SCHEDULE_ENABLED", true)?,
            schedule_interval: Duration::from_secs(parse_env_u64("CLEANUP_INTERVAL_SECS", 300)?),
            max_retries: parse_env_u32("CLEANUP_MAX_RETRIES", 3)?,
            retry_delay: Duration::from_secs(parse_env_u64("CLEANUP_RETRY_DELAY_SECS", 60)?),

            // Web Server
            web_host: env_or_default("WEB_HOST", "0.0.0.0"),
            web_port: parse_env_u16("WEB_PORT", 8080)?,
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_key.is_empty() {
            return Err(invalid("CLEANUP_LOCK_KEY", "cannot be empty"));
        }
        if self.lock_ttl.is_zero() {
            return Err(invalid("CLEANUP_LOCK_TTL_SECS", "must be at least 1"));
        }
        if self.lock_timeout.is_zero() {
            return Err(invalid("LOCK_TIMEOUT_SECS", "must be at least 1"));
        }
        if self.schedule_interval.is_zero() {
            return Err(invalid("CLEANUP_INTERVAL_SECS", "must be at least 1"));
        }
        Ok(())
    }

    /// The process-wide defaults handed to the cleanup job at construction.
    #[must_use]
    pub fn cleanup_settings(&self) -> CleanupSettings {
        CleanupSettings {
            threshold_days: self.inactivity_days,
            chunk_size: self.chunk_size,
            lock_key: self.lock_key.clone(),
            lock_ttl: self.lock_ttl,
            lock_timeout: self.lock_timeout,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                delay: self.retry_delay,
            },
        }
    }
}

fn invalid(name: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message: message.to_string(),
    }
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_nonzero_usize(name: &str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let value: usize = match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        })?,
        _ => default,
    };
    NonZeroUsize::new(value).ok_or_else(|| invalid(name, "must be at least 1"))
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_lock_backend(value: &str) -> Result<LockBackendKind, ConfigError> {
    match value.to_lowercase().as_str() {
        "sqlite" => Ok(LockBackendKind::Sqlite),
        "memory" => Ok(LockBackendKind::Memory),
        _ => Err(ConfigError::InvalidValue {
            name: "LOCK_BACKEND".to_string(),
            message: format!("must be 'sqlite' or 'memory', got '{value}'"),
        }),
    }
}

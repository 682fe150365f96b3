//! Client configuration.
//!
//! Only `base_url` is required; every tuning knob has a default matching the
//! behavior hosts expect out of the box. Load from TOML or build in code.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub base_url: String,
    #[serde(default = "default_renew_path")]
    pub renew_path: String,
    /// Renew when the credential expires within this window.
    #[serde(default = "default_renew_threshold_ms")]
    pub renew_threshold_ms: u64,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,
    /// TTL applied when a cached call does not name its own.
    #[serde(default = "default_cache_ttl_ms")]
    pub default_cache_ttl_ms: u64,
    /// Fraction of the TTL after which a cache hit schedules a background refresh.
    #[serde(default = "default_refresh_ratio")]
    pub refresh_ratio: f64,
    #[serde(default = "default_stale_task_ms")]
    pub stale_task_ms: u64,
    /// Handed to the built-in HTTP transport; the orchestrator itself never times out a call.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub success_code: i64,
    #[serde(default = "default_token_expired_code")]
    pub token_expired_code: i64,
    #[serde(default)]
    pub durable_cache_dir: Option<PathBuf>,
}

fn default_renew_path() -> String {
    "/auth/renew".to_string()
}

fn default_renew_threshold_ms() -> u64 {
    60_000
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_cap_ms() -> u64 {
    5_000
}

fn default_cache_ttl_ms() -> u64 {
    300_000
}

fn default_refresh_ratio() -> f64 {
    0.8
}

fn default_stale_task_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_token_expired_code() -> i64 {
    1001
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            renew_path: default_renew_path(),
            renew_threshold_ms: default_renew_threshold_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            default_cache_ttl_ms: default_cache_ttl_ms(),
            refresh_ratio: default_refresh_ratio(),
            stale_task_ms: default_stale_task_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            success_code: 0,
            token_expired_code: default_token_expired_code(),
            durable_cache_dir: None,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "base_url",
                reason: "must not be empty".to_string(),
            });
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                field: "base_url",
                reason: "must start with http:// or https://".to_string(),
            });
        }
        if !self.renew_path.starts_with('/') && !self.renew_path.starts_with("http") {
            return Err(ConfigError::InvalidValue {
                field: "renew_path",
                reason: "must be an absolute path or URL".to_string(),
            });
        }
        if self.retry_base_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retry_base_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry_cap_ms < self.retry_base_ms {
            return Err(ConfigError::InvalidValue {
                field: "retry_cap_ms",
                reason: "must be at least retry_base_ms".to_string(),
            });
        }
        if !(self.refresh_ratio > 0.0 && self.refresh_ratio <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "refresh_ratio",
                reason: "must be in (0, 1]".to_string(),
            });
        }
        if self.success_code == self.token_expired_code {
            return Err(ConfigError::InvalidValue {
                field: "token_expired_code",
                reason: "must differ from success_code".to_string(),
            });
        }
        Ok(())
    }

    pub fn renew_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.renew_threshold_ms as i64)
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.default_cache_ttl_ms)
    }

    pub fn stale_task_age(&self) -> Duration {
        Duration::from_millis(self.stale_task_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

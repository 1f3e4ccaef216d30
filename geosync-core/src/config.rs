//! Configuration for the sync layer.
//!
//! Every section has defaults so embedders may omit it entirely. Values read
//! from a file go through `validate()` before use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of entries before LRU eviction.
    pub max_size: usize,
    /// TTL applied to entries that do not carry their own.
    pub default_ttl_ms: u64,
    /// Expose `If-None-Match` / `If-Modified-Since` for cached entries.
    pub conditional_requests: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            default_ttl_ms: 300_000,
            conditional_requests: true,
        }
    }
}

impl CacheConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_default_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_ttl_ms = ttl_ms;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(invalid("cache.max_size", "must be > 0"));
        }
        if self.default_ttl_ms == 0 {
            return Err(invalid("cache.default_ttl_ms", "must be > 0"));
        }
        Ok(())
    }
}

/// Exponential backoff settings. Immutable once handed to a retrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Retries after the first attempt; total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    pub jitter: bool,
    /// Fraction of the delay used as the jitter half-width.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff used between stream reconnect attempts.
    pub fn reconnect_default() -> Self {
        Self {
            max_retries: 10,
            ..Self::default()
        }
    }

    /// Deterministic delays, handy for tests and scripted clients.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.initial_delay_ms = initial_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_section("retry")
    }

    fn validate_section(&self, section: &str) -> Result<(), ConfigError> {
        if self.initial_delay_ms == 0 {
            return Err(invalid(format!("{section}.initial_delay_ms"), "must be > 0"));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(invalid(
                format!("{section}.max_delay_ms"),
                "must be >= initial_delay_ms",
            ));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(invalid(format!("{section}.backoff_factor"), "must be >= 1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(invalid(
                format!("{section}.jitter_factor"),
                "must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

/// HTTP retrieval settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    /// Deadline for a single attempt.
    pub timeout_ms: u64,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            headers: BTreeMap::new(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout_ms == 0 {
            return Err(invalid("fetch.timeout_ms", "must be > 0"));
        }
        if let Some(name) = self.headers.keys().find(|k| k.trim().is_empty()) {
            return Err(invalid(
                "fetch.headers",
                format!("header name {:?} must not be empty", name),
            ));
        }
        Ok(())
    }
}

/// Streaming connection settings shared by every stream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSettings {
    pub reconnect: bool,
    pub protocols: Vec<String>,
    /// `max_retries` bounds consecutive failed reopen attempts.
    pub backoff: RetryConfig,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reconnect: true,
            protocols: Vec::new(),
            backoff: RetryConfig::reconnect_default(),
        }
    }
}

impl StreamSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(p) = self.protocols.iter().find(|p| p.trim().is_empty()) {
            return Err(invalid(
                "stream.protocols",
                format!("protocol {:?} must not be empty", p),
            ));
        }
        self.backoff.validate_section("stream.backoff")
    }
}

/// A single stream endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub reconnect: bool,
    #[serde(default = "RetryConfig::reconnect_default")]
    pub backoff: RetryConfig,
}

impl StreamConfig {
    /// Endpoint with reconnection disabled.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            reconnect: false,
            backoff: RetryConfig::reconnect_default(),
        }
    }

    pub fn from_settings(url: impl Into<String>, settings: &StreamSettings) -> Self {
        Self {
            url: url.into(),
            protocols: settings.protocols.clone(),
            reconnect: settings.reconnect,
            backoff: settings.backoff.clone(),
        }
    }

    pub fn with_reconnect(mut self, backoff: RetryConfig) -> Self {
        self.reconnect = true;
        self.backoff = backoff;
        self
    }

    pub fn with_protocols(mut self, protocols: Vec<String>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(invalid("stream.url", "must not be empty"));
        }
        self.backoff.validate_section("stream.backoff")
    }
}

/// Top-level configuration file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub fetch: FetchConfig,
    pub stream: StreamSettings,
}

impl SyncConfig {
    /// Read, parse and validate a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cache.validate()?;
        self.retry.validate()?;
        self.fetch.validate()?;
        self.stream.validate()?;
        Ok(())
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

//! Engine configuration
//!
//! Values come from `Default`, builder methods, a TOML file, or `ENGRAM_*`
//! environment variables layered over the defaults. Every source ends in
//! [`EngineConfig::validate`].

use crate::{ConfigError, EngramResult, EvictionPolicy, StorageFamily};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_PROMOTION_THRESHOLD: u64 = 2;
pub const DEFAULT_NAMESPACE: &str = "esr";
pub const DEFAULT_PROMOTION_QUEUE_CAPACITY: usize = 1_024;
pub const DEFAULT_SEARCH_TIMEOUT_MS: u64 = 3_000;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_HOT_ENTRY_LIMIT: usize = 10;

/// Retry policy for promotion writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff to wait after the given failed attempt (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Construction-time options for an ESR engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Entry capacity of the cache tier
    pub cache_size: usize,
    /// Access count at which an entry becomes eligible for promotion
    pub promotion_threshold: u64,
    /// Families that may receive promoted entries
    pub enable_backends: BTreeSet<StorageFamily>,
    /// Prefix applied to every backend key
    pub namespace: String,
    pub eviction_policy: EvictionPolicy,
    /// Bound of the promotion queue; a full queue rejects new tasks
    pub promotion_queue_capacity: usize,
    /// Per-family timeout for backend search and read fall-through
    pub search_timeout_ms: u64,
    /// How long `stop()` waits for queued promotions
    pub shutdown_timeout_ms: u64,
    /// Number of entries reported by pattern analysis
    pub hot_entry_limit: usize,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            promotion_threshold: DEFAULT_PROMOTION_THRESHOLD,
            enable_backends: StorageFamily::ALL.into_iter().collect(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            eviction_policy: EvictionPolicy::Lru,
            promotion_queue_capacity: DEFAULT_PROMOTION_QUEUE_CAPACITY,
            search_timeout_ms: DEFAULT_SEARCH_TIMEOUT_MS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            hot_entry_limit: DEFAULT_HOT_ENTRY_LIMIT,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_promotion_threshold(mut self, threshold: u64) -> Self {
        self.promotion_threshold = threshold;
        self
    }

    pub fn with_backends(mut self, families: impl IntoIterator<Item = StorageFamily>) -> Self {
        self.enable_backends = families.into_iter().collect();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.promotion_queue_capacity = capacity;
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn is_enabled(&self, family: StorageFamily) -> bool {
        self.enable_backends.contains(&family)
    }

    /// Parse a TOML document. Missing fields take their defaults.
    pub fn from_toml_str(contents: &str) -> EngramResult<Self> {
        let config: EngineConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file.
    pub fn from_path(path: &Path) -> EngramResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            reason: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    /// Build a config from environment variables layered over the defaults.
    ///
    /// # Environment Variables
    /// - `ENGRAM_CACHE_SIZE`
    /// - `ENGRAM_PROMOTION_THRESHOLD`
    /// - `ENGRAM_ENABLE_BACKENDS`: comma-separated family tags
    /// - `ENGRAM_NAMESPACE`
    /// - `ENGRAM_EVICTION_POLICY`
    /// - `ENGRAM_PROMOTION_QUEUE_CAPACITY`
    /// - `ENGRAM_SEARCH_TIMEOUT_MS`
    /// - `ENGRAM_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> EngramResult<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn with_overrides<F>(mut self, lookup: F) -> EngramResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ENGRAM_CACHE_SIZE") {
            self.cache_size = parse_number("cache_size", &v)?;
        }
        if let Some(v) = lookup("ENGRAM_PROMOTION_THRESHOLD") {
            self.promotion_threshold = parse_number("promotion_threshold", &v)?;
        }
        if let Some(v) = lookup("ENGRAM_ENABLE_BACKENDS") {
            let mut families = BTreeSet::new();
            for tag in v.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let family = tag.parse::<StorageFamily>().map_err(|e| ConfigError::InvalidValue {
                    field: "enable_backends".to_string(),
                    value: tag.to_string(),
                    reason: e.to_string(),
                })?;
                families.insert(family);
            }
            self.enable_backends = families;
        }
        if let Some(v) = lookup("ENGRAM_NAMESPACE") {
            self.namespace = v;
        }
        if let Some(v) = lookup("ENGRAM_EVICTION_POLICY") {
            self.eviction_policy = v.parse().map_err(|reason| ConfigError::InvalidValue {
                field: "eviction_policy".to_string(),
                value: v.clone(),
                reason,
            })?;
        }
        if let Some(v) = lookup("ENGRAM_PROMOTION_QUEUE_CAPACITY") {
            self.promotion_queue_capacity = parse_number("promotion_queue_capacity", &v)?;
        }
        if let Some(v) = lookup("ENGRAM_SEARCH_TIMEOUT_MS") {
            self.search_timeout_ms = parse_number("search_timeout_ms", &v)?;
        }
        if let Some(v) = lookup("ENGRAM_SHUTDOWN_TIMEOUT_MS") {
            self.shutdown_timeout_ms = parse_number("shutdown_timeout_ms", &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - cache_size, promotion_threshold, promotion_queue_capacity > 0
    /// - at least one backend family enabled
    /// - namespace is not blank
    /// - search_timeout_ms > 0
    /// - retry.max_attempts > 0 and retry.backoff_multiplier >= 1.0
    pub fn validate(&self) -> EngramResult<()> {
        if self.cache_size == 0 {
            return Err(invalid("cache_size", self.cache_size, "must be > 0"));
        }
        if self.promotion_threshold == 0 {
            return Err(invalid(
                "promotion_threshold",
                self.promotion_threshold,
                "must be > 0",
            ));
        }
        if self.enable_backends.is_empty() {
            return Err(invalid("enable_backends", "[]", "at least one family is required"));
        }
        if self.namespace.trim().is_empty() {
            return Err(invalid("namespace", &self.namespace, "must not be empty"));
        }
        if self.promotion_queue_capacity == 0 {
            return Err(invalid(
                "promotion_queue_capacity",
                self.promotion_queue_capacity,
                "must be > 0",
            ));
        }
        if self.search_timeout_ms == 0 {
            return Err(invalid("search_timeout_ms", self.search_timeout_ms, "must be > 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", self.retry.max_attempts, "must be > 0"));
        }
        if !self.retry.backoff_multiplier.is_finite() || self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                self.retry.backoff_multiplier,
                "must be a finite value >= 1.0",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: impl std::fmt::Display, reason: &str) -> crate::EngramError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn parse_number<T: std::str::FromStr>(field: &str, value: &str) -> EngramResult<T> {
    value.trim().parse().map_err(|_| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "expected a non-negative integer".to_string(),
        }
        .into()
    })
}

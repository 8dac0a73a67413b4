//! Error types for Engram operations

use crate::StorageFamily;
use std::time::Duration;
use thiserror::Error;

/// Backend family errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend {family} unavailable: {reason}")]
    Unavailable {
        family: StorageFamily,
        reason: String,
    },

    #[error("Backend {family} timed out after {after:?}")]
    Timeout {
        family: StorageFamily,
        after: Duration,
    },

    #[error("Backend {family} failed during {operation}: {reason}")]
    OperationFailed {
        family: StorageFamily,
        operation: String,
        reason: String,
    },

    #[error("Backend {family} is not enabled")]
    NotEnabled { family: StorageFamily },
}

impl BackendError {
    /// Family the failure originated from.
    pub fn family(&self) -> StorageFamily {
        match self {
            BackendError::Unavailable { family, .. }
            | BackendError::Timeout { family, .. }
            | BackendError::OperationFailed { family, .. }
            | BackendError::NotEnabled { family } => *family,
        }
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Promotion pipeline errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PromotionError {
    #[error("Promotion of {key} to {family} failed after {attempts} attempts: {reason}")]
    Failed {
        key: String,
        family: StorageFamily,
        attempts: u32,
        reason: String,
    },

    #[error("Promotion queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Promotion pipeline is shutting down")]
    ShuttingDown,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to read config file: {reason}")]
    Io { reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },
}

/// Master error type for all Engram errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngramError {
    #[error("Key not found: {key}")]
    NotFound { key: String },

    #[error("Cache full: all {capacity} entries are pending promotion")]
    CacheFull { capacity: usize },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Promotion error: {0}")]
    Promotion(#[from] PromotionError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Engram operations.
pub type EngramResult<T> = Result<T, EngramError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_display_unavailable() {
        let err = BackendError::Unavailable {
            family: StorageFamily::Document,
            reason: "connection refused".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("document"));
        assert!(msg.contains("connection refused"));
        assert_eq!(err.family(), StorageFamily::Document);
    }

    #[test]
    fn test_promotion_error_display_failed() {
        let err = PromotionError::Failed {
            key: "abc123".to_string(),
            family: StorageFamily::KeyValue,
            attempts: 3,
            reason: "disk full".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("abc123"));
        assert!(msg.contains("key_value"));
        assert!(msg.contains("3 attempts"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "cache_size".to_string(),
            value: "0".to_string(),
            reason: "must be > 0".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("cache_size"));
        assert!(msg.contains("must be > 0"));
    }

    #[test]
    fn test_engram_error_from_variants() {
        let backend = EngramError::from(BackendError::NotEnabled {
            family: StorageFamily::Vector,
        });
        assert!(matches!(backend, EngramError::Backend(_)));

        let validation = EngramError::from(ValidationError::RequiredFieldMissing {
            field: "content".to_string(),
        });
        assert!(matches!(validation, EngramError::Validation(_)));

        let promotion = EngramError::from(PromotionError::ShuttingDown);
        assert!(matches!(promotion, EngramError::Promotion(_)));

        let config = EngramError::from(ConfigError::Parse {
            reason: "bad toml".to_string(),
        });
        assert!(matches!(config, EngramError::Config(_)));
    }

    #[test]
    fn test_not_found_display() {
        let err = EngramError::NotFound {
            key: "deadbeef".to_string(),
        };
        assert_eq!(err.to_string(), "Key not found: deadbeef");
    }
}

//! Engram Core - Shared Types
//!
//! Pure data structures used by every other Engram crate: the closed tag sets
//! (storage families, thought types, search types), content-derived key
//! generation, the error taxonomy and engine configuration.
//! This crate contains no async code and performs no I/O beyond config loading.

pub mod config;
pub mod enums;
pub mod error;
pub mod identity;

pub use config::{EngineConfig, RetryConfig};
pub use enums::{
    EvictionPolicy, FamilyParseError, SearchType, StorageFamily, ThoughtType,
};
pub use error::{
    BackendError, ConfigError, EngramError, EngramResult, PromotionError, ValidationError,
};
pub use identity::{canonical_string, generate_key, new_task_id, TaskId};

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Stored payload. Opaque to the cache; typed at the cognitive layer.
pub type Content = serde_json::Value;

/// Free-form metadata attached to a stored item.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Content type used when a caller does not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "general";

/// Metadata key carrying an explicit storage family request.
pub const STORAGE_FAMILY_HINT: &str = "storage_family";

/// Metadata key flagging content as intended for similarity search.
pub const SEMANTIC_SEARCH_HINT: &str = "semantic_search";

/// Payload field of an enveloped mapping. When top-level content carries it,
/// searches only look inside it.
pub const PAYLOAD_FIELD: &str = "content";

//! Key and identifier generation

use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Identifier of a queued promotion task (UUIDv7, time-sortable).
pub type TaskId = Uuid;

/// Number of hex characters kept from the content digest.
const KEY_HEX_LEN: usize = 16;

/// Generate a new promotion task id.
pub fn new_task_id() -> TaskId {
    Uuid::now_v7()
}

/// Render content as a stable string. Strings are used verbatim; everything
/// else is serialized as JSON (`serde_json` maps are key-sorted).
pub fn canonical_string(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Derive a stable key from content and its declared type.
///
/// Identical `(content, content_type)` pairs always map to the same key. The
/// digest covers the JSON form, so a string and the number it spells differ.
pub fn generate_key(content: &Value, content_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_type.as_bytes());
    hasher.update(b":");
    hasher.update(content.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..KEY_HEX_LEN].to_string()
}

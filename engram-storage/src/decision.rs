//! Decision engine: maps content shape to a storage family.
//!
//! Classification is a pure, total function of `(content, content_type,
//! metadata)`. Rules, in priority order:
//!
//! 1. An explicit family request (`metadata["storage_family"]`, or a
//!    `content_type` that is itself a family tag) wins.
//! 2. A flat mapping of scalars goes to `structured`.
//! 3. A mapping containing nested mappings or arrays goes to `document`.
//! 4. Text flagged with `metadata["semantic_search"] = true` goes to `vector`.
//! 5. Anything else goes to `key_value`.
//!
//! [`DecisionEngine`] applies the enabled-family set on top: a disabled
//! family is never chosen, `key_value` being the fallback.

use std::collections::BTreeSet;

use engram_core::{
    Content, Metadata, StorageFamily, SEMANTIC_SEARCH_HINT, STORAGE_FAMILY_HINT,
};
use serde::Serialize;
use serde_json::Value;

/// Why a family was picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ExplicitHint,
    FlatMapping,
    NestedMapping,
    SemanticText,
    Default,
    /// The classified family was disabled.
    Fallback { wanted: StorageFamily },
}

/// Output of the decision engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageDecision {
    pub family: StorageFamily,
    pub reason: DecisionReason,
    pub content: Content,
    pub content_type: String,
    pub metadata: Metadata,
}

fn explicit_family(content_type: &str, metadata: &Metadata) -> Option<StorageFamily> {
    metadata
        .get(STORAGE_FAMILY_HINT)
        .and_then(Value::as_str)
        .and_then(|tag| tag.parse().ok())
        .or_else(|| content_type.parse().ok())
}

fn wants_similarity(metadata: &Metadata) -> bool {
    match metadata.get(SEMANTIC_SEARCH_HINT) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Object(_) | Value::Array(_))
}

/// Classify content into a family, ignoring which families are enabled.
pub fn classify(
    content: &Content,
    content_type: &str,
    metadata: &Metadata,
) -> (StorageFamily, DecisionReason) {
    if let Some(family) = explicit_family(content_type, metadata) {
        return (family, DecisionReason::ExplicitHint);
    }
    match content {
        Value::Object(map) if map.values().all(is_scalar) => {
            (StorageFamily::Structured, DecisionReason::FlatMapping)
        }
        Value::Object(_) => (StorageFamily::Document, DecisionReason::NestedMapping),
        Value::String(_) if wants_similarity(metadata) => {
            (StorageFamily::Vector, DecisionReason::SemanticText)
        }
        _ => (StorageFamily::KeyValue, DecisionReason::Default),
    }
}

/// Classifier bound to the set of enabled families.
#[derive(Debug, Clone)]
pub struct DecisionEngine {
    enabled: BTreeSet<StorageFamily>,
}

impl DecisionEngine {
    pub fn new(enabled: impl IntoIterator<Item = StorageFamily>) -> Self {
        Self {
            enabled: enabled.into_iter().collect(),
        }
    }

    pub fn enabled(&self) -> &BTreeSet<StorageFamily> {
        &self.enabled
    }

    /// Classify content and route it to an enabled family.
    pub fn decide(
        &self,
        content: &Content,
        content_type: &str,
        metadata: &Metadata,
    ) -> StorageDecision {
        let (wanted, reason) = classify(content, content_type, metadata);
        let (family, reason) = if self.enabled.contains(&wanted) {
            (wanted, reason)
        } else {
            (self.fallback(), DecisionReason::Fallback { wanted })
        };
        StorageDecision {
            family,
            reason,
            content: content.clone(),
            content_type: content_type.to_string(),
            metadata: metadata.clone(),
        }
    }

    fn fallback(&self) -> StorageFamily {
        if self.enabled.contains(&StorageFamily::KeyValue) {
            return StorageFamily::KeyValue;
        }
        // Configuration guarantees at least one family.
        self.enabled
            .iter()
            .next()
            .copied()
            .unwrap_or(StorageFamily::KeyValue)
    }
}

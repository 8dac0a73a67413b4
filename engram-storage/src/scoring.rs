//! Relevance scoring shared by cache search and the in-process adapters.

use std::collections::HashSet;

use engram_core::{Content, Metadata, SearchType, PAYLOAD_FIELD};
use serde_json::Value;

use crate::promotion::CONTENT_TYPE_FIELD;

/// Score for a case-insensitive exact match.
pub const EXACT_MATCH_SCORE: f64 = 1.0;
/// Score when the query appears inside the content.
pub const SUBSTRING_SCORE: f64 = 0.8;
/// Ceiling for partial word overlap.
pub const WORD_OVERLAP_WEIGHT: f64 = 0.6;

fn words(text: &str) -> HashSet<&str> {
    text.split_whitespace().collect()
}

/// Text similarity in `[0, 1]`: exact match, then substring, then word overlap.
pub fn text_similarity(query: &str, content: &str) -> f64 {
    if query.is_empty() || content.is_empty() {
        return 0.0;
    }
    let query_lower = query.to_lowercase();
    let content_lower = content.to_lowercase();

    if query_lower == content_lower {
        return EXACT_MATCH_SCORE;
    }
    if content_lower.contains(&query_lower) {
        return SUBSTRING_SCORE;
    }

    let query_words = words(&query_lower);
    if query_words.is_empty() {
        return 0.0;
    }
    let content_words = words(&content_lower);
    let overlap = query_words.intersection(&content_words).count();
    (overlap as f64 / query_words.len() as f64).min(1.0) * WORD_OVERLAP_WEIGHT
}

/// True when every filter entry is present and equal in `metadata`.
pub fn matches_filters(filters: &Metadata, metadata: &Metadata) -> bool {
    filters
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

/// [`matches_filters`] for a cache entry. Its type is held beside the
/// metadata, so a `content_type` filter also matches against it.
pub fn matches_entry_filters(filters: &Metadata, content_type: &str, metadata: &Metadata) -> bool {
    filters.iter().all(|(key, value)| match metadata.get(key) {
        Some(found) => found == value,
        None => key == CONTENT_TYPE_FIELD && value.as_str() == Some(content_type),
    })
}

/// Flatten content into the text that searches run against.
///
/// Strings are used verbatim. Containers contribute their scalar leaves,
/// space separated, so a mapping is searchable by its values rather than by
/// its JSON punctuation. A mapping with a [`PAYLOAD_FIELD`] is an envelope:
/// only the payload is searched, never the fields wrapped around it.
pub fn searchable_text(content: &Content) -> String {
    let searched = match content {
        Value::Object(map) => map.get(PAYLOAD_FIELD).unwrap_or(content),
        other => other,
    };
    let mut parts = Vec::new();
    collect_leaves(searched, &mut parts);
    parts.join(" ")
}

fn collect_leaves(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::Null => {}
        Value::String(s) => parts.push(s.clone()),
        Value::Bool(b) => parts.push(b.to_string()),
        Value::Number(n) => parts.push(n.to_string()),
        Value::Array(items) => items.iter().for_each(|item| collect_leaves(item, parts)),
        Value::Object(map) => map.values().for_each(|item| collect_leaves(item, parts)),
    }
}

/// Score content against a query for the given search type. Zero means no match.
pub fn score_content(query: &str, content: &Content, search_type: SearchType) -> f64 {
    let text = searchable_text(content);
    match search_type {
        SearchType::Exact => {
            if text.contains(query) {
                if text == query {
                    EXACT_MATCH_SCORE
                } else {
                    SUBSTRING_SCORE
                }
            } else {
                0.0
            }
        }
        SearchType::Pattern => {
            if text.to_lowercase().contains(&query.to_lowercase()) {
                text_similarity(query, &text).max(SUBSTRING_SCORE)
            } else {
                0.0
            }
        }
        SearchType::Semantic => text_similarity(query, &text),
    }
}

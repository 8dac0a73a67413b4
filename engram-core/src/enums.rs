//! Closed tag sets used across the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

fn normalize_token(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

// ============================================================================
// STORAGE FAMILY
// ============================================================================

/// Class of durable backend an entry can be promoted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFamily {
    /// Similarity search over encoded vectors
    Vector,
    /// Nested documents
    Document,
    /// Plain key-value pairs
    KeyValue,
    /// Flat, column-like records
    Structured,
}

impl StorageFamily {
    /// Every family, in canonical order.
    pub const ALL: [StorageFamily; 4] = [
        StorageFamily::Vector,
        StorageFamily::Document,
        StorageFamily::KeyValue,
        StorageFamily::Structured,
    ];

    /// Stable lowercase tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFamily::Vector => "vector",
            StorageFamily::Document => "document",
            StorageFamily::KeyValue => "key_value",
            StorageFamily::Structured => "structured",
        }
    }
}

impl fmt::Display for StorageFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StorageFamily {
    type Err = FamilyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "vector" | "similarity" | "embedding" => Ok(StorageFamily::Vector),
            "document" | "doc" => Ok(StorageFamily::Document),
            "keyvalue" | "kv" => Ok(StorageFamily::KeyValue),
            "structured" | "sql" | "relational" | "relation" => Ok(StorageFamily::Structured),
            _ => Err(FamilyParseError(s.to_string())),
        }
    }
}

/// Error when parsing an invalid storage family tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyParseError(pub String);

impl fmt::Display for FamilyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid storage family: {}", self.0)
    }
}

impl std::error::Error for FamilyParseError {}

// ============================================================================
// THOUGHT TYPE
// ============================================================================

/// Kind of thought held by the cognitive layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ThoughtType {
    /// New concept or insight
    Idea,
    /// Recalled information
    #[default]
    Memory,
    /// Verifiable information
    Fact,
    /// Subjective view
    Opinion,
    /// Something to explore
    Question,
    /// Response to a question
    Answer,
    /// Future intention
    Plan,
    /// Meta-cognition
    Reflection,
    /// Emotional state
    Feeling,
    /// Sensory input
    Observation,
}

impl ThoughtType {
    pub const ALL: [ThoughtType; 10] = [
        ThoughtType::Idea,
        ThoughtType::Memory,
        ThoughtType::Fact,
        ThoughtType::Opinion,
        ThoughtType::Question,
        ThoughtType::Answer,
        ThoughtType::Plan,
        ThoughtType::Reflection,
        ThoughtType::Feeling,
        ThoughtType::Observation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThoughtType::Idea => "idea",
            ThoughtType::Memory => "memory",
            ThoughtType::Fact => "fact",
            ThoughtType::Opinion => "opinion",
            ThoughtType::Question => "question",
            ThoughtType::Answer => "answer",
            ThoughtType::Plan => "plan",
            ThoughtType::Reflection => "reflection",
            ThoughtType::Feeling => "feeling",
            ThoughtType::Observation => "observation",
        }
    }

    /// Parse a caller-supplied tag, falling back to `Memory` for anything
    /// outside the closed set.
    pub fn parse_or_default(s: &str) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl fmt::Display for ThoughtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ThoughtType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "idea" => Ok(ThoughtType::Idea),
            "memory" => Ok(ThoughtType::Memory),
            "fact" => Ok(ThoughtType::Fact),
            "opinion" => Ok(ThoughtType::Opinion),
            "question" => Ok(ThoughtType::Question),
            "answer" => Ok(ThoughtType::Answer),
            "plan" => Ok(ThoughtType::Plan),
            "reflection" => Ok(ThoughtType::Reflection),
            "feeling" => Ok(ThoughtType::Feeling),
            "observation" => Ok(ThoughtType::Observation),
            _ => Err(format!("Invalid ThoughtType: {}", s)),
        }
    }
}

// ============================================================================
// SEARCH TYPE
// ============================================================================

/// How a search query is matched against cached content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// Case-sensitive substring match
    Exact,
    /// Case-insensitive substring or word overlap
    #[default]
    Pattern,
    /// Similarity ranking (word overlap in cache, vectors in the vector family)
    Semantic,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Exact => "exact",
            SearchType::Pattern => "pattern",
            SearchType::Semantic => "semantic",
        }
    }

    /// Unknown search types are treated as `Pattern`.
    pub fn parse_lenient(s: &str) -> Self {
        match normalize_token(s).as_str() {
            "exact" => SearchType::Exact,
            "semantic" | "similar" | "similarity" => SearchType::Semantic,
            _ => SearchType::Pattern,
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVICTION POLICY
// ============================================================================

/// Cache eviction policy. Only least-recently-used is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    #[default]
    Lru,
}

impl fmt::Display for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "lru"),
        }
    }
}

impl FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "lru" => Ok(EvictionPolicy::Lru),
            _ => Err(format!("Unsupported eviction policy: {}", s)),
        }
    }
}

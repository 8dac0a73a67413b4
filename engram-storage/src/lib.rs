//! Engram Storage - Cache Tier, Routing and Promotion
//!
//! The cache-first half of the ESR engine: a fixed-capacity LRU cache tier,
//! the decision engine that routes content to a storage family, the
//! asynchronous promotion pipeline, and associative retrieval across the
//! backend families. [`EsrEngine`] ties them together.

pub mod backend;
pub mod cache;
pub mod decision;
pub mod engine;
pub mod promotion;
pub mod retrieval;
pub mod scoring;
pub mod stats;

pub use backend::{
    BackendFamily, BackendRecord, BackendRegistry, Encoder, HashingEncoder, InMemoryBackend,
    InMemoryVectorBackend, Namespace, SearchHit,
};
pub use cache::{CacheEntry, CacheTier, PromotionPolicy};
pub use decision::{classify, DecisionEngine, DecisionReason, StorageDecision};
pub use engine::{EsrEngine, ResultSource, SearchResult};
pub use promotion::{DeadLetter, PromotionPipeline, PromotionTask, ShutdownReport};
pub use retrieval::{AssociativeRetrieval, RankedHit, RetrievalOutcome};
pub use stats::{EngineStatistics, HotEntry, MetricsSnapshot, PatternAnalysis};

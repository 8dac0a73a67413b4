//! Backend families: the durable side of the engine.
//!
//! Each family adapter exposes the same minimal contract (store, get, search,
//! delete). Adapters never see the cache tier; the engine talks to them only
//! through [`BackendFamily`] and always with namespaced keys.

pub mod memory;
pub mod registry;
pub mod vector;

pub use memory::InMemoryBackend;
pub use registry::{BackendRegistry, Namespace};
pub use vector::{Encoder, HashingEncoder, InMemoryVectorBackend};

use async_trait::async_trait;
use engram_core::{Content, EngramResult, Metadata, StorageFamily};
use serde::Serialize;

/// A record as held by a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendRecord {
    pub key: String,
    pub content: Content,
    pub metadata: Metadata,
}

/// A scored search candidate returned by a backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub key: String,
    pub content: Content,
    pub metadata: Metadata,
    /// Relevance in `[0, 1]`.
    pub score: f64,
}

/// Contract every storage family adapter implements.
///
/// Implementations must be thread-safe; the engine calls them concurrently
/// from request handlers and the promotion worker.
#[async_trait]
pub trait BackendFamily: Send + Sync {
    /// Family this adapter serves.
    fn family(&self) -> StorageFamily;

    /// Open connections. Called once from `EsrEngine::start`.
    async fn connect(&self) -> EngramResult<()> {
        Ok(())
    }

    /// Flush and close connections. Called once from `EsrEngine::stop`.
    async fn disconnect(&self) -> EngramResult<()> {
        Ok(())
    }

    /// Write (or overwrite) a record.
    async fn store(&self, key: &str, content: &Content, metadata: &Metadata) -> EngramResult<()>;

    /// Read a record by key.
    async fn get(&self, key: &str) -> EngramResult<Option<BackendRecord>>;

    /// Return up to `limit` candidates ranked by relevance. Only keys starting
    /// with `prefix` are candidates, and every entry in `filters` must match
    /// the record metadata. Both restrictions apply before truncation.
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &Metadata,
        prefix: &str,
    ) -> EngramResult<Vec<SearchHit>>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, key: &str) -> EngramResult<bool>;
}

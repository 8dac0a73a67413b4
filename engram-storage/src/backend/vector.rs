//! In-process similarity family.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use engram_core::{
    BackendError, Content, EngramResult, Metadata, StorageFamily,
};

use super::{BackendFamily, BackendRecord, SearchHit};
use crate::scoring::{matches_filters, searchable_text};

/// Turns text into a fixed-width embedding.
pub trait Encoder: Send + Sync {
    fn encode(&self, text: &str) -> EngramResult<Vec<f32>>;

    /// Width of every vector this encoder produces.
    fn dimensions(&self) -> usize;
}

/// Bag-of-words feature hashing, L2 normalized.
///
/// Texts sharing words land near each other, which is enough for local runs
/// and tests. Plug a model-backed [`Encoder`] in for real similarity.
#[derive(Debug, Clone, Copy)]
pub struct HashingEncoder {
    dimensions: usize,
}

impl HashingEncoder {
    pub const DEFAULT_DIMENSIONS: usize = 256;

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Default for HashingEncoder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

impl Encoder for HashingEncoder {
    fn encode(&self, text: &str) -> EngramResult<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimensions];
        for word in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            let bucket = (hasher.finish() % self.dimensions as u64) as usize;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Cosine similarity. Zero for mismatched widths or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

struct VectorRecord {
    record: BackendRecord,
    embedding: Vec<f32>,
}

/// Similarity family adapter backed by a hash map of embeddings.
pub struct InMemoryVectorBackend {
    encoder: Arc<dyn Encoder>,
    records: RwLock<HashMap<String, VectorRecord>>,
}

impl InMemoryVectorBackend {
    pub fn new(encoder: Arc<dyn Encoder>) -> Self {
        Self {
            encoder,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn embed(&self, text: &str, operation: &str) -> EngramResult<Vec<f32>> {
        let embedding = self.encoder.encode(text)?;
        if embedding.len() != self.encoder.dimensions() {
            return Err(BackendError::OperationFailed {
                family: StorageFamily::Vector,
                operation: operation.to_string(),
                reason: format!(
                    "encoder produced {} dimensions, expected {}",
                    embedding.len(),
                    self.encoder.dimensions()
                ),
            }
            .into());
        }
        Ok(embedding)
    }
}

impl Default for InMemoryVectorBackend {
    fn default() -> Self {
        Self::new(Arc::new(HashingEncoder::default()))
    }
}

impl std::fmt::Debug for InMemoryVectorBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryVectorBackend")
            .field("dimensions", &self.encoder.dimensions())
            .field("records", &self.len())
            .finish()
    }
}

#[async_trait]
impl BackendFamily for InMemoryVectorBackend {
    fn family(&self) -> StorageFamily {
        StorageFamily::Vector
    }

    async fn store(&self, key: &str, content: &Content, metadata: &Metadata) -> EngramResult<()> {
        let embedding = self.embed(&searchable_text(content), "store")?;
        let record = VectorRecord {
            record: BackendRecord {
                key: key.to_string(),
                content: content.clone(),
                metadata: metadata.clone(),
            },
            embedding,
        };
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), record);
        Ok(())
    }

    async fn get(&self, key: &str) -> EngramResult<Option<BackendRecord>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|r| r.record.clone()))
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &Metadata,
        prefix: &str,
    ) -> EngramResult<Vec<SearchHit>> {
        let query_vector = self.embed(query, "search")?;
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<SearchHit> = records
            .values()
            .filter(|r| r.record.key.starts_with(prefix))
            .filter(|r| matches_filters(filters, &r.record.metadata))
            .filter_map(|r| {
                let score = f64::from(cosine_similarity(&query_vector, &r.embedding)).min(1.0);
                (score > 0.0).then(|| SearchHit {
                    key: r.record.key.clone(),
                    content: r.record.content.clone(),
                    metadata: r.record.metadata.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete(&self, key: &str) -> EngramResult<bool> {
        Ok(self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some())
    }
}

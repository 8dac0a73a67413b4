//! In-process adapter for the document, key-value and structured families.
//!
//! Used when no external driver is configured and throughout the tests.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use engram_core::{Content, EngramResult, Metadata, SearchType, StorageFamily};
use serde_json::Value;

use super::{BackendFamily, BackendRecord, SearchHit};
use crate::scoring::{matches_filters, score_content};

/// Hash-map backed family adapter.
#[derive(Debug)]
pub struct InMemoryBackend {
    family: StorageFamily,
    records: RwLock<HashMap<String, BackendRecord>>,
}

impl InMemoryBackend {
    pub fn new(family: StorageFamily) -> Self {
        Self {
            family,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Structured records can be filtered on their own columns as well as on
    /// metadata.
    fn record_matches(&self, record: &BackendRecord, filters: &Metadata) -> bool {
        if matches_filters(filters, &record.metadata) {
            return true;
        }
        match (&self.family, &record.content) {
            (StorageFamily::Structured, Value::Object(columns)) => {
                matches_filters(filters, columns)
            }
            _ => false,
        }
    }
}

#[async_trait]
impl BackendFamily for InMemoryBackend {
    fn family(&self) -> StorageFamily {
        self.family
    }

    async fn store(&self, key: &str, content: &Content, metadata: &Metadata) -> EngramResult<()> {
        let record = BackendRecord {
            key: key.to_string(),
            content: content.clone(),
            metadata: metadata.clone(),
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
            .cloned())
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &Metadata,
        prefix: &str,
    ) -> EngramResult<Vec<SearchHit>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        let mut hits: Vec<SearchHit> = records
            .values()
            .filter(|record| record.key.starts_with(prefix))
            .filter(|record| self.record_matches(record, filters))
            .filter_map(|record| {
                let score = score_content(query, &record.content, SearchType::Semantic);
                (score > 0.0).then(|| SearchHit {
                    key: record.key.clone(),
                    content: record.content.clone(),
                    metadata: record.metadata.clone(),
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

//! Associative retrieval: concurrent fan-out across backend families.
//!
//! Every enabled family is queried at once under a per-family timeout. A
//! family that errors or times out contributes nothing; the call itself never
//! fails. Surviving candidates are merged, deduplicated by key (highest score
//! wins), ranked and truncated.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use engram_core::{BackendError, Content, EngramError, EngramResult, Metadata, StorageFamily};
use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::{BackendRecord, BackendRegistry, Namespace};

/// A merged search candidate, tagged with the family that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedHit {
    pub family: StorageFamily,
    /// Key with the namespace stripped.
    pub key: String,
    pub content: Content,
    pub metadata: Metadata,
    pub score: f64,
}

/// Merged hits plus the soft failures met along the way.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub hits: Vec<RankedHit>,
    pub failures: Vec<BackendError>,
}

/// A record read back from a family.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub family: StorageFamily,
    pub record: BackendRecord,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub found: Option<FetchedRecord>,
    pub failures: Vec<BackendError>,
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOutcome {
    /// True when at least one family held the key.
    pub deleted: bool,
    pub failures: Vec<BackendError>,
}

/// Run a backend call under a timeout, folding every failure into a
/// [`BackendError`] tagged with the family.
async fn guarded<T>(
    family: StorageFamily,
    operation: &str,
    timeout: Duration,
    call: impl Future<Output = EngramResult<T>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(EngramError::Backend(e))) => Err(e),
        Ok(Err(other)) => Err(BackendError::OperationFailed {
            family,
            operation: operation.to_string(),
            reason: other.to_string(),
        }),
        Err(_) => Err(BackendError::Timeout {
            family,
            after: timeout,
        }),
    }
}

/// Fan-out reader over a [`BackendRegistry`].
#[derive(Debug, Clone)]
pub struct AssociativeRetrieval {
    registry: Arc<BackendRegistry>,
    namespace: Namespace,
    timeout: Duration,
}

impl AssociativeRetrieval {
    pub fn new(registry: Arc<BackendRegistry>, namespace: Namespace, timeout: Duration) -> Self {
        Self {
            registry,
            namespace,
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Query every family concurrently and merge the results.
    pub async fn search(&self, query: &str, limit: usize, filters: &Metadata) -> RetrievalOutcome {
        if limit == 0 || self.registry.is_empty() {
            return RetrievalOutcome::default();
        }

        let prefix = self.namespace.prefix();
        let calls = self.registry.iter().map(|(family, backend)| {
            let prefix = prefix.as_str();
            async move {
                let result = guarded(
                    family,
                    "search",
                    self.timeout,
                    backend.search(query, limit, filters, prefix),
                )
                .await;
                (family, result)
            }
        });

        let mut outcome = RetrievalOutcome::default();
        let mut merged: HashMap<String, RankedHit> = HashMap::new();

        for (family, result) in join_all(calls).await {
            let hits = match result {
                Ok(hits) => hits,
                Err(e) => {
                    warn!(family = %family, error = %e, "Backend search failed, skipping family");
                    outcome.failures.push(e);
                    continue;
                }
            };
            debug!(family = %family, hits = hits.len(), "Backend search returned");

            for hit in hits {
                let Some(key) = self.namespace.unscope(&hit.key) else {
                    continue;
                };
                let candidate = RankedHit {
                    family,
                    key: key.to_string(),
                    content: hit.content,
                    metadata: hit.metadata,
                    score: hit.score,
                };
                match merged.get(&candidate.key) {
                    Some(existing) if existing.score >= candidate.score => {}
                    _ => {
                        merged.insert(candidate.key.clone(), candidate);
                    }
                }
            }
        }

        outcome.hits = rank(merged.into_values().collect(), limit);
        outcome
    }

    /// Read `key` back from durable storage.
    ///
    /// `preferred` (the family the key was promoted to, when known) is read
    /// first; on a miss every other family is asked concurrently and the first
    /// hit in family order wins.
    pub async fn fetch(&self, key: &str, preferred: Option<StorageFamily>) -> FetchOutcome {
        let scoped = self.namespace.scope(key);
        let mut outcome = FetchOutcome::default();

        if let Some(family) = preferred {
            if let Some(backend) = self.registry.get(family) {
                match guarded(family, "get", self.timeout, backend.get(&scoped)).await {
                    Ok(Some(record)) => {
                        outcome.found = Some(self.unscoped(family, record, key));
                        return outcome;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(family = %family, key = %key, error = %e, "Backend read failed");
                        outcome.failures.push(e);
                    }
                }
            }
        }

        let calls = self
            .registry
            .iter()
            .filter(|(family, _)| Some(*family) != preferred)
            .map(|(family, backend)| {
                let scoped = scoped.as_str();
                async move {
                    let result = guarded(family, "get", self.timeout, backend.get(scoped)).await;
                    (family, result)
                }
            });

        for (family, result) in join_all(calls).await {
            match result {
                Ok(Some(record)) if outcome.found.is_none() => {
                    outcome.found = Some(self.unscoped(family, record, key));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(family = %family, key = %key, error = %e, "Backend read failed");
                    outcome.failures.push(e);
                }
            }
        }
        outcome
    }

    /// Delete `key` from every family concurrently.
    pub async fn delete(&self, key: &str) -> DeleteOutcome {
        let scoped = self.namespace.scope(key);
        let calls = self.registry.iter().map(|(family, backend)| {
            let scoped = scoped.as_str();
            async move {
                let result =
                    guarded(family, "delete", self.timeout, backend.delete(scoped)).await;
                (family, result)
            }
        });

        let mut outcome = DeleteOutcome::default();
        for (family, result) in join_all(calls).await {
            match result {
                Ok(existed) => outcome.deleted |= existed,
                Err(e) => {
                    warn!(family = %family, key = %key, error = %e, "Backend delete failed");
                    outcome.failures.push(e);
                }
            }
        }
        outcome
    }

    fn unscoped(&self, family: StorageFamily, mut record: BackendRecord, key: &str) -> FetchedRecord {
        record.key = key.to_string();
        FetchedRecord { family, record }
    }
}

/// Sort by descending score (key breaks ties) and keep the first `limit`.
pub fn rank(mut hits: Vec<RankedHit>, limit: usize) -> Vec<RankedHit> {
    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
    hits.truncate(limit);
    hits
}

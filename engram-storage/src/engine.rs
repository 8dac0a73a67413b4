//! The ESR engine: cache-first store, retrieve and search over pluggable
//! backend families.
//!
//! Every operation consults the cache tier first. Reads that make an entry
//! eligible claim its promotion slot and hand it to the promotion pipeline
//! without waiting. Cache misses fall through to the family the key was
//! promoted to, then to every enabled family.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use engram_core::{
    generate_key, Content, EngineConfig, EngramError, EngramResult, Metadata, PromotionError,
    SearchType, StorageFamily, TaskId, ValidationError, DEFAULT_CONTENT_TYPE,
};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendRegistry, Namespace};
use crate::cache::{CacheEntry, CacheTier, PromotionPolicy, PutOutcome};
use crate::decision::{DecisionEngine, StorageDecision};
use crate::promotion::{
    caller_metadata, DeadLetter, DeadLetterLog, LocationIndex, PromotionPipeline,
    PromotionTargets, PromotionWorker, ShutdownReport,
};
use crate::retrieval::{rank, AssociativeRetrieval, RankedHit};
use crate::scoring::{matches_entry_filters, score_content};
use crate::stats::{analyze_entries, EngineMetrics, EngineStatistics, PatternAnalysis};

/// Where a search result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultSource {
    Cache,
    Backend(StorageFamily),
}

impl std::fmt::Display for ResultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultSource::Cache => write!(f, "cache"),
            ResultSource::Backend(family) => write!(f, "backend:{}", family),
        }
    }
}

/// A single search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub source: ResultSource,
    pub key: String,
    pub content: Content,
    pub content_type: String,
    pub metadata: Metadata,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Created,
    Running,
    Stopped,
}

struct Lifecycle {
    state: EngineState,
    worker: Option<PromotionWorker>,
    handle: Option<JoinHandle<ShutdownReport>>,
    report: Option<ShutdownReport>,
}

/// Cache-first multi-backend memory engine.
///
/// Construct once and share behind an `Arc`; every method takes `&self`.
pub struct EsrEngine {
    config: EngineConfig,
    namespace: Namespace,
    cache: Arc<CacheTier>,
    registry: Arc<BackendRegistry>,
    retrieval: AssociativeRetrieval,
    pipeline: PromotionPipeline,
    locations: Arc<LocationIndex>,
    dead_letters: Arc<DeadLetterLog>,
    metrics: Arc<EngineMetrics>,
    shutdown_tx: watch::Sender<bool>,
    lifecycle: Mutex<Lifecycle>,
}

impl std::fmt::Debug for EsrEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EsrEngine")
            .field("namespace", &self.namespace)
            .field("cache_entries", &self.cache.len())
            .field("registry", &self.registry)
            .finish()
    }
}

impl EsrEngine {
    /// Engine with in-process adapters for every enabled family.
    pub fn new(config: EngineConfig) -> EngramResult<Self> {
        Self::with_registry(config, BackendRegistry::new())
    }

    /// Engine over caller-supplied adapters. Adapters for disabled families
    /// are dropped; enabled families without one get an in-process adapter.
    pub fn with_registry(config: EngineConfig, mut registry: BackendRegistry) -> EngramResult<Self> {
        config.validate()?;

        registry.retain(&config.enable_backends);
        registry.fill_missing(config.enable_backends.iter().copied());
        let registry = Arc::new(registry);

        let namespace = Namespace::new(config.namespace.clone());
        let policy = PromotionPolicy::new(config.promotion_threshold);
        let cache = Arc::new(CacheTier::new(config.cache_size, policy));
        let decision = DecisionEngine::new(config.enable_backends.iter().copied());
        let (pipeline, receiver) =
            PromotionPipeline::channel(decision, policy, config.promotion_queue_capacity);

        let locations = Arc::new(LocationIndex::new());
        let dead_letters = Arc::new(DeadLetterLog::new());
        let metrics = Arc::new(EngineMetrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = PromotionWorker::new(
            receiver,
            shutdown_rx,
            PromotionTargets {
                cache: Arc::clone(&cache),
                registry: Arc::clone(&registry),
                namespace: namespace.clone(),
                locations: Arc::clone(&locations),
                dead_letters: Arc::clone(&dead_letters),
                metrics: Arc::clone(&metrics),
            },
            config.retry.clone(),
            config.search_timeout(),
            config.shutdown_timeout(),
        );

        let retrieval = AssociativeRetrieval::new(
            Arc::clone(&registry),
            namespace.clone(),
            config.search_timeout(),
        );

        Ok(Self {
            config,
            namespace,
            cache,
            registry,
            retrieval,
            pipeline,
            locations,
            dead_letters,
            metrics,
            shutdown_tx,
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Created,
                worker: Some(worker),
                handle: None,
                report: None,
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_str()
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.state == EngineState::Running
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Connect every backend and spawn the promotion worker. Idempotent while
    /// running; a stopped engine cannot be restarted.
    pub async fn start(&self) -> EngramResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match lifecycle.state {
            EngineState::Running => return Ok(()),
            EngineState::Stopped => return Err(PromotionError::ShuttingDown.into()),
            EngineState::Created => {}
        }

        for (family, backend) in self.registry.iter() {
            if let Err(e) = backend.connect().await {
                error!(family = %family, error = %e, "Backend failed to connect");
                return Err(e);
            }
        }

        if let Some(worker) = lifecycle.worker.take() {
            lifecycle.handle = Some(tokio::spawn(worker.run()));
        }
        lifecycle.state = EngineState::Running;

        info!(
            namespace = %self.namespace.as_str(),
            cache_size = self.config.cache_size,
            promotion_threshold = self.config.promotion_threshold,
            backends = self.registry.len(),
            "ESR engine started"
        );
        Ok(())
    }

    /// Stop accepting promotions, drain the queue up to the shutdown timeout
    /// and disconnect every backend. Calling it again returns the first report.
    pub async fn stop(&self) -> EngramResult<ShutdownReport> {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(report) = lifecycle.report {
            return Ok(report);
        }

        self.pipeline.close();
        let _ = self.shutdown_tx.send(true);

        let report = if let Some(handle) = lifecycle.handle.take() {
            match handle.await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Promotion worker terminated abnormally");
                    EngineMetrics::incr(&self.metrics.errors);
                    ShutdownReport {
                        undrained: self.pipeline.queued() as u64,
                        ..ShutdownReport::default()
                    }
                }
            }
        } else if let Some(worker) = lifecycle.worker.take() {
            // Never started: drain inline.
            worker.run().await
        } else {
            ShutdownReport::default()
        };

        if lifecycle.state == EngineState::Running {
            for (family, backend) in self.registry.iter() {
                if let Err(e) = backend.disconnect().await {
                    warn!(family = %family, error = %e, "Backend failed to disconnect");
                }
            }
        }

        lifecycle.state = EngineState::Stopped;
        lifecycle.report = Some(report);
        info!(
            drained = report.drained,
            undrained = report.undrained,
            dead_letters = report.dead_letters,
            "ESR engine stopped"
        );
        Ok(report)
    }

    // ========================================================================
    // STORE / RETRIEVE
    // ========================================================================

    /// Store content under a key derived from it and its type. Storing the
    /// same content again returns the same key.
    pub fn store(
        &self,
        content: Content,
        content_type: &str,
        metadata: Metadata,
        ci_id: Option<&str>,
    ) -> EngramResult<String> {
        let content_type = normalize_content_type(content_type);
        let key = generate_key(&content, &content_type);
        self.put(key, content, content_type, metadata, ci_id)
    }

    /// Store content under a caller-chosen key.
    pub fn store_with_key(
        &self,
        key: &str,
        content: Content,
        content_type: &str,
        metadata: Metadata,
        ci_id: Option<&str>,
    ) -> EngramResult<String> {
        let key = key.trim();
        if key.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "key".to_string(),
            }
            .into());
        }
        let content_type = normalize_content_type(content_type);
        self.put(key.to_string(), content, content_type, metadata, ci_id)
    }

    fn put(
        &self,
        key: String,
        content: Content,
        content_type: String,
        metadata: Metadata,
        ci_id: Option<&str>,
    ) -> EngramResult<String> {
        // A key with a durable copy re-enters the cache already promoted.
        let stored = if self.locations.get(&key).is_some() {
            self.cache.put_promoted(key, content, content_type, metadata, ci_id)
        } else {
            self.cache.put(key, content, content_type, metadata, ci_id)
        };
        match stored {
            Ok(outcome) => {
                EngineMetrics::incr(&self.metrics.stores);
                self.record_evictions(&outcome);
                debug!(
                    key = %outcome.key,
                    inserted = outcome.inserted,
                    ci_id = ci_id.unwrap_or("-"),
                    "Stored in cache"
                );
                Ok(outcome.key)
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.errors);
                warn!(error = %e, "Store rejected by cache tier");
                Err(e)
            }
        }
    }

    /// Read content by key. `Ok(None)` means the key is absent from the cache
    /// and every enabled family.
    pub async fn retrieve(&self, key: &str, ci_id: Option<&str>) -> EngramResult<Option<Content>> {
        EngineMetrics::incr(&self.metrics.retrievals);

        if let Some(outcome) = self.cache.touch(key, ci_id) {
            EngineMetrics::incr(&self.metrics.cache_hits);
            debug!(
                key = %key,
                access_count = outcome.entry.access_count,
                "Cache hit"
            );
            if outcome.promotion_claimed {
                self.schedule(&outcome.entry);
            }
            return Ok(Some(outcome.entry.content));
        }

        let fetched = self.retrieval.fetch(key, self.locations.get(key)).await;
        EngineMetrics::add(&self.metrics.errors, fetched.failures.len() as u64);

        let Some(found) = fetched.found else {
            EngineMetrics::incr(&self.metrics.misses);
            debug!(key = %key, "Miss");
            return Ok(None);
        };

        EngineMetrics::incr(&self.metrics.backend_hits);
        self.locations.insert(key, found.family);
        debug!(key = %key, family = %found.family, "Backend hit");

        let content = found.record.content;
        let (content_type, metadata) = caller_metadata(found.record.metadata);
        let content_type = content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
        match self
            .cache
            .put_promoted(key.to_string(), content.clone(), content_type, metadata, ci_id)
        {
            Ok(outcome) => self.record_evictions(&outcome),
            Err(e) => warn!(key = %key, error = %e, "Could not re-warm cache"),
        }
        Ok(Some(content))
    }

    /// Hand a claimed entry to the promotion pipeline. A rejected task gives
    /// the claim back so a later access can retry.
    fn schedule(&self, entry: &CacheEntry) -> Option<TaskId> {
        match self.pipeline.schedule(entry) {
            Ok(Some(task_id)) => Some(task_id),
            Ok(None) => {
                self.cache.release_claim(&entry.key);
                None
            }
            Err(e) => {
                EngineMetrics::incr(&self.metrics.errors);
                warn!(key = %entry.key, error = %e, "Promotion not scheduled");
                self.cache.release_claim(&entry.key);
                None
            }
        }
    }

    /// Route preview: the family `content` would be promoted to.
    pub fn decide(&self, content: &Content, content_type: &str, metadata: &Metadata) -> StorageDecision {
        self.pipeline
            .decision()
            .decide(content, &normalize_content_type(content_type), metadata)
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Search the cache, then fan out across backends if the cache alone
    /// cannot fill `limit`. Backend failures only shrink the result.
    pub async fn search(
        &self,
        query: &str,
        search_type: SearchType,
        limit: usize,
        ci_id: Option<&str>,
    ) -> EngramResult<Vec<SearchResult>> {
        self.search_filtered(query, search_type, limit, &Metadata::new(), ci_id)
            .await
    }

    /// [`search`](Self::search) restricted to records whose metadata matches
    /// every entry of `filters`.
    pub async fn search_filtered(
        &self,
        query: &str,
        search_type: SearchType,
        limit: usize,
        filters: &Metadata,
        ci_id: Option<&str>,
    ) -> EngramResult<Vec<SearchResult>> {
        EngineMetrics::incr(&self.metrics.searches);
        if limit == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut results: Vec<SearchResult> = self.cache.scan(|entry| {
            if !matches_entry_filters(filters, &entry.content_type, &entry.metadata) {
                return None;
            }
            let score = score_content(query, &entry.content, search_type);
            (score > 0.0).then(|| SearchResult {
                source: ResultSource::Cache,
                key: entry.key.clone(),
                content: entry.content.clone(),
                content_type: entry.content_type.clone(),
                metadata: entry.metadata.clone(),
                score,
            })
        });
        sort_results(&mut results);

        if results.len() < limit {
            let outcome = self.retrieval.search(query, limit, filters).await;
            EngineMetrics::add(&self.metrics.errors, outcome.failures.len() as u64);

            let seen: HashSet<String> = results.iter().map(|r| r.key.clone()).collect();
            let backend_hits: Vec<RankedHit> = outcome
                .hits
                .into_iter()
                .filter(|hit| !seen.contains(&hit.key))
                .filter_map(|mut hit| {
                    // Backends rank loosely; honour the requested match mode.
                    if search_type != SearchType::Semantic {
                        hit.score = score_content(query, &hit.content, search_type);
                    }
                    (hit.score > 0.0).then_some(hit)
                })
                .collect();

            results.extend(rank(backend_hits, limit).into_iter().map(|hit| {
                let (content_type, metadata) = caller_metadata(hit.metadata);
                SearchResult {
                    source: ResultSource::Backend(hit.family),
                    key: hit.key,
                    content: hit.content,
                    content_type: content_type
                        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
                    metadata,
                    score: hit.score,
                }
            }));
            sort_results(&mut results);
        }

        results.truncate(limit);
        debug!(
            query = %query,
            search_type = %search_type,
            results = results.len(),
            ci_id = ci_id.unwrap_or("-"),
            "Search completed"
        );
        Ok(results)
    }

    // ========================================================================
    // REMOVAL
    // ========================================================================

    /// Delete a key from the cache and from every enabled family.
    pub async fn forget(&self, key: &str) -> EngramResult<()> {
        let in_cache = self.cache.remove(key).is_some();
        self.locations.remove(key);

        let outcome = self.retrieval.delete(key).await;
        EngineMetrics::add(&self.metrics.errors, outcome.failures.len() as u64);

        if in_cache || outcome.deleted {
            info!(key = %key, in_cache, durable = outcome.deleted, "Key forgotten");
            Ok(())
        } else {
            Err(EngramError::NotFound {
                key: key.to_string(),
            })
        }
    }

    /// Drop cache entries idle for longer than `older_than`. Entries pending
    /// promotion are kept; durable copies are untouched.
    pub fn forget_idle(&self, older_than: Duration) -> Vec<String> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        // Nothing can have been idle longer than the representable past.
        let Some(cutoff) = cutoff else {
            return Vec::new();
        };
        let removed = self.cache.remove_idle(cutoff);
        if !removed.is_empty() {
            info!(removed = removed.len(), "Idle cache entries dropped");
        }
        removed
    }

    // ========================================================================
    // INTROSPECTION
    // ========================================================================

    /// Snapshot a cache entry without counting an access.
    pub fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.cache.peek(key)
    }

    /// Family a key was promoted to, if known.
    pub fn location(&self, key: &str) -> Option<StorageFamily> {
        self.locations.get(key)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.list()
    }

    pub fn get_statistics(&self) -> EngineStatistics {
        EngineStatistics {
            counters: self.metrics.snapshot(),
            cache_entries: self.cache.len(),
            cache_capacity: self.cache.capacity(),
            enabled_backends: self.registry.families().map(|f| f.to_string()).collect(),
            namespace: self.namespace.as_str().to_string(),
        }
    }

    pub fn analyze_patterns(&self) -> PatternAnalysis {
        analyze_entries(&self.cache.snapshot(), Utc::now(), self.config.hot_entry_limit)
    }

    fn record_evictions(&self, outcome: &PutOutcome) {
        if !outcome.evicted.is_empty() {
            EngineMetrics::add(&self.metrics.evictions, outcome.evicted.len() as u64);
            debug!(evicted = ?outcome.evicted, "Evicted from cache");
        }
    }
}

fn normalize_content_type(content_type: &str) -> String {
    let trimmed = content_type.trim();
    if trimmed.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        trimmed.to_string()
    }
}

fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.key.cmp(&b.key)));
}

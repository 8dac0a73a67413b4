//! Engram Test Utilities
//!
//! Shared test infrastructure for the Engram workspace:
//! - Proptest generators for content, metadata and tags
//! - Fault-injecting backend families (always failing, slow, flaky)
//! - Engine fixtures and polling helpers
//! - Custom assertions on `EngramResult`

pub use engram_core::{
    BackendError, Content, EngineConfig, EngramError, EngramResult, Metadata, RetryConfig,
    SearchType, StorageFamily, ThoughtType,
};
pub use engram_storage::{
    BackendFamily, BackendRecord, BackendRegistry, EsrEngine, InMemoryBackend, SearchHit,
};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FAULT-INJECTING BACKENDS
// ============================================================================

pub mod backends {
    //! Backend families that misbehave on purpose.

    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::time::Duration;

    fn unavailable(family: StorageFamily, reason: &str) -> EngramError {
        BackendError::Unavailable {
            family,
            reason: reason.to_string(),
        }
        .into()
    }

    /// Every call fails with `BackendError::Unavailable`.
    #[derive(Debug)]
    pub struct FailingBackend {
        family: StorageFamily,
    }

    impl FailingBackend {
        pub fn new(family: StorageFamily) -> Self {
            Self { family }
        }
    }

    #[async_trait]
    impl BackendFamily for FailingBackend {
        fn family(&self) -> StorageFamily {
            self.family
        }

        async fn store(&self, _key: &str, _content: &Content, _metadata: &Metadata) -> EngramResult<()> {
            Err(unavailable(self.family, "injected store failure"))
        }

        async fn get(&self, _key: &str) -> EngramResult<Option<BackendRecord>> {
            Err(unavailable(self.family, "injected get failure"))
        }

        async fn search(
            &self,
            _query: &str,
            _limit: usize,
            _filters: &Metadata,
            _prefix: &str,
        ) -> EngramResult<Vec<SearchHit>> {
            Err(unavailable(self.family, "injected search failure"))
        }

        async fn delete(&self, _key: &str) -> EngramResult<bool> {
            Err(unavailable(self.family, "injected delete failure"))
        }
    }

    /// Delays every search and get by a fixed amount before delegating.
    #[derive(Debug)]
    pub struct SlowBackend {
        inner: InMemoryBackend,
        delay: Duration,
    }

    impl SlowBackend {
        pub fn new(family: StorageFamily, delay: Duration) -> Self {
            Self {
                inner: InMemoryBackend::new(family),
                delay,
            }
        }
    }

    #[async_trait]
    impl BackendFamily for SlowBackend {
        fn family(&self) -> StorageFamily {
            self.inner.family()
        }

        async fn store(&self, key: &str, content: &Content, metadata: &Metadata) -> EngramResult<()> {
            self.inner.store(key, content, metadata).await
        }

        async fn get(&self, key: &str) -> EngramResult<Option<BackendRecord>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }

        async fn search(
            &self,
            query: &str,
            limit: usize,
            filters: &Metadata,
            prefix: &str,
        ) -> EngramResult<Vec<SearchHit>> {
            tokio::time::sleep(self.delay).await;
            self.inner.search(query, limit, filters, prefix).await
        }

        async fn delete(&self, key: &str) -> EngramResult<bool> {
            self.inner.delete(key).await
        }
    }

    /// Fails the first `failures` store calls, then behaves. Counts every
    /// store attempt.
    #[derive(Debug)]
    pub struct FlakyBackend {
        inner: InMemoryBackend,
        failures_remaining: AtomicU32,
        store_calls: AtomicU64,
    }

    impl FlakyBackend {
        pub fn new(family: StorageFamily, failures: u32) -> Self {
            Self {
                inner: InMemoryBackend::new(family),
                failures_remaining: AtomicU32::new(failures),
                store_calls: AtomicU64::new(0),
            }
        }

        /// Store attempts seen so far, failed ones included.
        pub fn store_calls(&self) -> u64 {
            self.store_calls.load(Ordering::SeqCst)
        }

        /// Records successfully written.
        pub fn stored(&self) -> usize {
            self.inner.len()
        }
    }

    #[async_trait]
    impl BackendFamily for FlakyBackend {
        fn family(&self) -> StorageFamily {
            self.inner.family()
        }

        async fn store(&self, key: &str, content: &Content, metadata: &Metadata) -> EngramResult<()> {
            self.store_calls.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(unavailable(self.inner.family(), "injected flaky store"));
            }
            self.inner.store(key, content, metadata).await
        }

        async fn get(&self, key: &str) -> EngramResult<Option<BackendRecord>> {
            self.inner.get(key).await
        }

        async fn search(
            &self,
            query: &str,
            limit: usize,
            filters: &Metadata,
            prefix: &str,
        ) -> EngramResult<Vec<SearchHit>> {
            self.inner.search(query, limit, filters, prefix).await
        }

        async fn delete(&self, key: &str) -> EngramResult<bool> {
            self.inner.delete(key).await
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Engram inputs.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{json, Value};

    /// Generate any storage family.
    pub fn arb_storage_family() -> impl Strategy<Value = StorageFamily> {
        prop::sample::select(StorageFamily::ALL.to_vec())
    }

    /// Generate a non-empty set of enabled families.
    pub fn arb_enabled_families() -> impl Strategy<Value = Vec<StorageFamily>> {
        prop::sample::subsequence(StorageFamily::ALL.to_vec(), 1..=StorageFamily::ALL.len())
    }

    /// Generate any thought type.
    pub fn arb_thought_type() -> impl Strategy<Value = ThoughtType> {
        prop::sample::select(ThoughtType::ALL.to_vec())
    }

    /// Generate a caller identifier.
    pub fn arb_ci_id() -> impl Strategy<Value = String> {
        "ci-[a-z0-9]{1,6}"
    }

    /// Generate a scalar JSON value.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-zA-Z0-9 ]{0,24}".prop_map(Value::String),
        ]
    }

    /// Generate a mapping of scalars (routes to `structured`).
    pub fn arb_flat_mapping() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-z]{1,8}", arb_scalar(), 1..6)
            .prop_map(|m| Value::Object(m.into_iter().collect()))
    }

    /// Generate a mapping with at least one nested container (routes to `document`).
    pub fn arb_nested_mapping() -> impl Strategy<Value = Value> {
        (
            prop::collection::btree_map("[a-z]{1,8}", arb_scalar(), 0..4),
            "[a-z]{1,8}",
            prop::collection::vec(arb_scalar(), 0..4),
        )
            .prop_map(|(mut m, nested_key, items)| {
                m.insert(nested_key, Value::Array(items));
                Value::Object(m.into_iter().collect())
            })
    }

    /// Generate free text of a few words.
    pub fn arb_text() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z]{2,10}", 1..8).prop_map(|words| words.join(" "))
    }

    /// Generate arbitrary content of any shape.
    pub fn arb_content() -> impl Strategy<Value = Content> {
        prop_oneof![
            arb_scalar(),
            arb_text().prop_map(Value::String),
            arb_flat_mapping(),
            arb_nested_mapping(),
        ]
    }

    /// Generate caller metadata, optionally flagged for similarity search.
    pub fn arb_metadata() -> impl Strategy<Value = Metadata> {
        (
            prop::collection::btree_map("[a-z]{1,6}", arb_scalar(), 0..3),
            any::<bool>(),
        )
            .prop_map(|(m, semantic)| {
                let mut metadata: Metadata = m.into_iter().collect();
                if semantic {
                    metadata.insert("semantic_search".to_string(), Value::Bool(true));
                }
                metadata
            })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built engines and helpers for common scenarios.

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Small, fast configuration: tiny cache, short timeouts, quick retries.
    pub fn test_config() -> EngineConfig {
        EngineConfig::default()
            .with_namespace("test")
            .with_cache_size(64)
            .with_promotion_threshold(2)
            .with_search_timeout(Duration::from_millis(200))
            .with_shutdown_timeout(Duration::from_secs(2))
            .with_retry(RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 5,
                max_backoff_ms: 20,
                backoff_multiplier: 2.0,
            })
    }

    /// Started engine with in-process backends.
    pub async fn started_engine(config: EngineConfig) -> Arc<EsrEngine> {
        started_engine_with(config, BackendRegistry::new()).await
    }

    /// Started engine over the given adapters (missing families are filled
    /// with in-process ones).
    pub async fn started_engine_with(
        config: EngineConfig,
        registry: BackendRegistry,
    ) -> Arc<EsrEngine> {
        init_tracing();
        let engine = EsrEngine::with_registry(config, registry)
            .unwrap_or_else(|e| panic!("engine construction failed: {e}"));
        engine
            .start()
            .await
            .unwrap_or_else(|e| panic!("engine start failed: {e}"));
        Arc::new(engine)
    }

    /// Poll `condition` every few milliseconds until it holds or `timeout`
    /// elapses. Returns whether it held.
    pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until `key` is marked promoted in the cache tier.
    pub async fn wait_promoted(engine: &EsrEngine, key: &str) -> bool {
        wait_until(Duration::from_secs(2), || {
            engine.entry(key).map(|e| e.promoted).unwrap_or(false)
        })
        .await
    }

    /// Metadata from a JSON object literal; anything else yields empty metadata.
    pub fn metadata(value: serde_json::Value) -> Metadata {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Metadata::new(),
        }
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on `EngramResult` variants.

    use super::*;

    /// Assert that an EngramResult is NotFound for `key`.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &EngramResult<T>, key: &str) {
        match result {
            Err(EngramError::NotFound { key: k }) => assert_eq!(k, key, "Wrong key in NotFound"),
            other => panic!("Expected NotFound for {key}, got: {other:?}"),
        }
    }

    /// Assert that an EngramResult is a Validation error.
    #[track_caller]
    pub fn assert_validation_error<T: std::fmt::Debug>(result: &EngramResult<T>) {
        match result {
            Err(EngramError::Validation(_)) => {}
            other => panic!("Expected Validation error, got: {other:?}"),
        }
    }

    /// Assert that an EngramResult is a Config error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &EngramResult<T>) {
        match result {
            Err(EngramError::Config(_)) => {}
            other => panic!("Expected Config error, got: {other:?}"),
        }
    }
}

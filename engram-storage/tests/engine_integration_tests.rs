//! Integration tests for the ESR engine: cache-first reads, promotion,
//! eviction fall-through, fan-out search under backend failure, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use engram_storage::{ResultSource, SearchResult};
use engram_test_utils::assertions::assert_not_found;
use engram_test_utils::backends::{FailingBackend, FlakyBackend, SlowBackend};
use engram_test_utils::fixtures::{
    metadata, started_engine, started_engine_with, test_config, wait_promoted, wait_until,
};
use engram_test_utils::{
    init_tracing, BackendFamily, BackendRegistry, EngramError, EsrEngine, InMemoryBackend,
    Metadata, SearchType, StorageFamily,
};
use serde_json::json;

fn keys(results: &[SearchResult]) -> Vec<&str> {
    results.iter().map(|r| r.key.as_str()).collect()
}

// ============================================================================
// CONCRETE SCENARIO
// ============================================================================

#[tokio::test]
async fn test_routing_and_first_read_hits_cache() {
    let engine = started_engine(test_config()).await;

    let preference = json!({"name": "x", "age": 3});
    let decision = engine.decide(&preference, "preference", &Metadata::new());
    assert_eq!(decision.family, StorageFamily::Structured);
    let pref_key = engine
        .store(preference.clone(), "preference", Metadata::new(), Some("a"))
        .unwrap();

    let insight = json!("free text insight");
    let decision = engine.decide(&insight, "insight", &Metadata::new());
    assert_eq!(decision.family, StorageFamily::KeyValue);
    let decision = engine.decide(&insight, "insight", &metadata(json!({"semantic_search": true})));
    assert_eq!(decision.family, StorageFamily::Vector);
    engine
        .store(insight, "insight", Metadata::new(), Some("a"))
        .unwrap();

    assert_eq!(engine.retrieve(&pref_key, Some("a")).await.unwrap(), Some(preference));
    let stats = engine.get_statistics().counters;
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.backend_hits, 0);
    assert_eq!(stats.stores, 2);

    engine.stop().await.unwrap();
}

// ============================================================================
// PROMOTION
// ============================================================================

#[tokio::test]
async fn test_threshold_promotes_to_decided_family() {
    let engine = started_engine(test_config()).await;
    let key = engine
        .store(json!({"name": "x", "age": 3}), "preference", Metadata::new(), Some("a"))
        .unwrap();

    engine.retrieve(&key, Some("a")).await.unwrap();
    assert!(!engine.entry(&key).unwrap().scheduled);
    engine.retrieve(&key, Some("a")).await.unwrap();

    assert!(wait_promoted(&engine, &key).await);
    assert_eq!(engine.location(&key), Some(StorageFamily::Structured));
    assert_eq!(engine.get_statistics().counters.promotions, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_cross_ci_access_promotes_below_threshold() {
    let engine = started_engine(test_config().with_promotion_threshold(50)).await;
    let key = engine
        .store(json!("shared note"), "note", Metadata::new(), Some("ci-a"))
        .unwrap();

    engine.retrieve(&key, Some("ci-b")).await.unwrap();

    assert!(wait_promoted(&engine, &key).await);
    assert_eq!(engine.entry(&key).unwrap().access_count, 1);
    engine.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_promote_once_and_lose_no_increments() {
    let engine = started_engine(test_config()).await;
    let key = engine
        .store(json!("hot value"), "fact", Metadata::new(), Some("seed"))
        .unwrap();

    let mut handles = Vec::new();
    for task in 0..8 {
        let engine = Arc::clone(&engine);
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            let ci = format!("ci-{task}");
            for _ in 0..25 {
                engine.retrieve(&key, Some(&ci)).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(wait_promoted(&engine, &key).await);
    let entry = engine.entry(&key).unwrap();
    assert_eq!(entry.access_count, 200);
    assert_eq!(entry.ci_sources.len(), 9);
    assert_eq!(engine.get_statistics().counters.promotions, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let flaky = Arc::new(FlakyBackend::new(StorageFamily::KeyValue, 1));
    let registry = BackendRegistry::new().with_backend(flaky.clone());
    let engine = started_engine_with(test_config(), registry).await;

    let key = engine.store(json!("retry me"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();

    assert!(wait_promoted(&engine, &key).await);
    assert_eq!(flaky.store_calls(), 2);
    assert_eq!(flaky.stored(), 1);
    assert!(engine.dead_letters().is_empty());
    assert_eq!(engine.get_statistics().counters.errors, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_are_dead_lettered() {
    let flaky = Arc::new(FlakyBackend::new(StorageFamily::KeyValue, 100));
    let registry = BackendRegistry::new().with_backend(flaky.clone());
    let engine = started_engine_with(test_config(), registry).await;

    let key = engine.store(json!("doomed"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();

    let engine_ref = Arc::clone(&engine);
    assert!(wait_until(Duration::from_secs(2), || !engine_ref.dead_letters().is_empty()).await);

    let letters = engine.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].key, key);
    assert_eq!(letters[0].family, StorageFamily::KeyValue);
    assert_eq!(letters[0].attempts, 3);
    assert_eq!(flaky.store_calls(), 3);

    let entry = engine.entry(&key).unwrap();
    assert!(!entry.promoted);
    assert!(!entry.is_pending());
    assert_eq!(engine.get_statistics().counters.dead_letters, 1);

    let report = engine.stop().await.unwrap();
    assert_eq!(report.dead_letters, 1);
}

// ============================================================================
// EVICTION AND FALL-THROUGH
// ============================================================================

#[tokio::test]
async fn test_promoted_then_evicted_entry_is_still_retrievable() {
    let engine = started_engine(test_config().with_cache_size(2)).await;
    let key = engine.store(json!("durable"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    assert!(wait_promoted(&engine, &key).await);

    engine.store(json!("filler one"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.store(json!("filler two"), "fact", Metadata::new(), Some("a")).unwrap();
    assert!(engine.entry(&key).is_none());
    assert!(engine.get_statistics().counters.evictions >= 1);

    assert_eq!(engine.retrieve(&key, Some("b")).await.unwrap(), Some(json!("durable")));
    let stats = engine.get_statistics().counters;
    assert_eq!(stats.backend_hits, 1);

    // Re-warmed as already durable, so it is never promoted again.
    let warmed = engine.entry(&key).unwrap();
    assert!(warmed.promoted);
    assert_eq!(warmed.content_type, "fact");
    engine.retrieve(&key, Some("c")).await.unwrap();
    assert_eq!(engine.get_statistics().counters.cache_hits, 3);
    assert_eq!(engine.get_statistics().counters.promotions, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_restoring_evicted_durable_key_does_not_promote_again() {
    let engine = started_engine(test_config().with_cache_size(1)).await;
    let key = engine.store(json!("durable"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    assert!(wait_promoted(&engine, &key).await);

    engine.store(json!("filler"), "fact", Metadata::new(), Some("a")).unwrap();
    assert!(engine.entry(&key).is_none());

    let again = engine.store(json!("durable"), "fact", Metadata::new(), Some("a")).unwrap();
    assert_eq!(again, key);
    assert!(engine.entry(&key).unwrap().promoted);
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("b")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(engine.get_statistics().counters.promotions, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_unpromoted_evicted_entry_is_a_miss() {
    let engine = started_engine(test_config().with_cache_size(1)).await;
    let key = engine.store(json!("fleeting"), "fact", Metadata::new(), None).unwrap();
    engine.store(json!("newer"), "fact", Metadata::new(), None).unwrap();

    assert_eq!(engine.retrieve(&key, None).await.unwrap(), None);
    assert_eq!(engine.get_statistics().counters.misses, 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_full_cache_of_pending_entries_rejects_store() {
    init_tracing();
    // Not started: claimed tasks stay queued, so entries stay pending.
    let engine = EsrEngine::new(test_config().with_cache_size(1).with_promotion_threshold(1)).unwrap();
    let key = engine.store(json!("pinned"), "fact", Metadata::new(), None).unwrap();
    engine.retrieve(&key, None).await.unwrap();
    assert!(engine.entry(&key).unwrap().is_pending());

    let err = engine
        .store(json!("no room"), "fact", Metadata::new(), None)
        .unwrap_err();
    assert_eq!(err, EngramError::CacheFull { capacity: 1 });
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_namespaces_isolate_engines_sharing_storage() {
    let shared: Arc<dyn BackendFamily> = Arc::new(InMemoryBackend::new(StorageFamily::KeyValue));
    let config = test_config().with_backends([StorageFamily::KeyValue]);

    let a = started_engine_with(
        config.clone().with_namespace("alpha"),
        BackendRegistry::new().with_backend(Arc::clone(&shared)),
    )
    .await;
    let b = started_engine_with(
        config.with_namespace("beta"),
        BackendRegistry::new().with_backend(Arc::clone(&shared)),
    )
    .await;

    let key = a.store(json!("secret"), "fact", Metadata::new(), Some("x")).unwrap();
    a.retrieve(&key, Some("x")).await.unwrap();
    a.retrieve(&key, Some("x")).await.unwrap();
    assert!(wait_promoted(&a, &key).await);

    assert!(shared.get(&format!("alpha:{key}")).await.unwrap().is_some());
    assert_eq!(b.retrieve(&key, Some("y")).await.unwrap(), None);
    assert!(b.search("secret", SearchType::Pattern, 5, None).await.unwrap().is_empty());

    // A stronger foreign match must not take this namespace's only slot.
    shared.store("beta:x", &json!("needle"), &Metadata::new()).await.unwrap();
    shared
        .store("alpha:mine", &json!("needle in my namespace"), &Metadata::new())
        .await
        .unwrap();
    let results = a.search("needle", SearchType::Pattern, 1, None).await.unwrap();
    assert_eq!(keys(&results), vec!["mine"]);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

// ============================================================================
// SEARCH
// ============================================================================

async fn seeded_key_value(entries: &[(&str, &str)]) -> Arc<InMemoryBackend> {
    let backend = Arc::new(InMemoryBackend::new(StorageFamily::KeyValue));
    for (key, text) in entries {
        backend
            .store(
                &format!("test:{key}"),
                &json!(text),
                &metadata(json!({"content_type": "fact"})),
            )
            .await
            .unwrap();
    }
    backend
}

#[tokio::test]
async fn test_search_survives_failing_family() {
    let kv = seeded_key_value(&[("durable-1", "needle in storage")]).await;
    let registry = BackendRegistry::new()
        .with_backend(kv)
        .with_backend(Arc::new(FailingBackend::new(StorageFamily::Vector)));
    let engine = started_engine_with(test_config(), registry).await;
    engine
        .store(json!("needle in cache"), "fact", Metadata::new(), Some("a"))
        .unwrap();

    let results = engine.search("needle", SearchType::Pattern, 10, Some("a")).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results.iter().any(|r| r.source == ResultSource::Cache));
    let durable = results.iter().find(|r| r.key == "durable-1").unwrap();
    assert_eq!(durable.source, ResultSource::Backend(StorageFamily::KeyValue));
    assert_eq!(durable.content_type, "fact");
    assert!(durable.metadata.is_empty());
    assert!(engine.get_statistics().counters.errors >= 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_slow_family_times_out_without_failing_search() {
    let kv = seeded_key_value(&[("fast", "needle fast")]).await;
    let slow = SlowBackend::new(StorageFamily::Document, Duration::from_secs(5));
    slow.store("test:slow", &json!("needle slow"), &Metadata::new())
        .await
        .unwrap();
    let registry = BackendRegistry::new()
        .with_backend(kv)
        .with_backend(Arc::new(slow));
    let engine = started_engine_with(test_config(), registry).await;

    let started = tokio::time::Instant::now();
    let results = engine.search("needle", SearchType::Pattern, 5, None).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(keys(&results), vec!["fast"]);
    assert!(engine.get_statistics().counters.errors >= 1);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_search_dedupes_cache_and_backend_copies() {
    let engine = started_engine(test_config()).await;
    let key = engine.store(json!("dedupe me"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    assert!(wait_promoted(&engine, &key).await);

    let results = engine.search("dedupe", SearchType::Pattern, 10, None).await.unwrap();
    assert_eq!(keys(&results), vec![key.as_str()]);
    assert_eq!(results[0].source, ResultSource::Cache);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_search_types() {
    let engine = started_engine(test_config()).await;
    engine.store(json!("Promotion Pipeline"), "fact", Metadata::new(), None).unwrap();
    engine.store(json!("pipeline of thoughts"), "fact", Metadata::new(), None).unwrap();

    let exact = engine.search("Pipeline", SearchType::Exact, 10, None).await.unwrap();
    assert_eq!(exact.len(), 1);

    let pattern = engine.search("pipeline", SearchType::Pattern, 10, None).await.unwrap();
    assert_eq!(pattern.len(), 2);

    let semantic = engine
        .search("promotion latency", SearchType::Semantic, 10, None)
        .await
        .unwrap();
    assert_eq!(semantic.len(), 1);
    assert!(semantic[0].score > 0.0 && semantic[0].score < 0.8);

    let limited = engine.search("pipeline", SearchType::Pattern, 1, None).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(engine.get_statistics().counters.searches, 4);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_search_filters_on_metadata() {
    let engine = started_engine(test_config()).await;
    engine
        .store(json!("topic note"), "fact", metadata(json!({"project": "a"})), None)
        .unwrap();
    engine
        .store(json!("topic memo"), "fact", metadata(json!({"project": "b"})), None)
        .unwrap();

    let results = engine
        .search_filtered("topic", SearchType::Pattern, 10, &metadata(json!({"project": "b"})), None)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].content, json!("topic memo"));
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_content_type_filter_matches_cache_entries() {
    let engine = started_engine(test_config()).await;
    let fact = engine
        .store(json!("topic note"), "fact", Metadata::new(), None)
        .unwrap();
    engine
        .store(json!("topic plan"), "plan", Metadata::new(), None)
        .unwrap();
    assert!(engine.entry(&fact).unwrap().metadata.get("content_type").is_none());

    let results = engine
        .search_filtered(
            "topic",
            SearchType::Pattern,
            10,
            &metadata(json!({"content_type": "fact"})),
            None,
        )
        .await
        .unwrap();
    assert_eq!(keys(&results), vec![fact.as_str()]);
    assert_eq!(results[0].source, ResultSource::Cache);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_equal_looking_string_and_number_are_distinct_entries() {
    let engine = started_engine(test_config()).await;
    let text = engine.store(json!("42"), "fact", Metadata::new(), None).unwrap();
    let number = engine.store(json!(42), "fact", Metadata::new(), None).unwrap();
    assert_ne!(text, number);
    assert_eq!(engine.retrieve(&text, None).await.unwrap(), Some(json!("42")));
    assert_eq!(engine.retrieve(&number, None).await.unwrap(), Some(json!(42)));
    engine.stop().await.unwrap();
}

// ============================================================================
// FORGET, STATISTICS, SHUTDOWN
// ============================================================================

#[tokio::test]
async fn test_forget_removes_cache_and_durable_copies() {
    let engine = started_engine(test_config()).await;
    let key = engine.store(json!("erase me"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    assert!(wait_promoted(&engine, &key).await);

    engine.forget(&key).await.unwrap();
    assert_eq!(engine.retrieve(&key, None).await.unwrap(), None);
    assert_not_found(&engine.forget(&key).await, &key);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_pattern_analysis() {
    let engine = started_engine(test_config().with_promotion_threshold(100)).await;
    let hot = engine.store(json!("hot"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.store(json!("cold"), "insight", Metadata::new(), Some("b")).unwrap();
    for _ in 0..5 {
        engine.retrieve(&hot, Some("a")).await.unwrap();
    }

    let analysis = engine.analyze_patterns();
    assert_eq!(analysis.total_entries, 2);
    assert_eq!(analysis.total_accesses, 5);
    assert_eq!(analysis.unique_cis, 2);
    assert_eq!(analysis.type_distribution.get("insight"), Some(&1));
    assert_eq!(analysis.hot_entries[0].key, hot);

    let stats = engine.get_statistics();
    assert_eq!(stats.cache_entries, 2);
    assert_eq!(stats.namespace, "test");
    assert_eq!(stats.enabled_backends.len(), 4);
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_drains_queued_promotions() {
    init_tracing();
    // Never started: stop() drains the queue inline.
    let engine = EsrEngine::new(test_config()).unwrap();
    let key = engine.store(json!("queued"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    engine.retrieve(&key, Some("a")).await.unwrap();
    assert!(engine.entry(&key).unwrap().is_pending());

    let report = engine.stop().await.unwrap();
    assert_eq!(report.drained, 1);
    assert_eq!(report.undrained, 0);
    assert!(engine.entry(&key).unwrap().promoted);

    // Nothing is scheduled after stop.
    let other = engine.store(json!("late"), "fact", Metadata::new(), Some("a")).unwrap();
    engine.retrieve(&other, Some("a")).await.unwrap();
    engine.retrieve(&other, Some("a")).await.unwrap();
    assert!(!engine.entry(&other).unwrap().is_pending());
}

#[tokio::test]
async fn test_full_queue_releases_claim() {
    init_tracing();
    let engine = EsrEngine::new(
        test_config()
            .with_promotion_threshold(1)
            .with_queue_capacity(1),
    )
    .unwrap();
    let first = engine.store(json!("first"), "fact", Metadata::new(), None).unwrap();
    let second = engine.store(json!("second"), "fact", Metadata::new(), None).unwrap();

    engine.retrieve(&first, None).await.unwrap();
    engine.retrieve(&second, None).await.unwrap();

    assert!(engine.entry(&first).unwrap().is_pending());
    let rejected = engine.entry(&second).unwrap();
    assert!(!rejected.scheduled);
    assert_eq!(engine.get_statistics().counters.errors, 1);

    let report = engine.stop().await.unwrap();
    assert_eq!(report.drained, 1);
}

//! Cognitive workflow scenarios against a live engine: thought round trips,
//! association-first recall, context building with dangling links, and
//! natural forgetting.

use std::sync::Arc;
use std::time::Duration;

use engram_context::{CognitiveWorkflows, NewThought, MAX_CONTEXT_DEPTH};
use engram_test_utils::assertions::{assert_not_found, assert_validation_error};
use engram_test_utils::fixtures::{
    metadata, started_engine, test_config, wait_promoted, wait_until,
};
use engram_test_utils::generators::arb_thought_type;
use engram_test_utils::{init_tracing, EsrEngine, StorageFamily, ThoughtType};
use proptest::prelude::*;
use serde_json::json;

fn idle_workflows() -> CognitiveWorkflows {
    init_tracing();
    let engine = EsrEngine::new(test_config().with_promotion_threshold(1_000))
        .unwrap_or_else(|e| panic!("engine construction failed: {e}"));
    CognitiveWorkflows::new(Arc::new(engine))
}

#[tokio::test]
async fn test_store_and_recall_thought() {
    let wf = idle_workflows();
    let id = wf
        .store_thought(
            NewThought::new("the borrow checker rejects aliased mutation")
                .with_type("FACT")
                .with_context(metadata(json!({"project": "engram"})))
                .with_confidence(0.8),
            Some("alpha"),
        )
        .unwrap();

    let thought = wf.recall_thought(&id, Some("beta")).await.unwrap();
    assert_eq!(thought.id, id);
    assert_eq!(thought.content, json!("the borrow checker rejects aliased mutation"));
    assert_eq!(thought.thought_type, ThoughtType::Fact);
    assert_eq!(thought.confidence, 0.8);
    assert_eq!(thought.ci_id.as_deref(), Some("alpha"));
    assert_eq!(thought.context.get("project"), Some(&json!("engram")));

    let entry = wf.engine().entry(&id).unwrap();
    assert_eq!(entry.content_type, "fact");
    assert_eq!(entry.access_count, 1);
    assert_eq!(entry.ci_sources.len(), 2);

    assert_not_found(&wf.recall_thought("0000000000000000", None).await, "0000000000000000");
}

#[tokio::test]
async fn test_invalid_thoughts_are_rejected_before_storage() {
    let wf = idle_workflows();
    assert_validation_error(&wf.store_thought(NewThought::new("x").with_confidence(2.0), None));
    assert_validation_error(&wf.store_thought(NewThought::new(json!(null)), None));
    assert_eq!(wf.memory_stats().cache_entries, 0);
}

#[tokio::test]
async fn test_recall_similar_prefers_associations() {
    let wf = idle_workflows();
    let root = wf
        .store_thought(NewThought::new("rust ownership rules"), Some("a"))
        .unwrap();
    let linked = wf
        .store_thought(
            NewThought::new("ownership and borrowing").with_associations([root.clone()]),
            Some("a"),
        )
        .unwrap();
    let unrelated = wf
        .store_thought(NewThought::new("unrelated gardening tips"), Some("a"))
        .unwrap();

    let similar = wf.recall_similar(&root, 5, Some("a")).await.unwrap();
    let ids: Vec<_> = similar.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![linked.as_str()]);

    let by_text = wf.recall_similar("gardening", 5, None).await.unwrap();
    assert_eq!(by_text.len(), 1);
    assert_eq!(by_text[0].id, unrelated);
    assert_eq!(by_text[0].content, json!("unrelated gardening tips"));

    assert!(wf.recall_similar(&root, 0, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_build_context_expands_associations() {
    let wf = idle_workflows();
    let root = wf
        .store_thought(
            NewThought::new("tokio runtime scheduling").with_type("fact"),
            None,
        )
        .unwrap();
    let child = wf
        .store_thought(
            NewThought::new("work stealing is great")
                .with_type("opinion")
                .with_confidence(0.6)
                .with_associations([root.clone()]),
            None,
        )
        .unwrap();
    let grandchild = wf
        .store_thought(
            NewThought::new("how does park work")
                .with_type("question")
                .with_associations([child.clone()]),
            None,
        )
        .unwrap();
    wf.store_thought(
        NewThought::new("tokio io driver").with_associations(["deadbeefdeadbeef"]),
        None,
    )
    .unwrap();

    let ctx = wf.build_context("tokio runtime", 2, None).await.unwrap();
    assert_eq!(ctx.topic, "tokio runtime");
    assert_eq!(ctx.primary().count(), 2);
    assert_eq!(ctx.primary().next().map(|t| t.id.as_str()), Some(root.as_str()));
    let associated: Vec<_> = ctx.associated().map(|t| t.id.as_str()).collect();
    assert_eq!(associated, vec![child.as_str(), grandchild.as_str()]);
    assert_eq!(ctx.depth, 2);
    assert_eq!(ctx.dangling, vec!["deadbeefdeadbeef".to_string()]);
    assert_eq!(ctx.facts().count(), 1);
    assert_eq!(ctx.opinions().count(), 1);
    assert_eq!(ctx.questions().count(), 1);
    assert!(ctx.as_text().contains("[question] how does park work"));

    let shallow = wf.build_context("tokio runtime", 0, None).await.unwrap();
    assert_eq!(shallow.depth, 0);
    assert_eq!(shallow.memories.len(), 2);
    assert!(shallow.dangling.is_empty());
}

#[tokio::test]
async fn test_build_context_depth_is_capped() {
    let wf = idle_workflows();
    let mut previous = wf
        .store_thought(NewThought::new("chain origin"), None)
        .unwrap();
    for step in 0..6 {
        previous = wf
            .store_thought(
                NewThought::new(format!("link number {step}")).with_associations([previous]),
                None,
            )
            .unwrap();
    }

    let ctx = wf.build_context("origin", 100, None).await.unwrap();
    assert_eq!(ctx.depth, MAX_CONTEXT_DEPTH);
    assert_eq!(ctx.memories.len(), 1 + MAX_CONTEXT_DEPTH);
    assert!(ctx.memories.iter().all(|m| m.hop <= MAX_CONTEXT_DEPTH));
}

#[tokio::test]
async fn test_built_context_becomes_active() {
    let wf = idle_workflows();
    assert!(wf.memory_stats().active_topic.is_none());
    wf.build_context("lifetimes", 1, None).await.unwrap();

    let id = wf
        .store_thought(NewThought::new("elision rules"), None)
        .unwrap();
    let thought = wf.recall_thought(&id, None).await.unwrap();
    assert_eq!(thought.context.get("topic"), Some(&json!("lifetimes")));
    assert_eq!(wf.memory_stats().active_topic.as_deref(), Some("lifetimes"));
}

#[tokio::test]
async fn test_strengthen_memory_drives_promotion() {
    let engine = started_engine(test_config()).await;
    let wf = CognitiveWorkflows::new(engine.clone());
    let id = wf
        .store_thought(
            NewThought::new("promote me")
                .with_metadata(metadata(json!({"storage_family": "key_value"}))),
            Some("a"),
        )
        .unwrap();

    assert!(wf.strengthen_memory(&id, Some("a")).await.unwrap());
    assert!(wf.strengthen_memory(&id, Some("a")).await.unwrap());
    assert!(wait_promoted(&engine, &id).await);
    assert_eq!(engine.location(&id), Some(StorageFamily::KeyValue));

    assert!(!wf.strengthen_memory("ffffffffffffffff", None).await.unwrap());
    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_forget_naturally_drops_idle_chains() {
    let wf = idle_workflows();
    let first = wf.store_thought(NewThought::new("first"), None).unwrap();
    wf.store_thought(NewThought::new("second").with_associations([first.clone()]), None)
        .unwrap();
    assert_eq!(wf.memory_stats().thought_chains, 2);

    assert_eq!(wf.forget_naturally(Duration::from_secs(3600)), 0);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(wf.forget_naturally(Duration::from_millis(10)), 2);

    let stats = wf.memory_stats();
    assert_eq!(stats.cache_entries, 0);
    assert_eq!(stats.thought_chains, 0);
    assert_eq!(stats.total_associations, 0);
    assert_not_found(&wf.recall_thought(&first, None).await, &first);
}

#[tokio::test]
async fn test_forget_thought_leaves_tolerated_dangling_links() {
    let wf = idle_workflows();
    let gone = wf.store_thought(NewThought::new("short lived"), None).unwrap();
    let kept = wf
        .store_thought(NewThought::new("survivor").with_associations([gone.clone()]), None)
        .unwrap();

    wf.forget_thought(&gone).await.unwrap();
    assert!(wf.associations_of(&kept).is_empty());
    assert_not_found(&wf.forget_thought(&gone).await, &gone);

    // The survivor's own record still names the forgotten id.
    let survivor = wf.recall_thought(&kept, None).await.unwrap();
    assert_eq!(survivor.associations, vec![gone.clone()]);
    let ctx = wf.build_context("survivor", 1, None).await.unwrap();
    assert_eq!(ctx.dangling, vec![gone]);
}

#[tokio::test]
async fn test_searches_ignore_thought_envelope_fields() {
    let wf = idle_workflows();
    let id = wf
        .store_thought(NewThought::new("pinning futures").with_type("memory"), Some("alpha"))
        .unwrap();
    wf.store_thought(NewThought::new("async cancellation").with_type("memory"), Some("alpha"))
        .unwrap();

    assert!(wf.build_context("memory", 1, None).await.unwrap().is_empty());
    assert!(wf.recall_similar("alpha", 5, None).await.unwrap().is_empty());

    let ctx = wf.build_context("pinning", 1, None).await.unwrap();
    let ids: Vec<_> = ctx.primary().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec![id.as_str()]);
}

#[tokio::test(start_paused = true)]
async fn test_metabolism_fades_idle_memories_on_interval() {
    let wf = Arc::new(idle_workflows());
    let first = wf.store_thought(NewThought::new("fleeting"), None).unwrap();
    wf.store_thought(NewThought::new("passing").with_associations([first]), None)
        .unwrap();
    // Let the wall clock move past the stores.
    std::thread::sleep(Duration::from_millis(5));

    assert!(wf.start_metabolism(Duration::from_secs(60), Duration::from_millis(1)));
    assert!(!wf.start_metabolism(Duration::from_secs(60), Duration::from_millis(1)));
    tokio::task::yield_now().await;
    assert_eq!(wf.memory_stats().cache_entries, 2);

    assert!(wait_until(Duration::from_secs(120), || wf.memory_stats().cache_entries == 0).await);
    assert_eq!(wf.memory_stats().thought_chains, 0);

    assert!(wf.stop_metabolism().await);
    assert!(!wf.metabolism_running());
    assert!(!wf.stop_metabolism().await);
}

#[tokio::test(start_paused = true)]
async fn test_metabolism_ends_when_workflows_are_dropped() {
    let wf = Arc::new(idle_workflows());
    assert!(wf.start_metabolism(Duration::from_secs(1), Duration::from_millis(1)));
    let engine = wf.engine().clone();
    engine.store(json!("kept"), "fact", Default::default(), None).unwrap();
    std::thread::sleep(Duration::from_millis(5));
    drop(wf);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(engine.get_statistics().cache_entries, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_thought_type_and_confidence_survive_recall(
        thought_type in arb_thought_type(),
        confidence in 0.0f64..=1.0,
        text in "[a-z]{1,12}( [a-z]{1,12}){0,4}",
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))?;
        rt.block_on(async {
            let wf = idle_workflows();
            let id = wf
                .store_thought(
                    NewThought::new(text.clone())
                        .with_type(thought_type.as_str())
                        .with_confidence(confidence),
                    None,
                )
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let thought = wf
                .recall_thought(&id, None)
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(thought.thought_type, thought_type);
            prop_assert_eq!(thought.confidence, confidence);
            prop_assert_eq!(thought.content, json!(text));
            Ok(())
        })?;
    }
}

//! Engram Context - Cognitive Workflows
//!
//! A thin cognitive layer over [`EsrEngine`]: content is stored as typed
//! [`Thought`]s, linked by soft associations, and gathered back into a
//! [`ThoughtContext`] around a topic. Associations are ids only. A thought
//! that disappears leaves dangling references behind, and every reader here
//! tolerates them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::Utc;
use engram_core::{
    Content, EngramError, EngramResult, Metadata, SearchType, ThoughtType, Timestamp,
    ValidationError,
};
use engram_storage::scoring::searchable_text;
use engram_storage::{EngineStatistics, EsrEngine, SearchResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Deepest association expansion `build_context` will perform, whatever the
/// caller asks for.
pub const MAX_CONTEXT_DEPTH: usize = 3;

/// Most thoughts a single context may gather.
pub const MAX_CONTEXT_MEMORIES: usize = 50;

/// How long a built context stays active for subsequent `store_thought` calls.
pub const ACTIVE_CONTEXT_TTL: Duration = Duration::from_secs(30 * 60);

/// Metadata field carrying a thought's confidence.
pub const CONFIDENCE_FIELD: &str = "confidence";

/// Metadata field carrying the calling CI.
pub const CI_FIELD: &str = "ci";

// ============================================================================
// THOUGHT
// ============================================================================

/// A typed, attributed piece of content held by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    /// Engine key of the underlying record.
    pub id: String,
    pub content: Content,
    pub thought_type: ThoughtType,
    pub context: Metadata,
    /// Ids of related thoughts. May dangle.
    pub associations: Vec<String>,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub ci_id: Option<String>,
    pub timestamp: Timestamp,
}

/// Stored shape of a thought. The id is the engine key and is not part of
/// the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThoughtRecord {
    content: Content,
    #[serde(rename = "type")]
    thought_type: String,
    #[serde(default)]
    context: Metadata,
    #[serde(default)]
    associations: Vec<String>,
    confidence: f64,
    #[serde(default)]
    source_ci: Option<String>,
    timestamp: Timestamp,
}

impl Thought {
    /// Rebuild a thought from engine content.
    ///
    /// Content written by [`CognitiveWorkflows::store_thought`] parses back
    /// field for field. Anything else stored through the engine directly is
    /// wrapped as-is: the type comes from `content_type` and the thought gets
    /// full confidence and no associations.
    pub fn from_content(
        id: &str,
        content: &Content,
        content_type: &str,
        stored_at: Option<Timestamp>,
    ) -> Self {
        match serde_json::from_value::<ThoughtRecord>(content.clone()) {
            Ok(record) => Self {
                id: id.to_string(),
                content: record.content,
                thought_type: ThoughtType::parse_or_default(&record.thought_type),
                context: record.context,
                associations: record.associations,
                confidence: record.confidence,
                ci_id: record.source_ci,
                timestamp: record.timestamp,
            },
            Err(_) => Self {
                id: id.to_string(),
                content: content.clone(),
                thought_type: ThoughtType::parse_or_default(content_type),
                context: Metadata::new(),
                associations: Vec::new(),
                confidence: 1.0,
                ci_id: None,
                timestamp: stored_at.unwrap_or_else(Utc::now),
            },
        }
    }

    fn from_search(result: SearchResult) -> Self {
        Self::from_content(&result.key, &result.content, &result.content_type, None)
    }

    fn to_record(&self) -> ThoughtRecord {
        ThoughtRecord {
            content: self.content.clone(),
            thought_type: self.thought_type.as_str().to_string(),
            context: self.context.clone(),
            associations: self.associations.clone(),
            confidence: self.confidence,
            source_ci: self.ci_id.clone(),
            timestamp: self.timestamp,
        }
    }

    /// One-line rendering used by [`ThoughtContext::as_text`].
    pub fn summary(&self) -> String {
        format!(
            "[{}] {} (confidence {:.2})",
            self.thought_type,
            searchable_text(&self.content),
            self.confidence
        )
    }
}

/// Input for [`CognitiveWorkflows::store_thought`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewThought {
    pub content: Content,
    /// Raw tag. Unrecognized tags store as `memory`.
    pub thought_type: String,
    pub context: Metadata,
    pub associations: Vec<String>,
    pub confidence: f64,
    /// Extra engine metadata, e.g. a `storage_family` routing hint.
    pub metadata: Metadata,
}

impl NewThought {
    pub fn new(content: impl Into<Content>) -> Self {
        Self {
            content: content.into(),
            thought_type: ThoughtType::default().as_str().to_string(),
            context: Metadata::new(),
            associations: Vec::new(),
            confidence: 1.0,
            metadata: Metadata::new(),
        }
    }

    pub fn with_type(mut self, thought_type: impl Into<String>) -> Self {
        self.thought_type = thought_type.into();
        self
    }

    pub fn with_context(mut self, context: Metadata) -> Self {
        self.context = context;
        self
    }

    pub fn with_associations<I, S>(mut self, associations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.associations = associations.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Reject input the engine should never see.
    pub fn validate(&self) -> EngramResult<()> {
        if self.content.is_null() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "content".to_string(),
            }
            .into());
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::InvalidValue {
                field: "confidence".to_string(),
                reason: format!("must be within [0, 1], got {}", self.confidence),
            }
            .into());
        }
        if self.associations.iter().any(|id| id.trim().is_empty()) {
            return Err(ValidationError::InvalidValue {
                field: "associations".to_string(),
                reason: "association ids must not be blank".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// CONTEXT
// ============================================================================

/// A thought gathered into a context, with the hop that reached it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextMemory {
    /// 0 for direct topic matches, `n` for thoughts reached through `n`
    /// association links.
    pub hop: usize,
    pub thought: Thought,
}

/// Thoughts gathered around a topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThoughtContext {
    pub topic: String,
    pub memories: Vec<ContextMemory>,
    /// Association ids that no longer resolve.
    pub dangling: Vec<String>,
    /// Association levels actually expanded.
    pub depth: usize,
    pub timestamp: Timestamp,
}

impl ThoughtContext {
    fn of_type(&self, thought_type: ThoughtType) -> impl Iterator<Item = &Thought> + '_ {
        self.memories
            .iter()
            .map(|m| &m.thought)
            .filter(move |t| t.thought_type == thought_type)
    }

    /// Thoughts that matched the topic directly.
    pub fn primary(&self) -> impl Iterator<Item = &Thought> + '_ {
        self.memories.iter().filter(|m| m.hop == 0).map(|m| &m.thought)
    }

    /// Thoughts reached through associations.
    pub fn associated(&self) -> impl Iterator<Item = &Thought> + '_ {
        self.memories.iter().filter(|m| m.hop > 0).map(|m| &m.thought)
    }

    pub fn facts(&self) -> impl Iterator<Item = &Thought> + '_ {
        self.of_type(ThoughtType::Fact)
    }

    pub fn opinions(&self) -> impl Iterator<Item = &Thought> + '_ {
        self.of_type(ThoughtType::Opinion)
    }

    pub fn questions(&self) -> impl Iterator<Item = &Thought> + '_ {
        self.of_type(ThoughtType::Question)
    }

    /// Mean confidence across all gathered thoughts, 0 when empty.
    pub fn confidence(&self) -> f64 {
        if self.memories.is_empty() {
            return 0.0;
        }
        let total: f64 = self.memories.iter().map(|m| m.thought.confidence).sum();
        total / self.memories.len() as f64
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    /// Render as plain text, direct matches first.
    pub fn as_text(&self) -> String {
        let mut out = format!("## {}\n", self.topic);
        for memory in &self.memories {
            out.push_str(&"  ".repeat(memory.hop));
            out.push_str("- ");
            out.push_str(&memory.thought.summary());
            out.push('\n');
        }
        out
    }
}

impl fmt::Display for ThoughtContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

/// Counters for the cognitive layer.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub cache_entries: usize,
    /// Thoughts holding at least one association.
    pub thought_chains: usize,
    /// Association links, counted once per direction.
    pub total_associations: usize,
    pub active_topic: Option<String>,
    pub engine: EngineStatistics,
}

#[derive(Debug, Clone)]
struct ActiveContext {
    topic: String,
    built_at: Timestamp,
}

// ============================================================================
// COGNITIVE WORKFLOWS
// ============================================================================

/// Thought-level operations over a shared engine.
pub struct CognitiveWorkflows {
    engine: Arc<EsrEngine>,
    chains: RwLock<HashMap<String, BTreeSet<String>>>,
    active: Mutex<Option<ActiveContext>>,
    metabolism: Mutex<Option<Metabolism>>,
}

/// Handle on the running metabolism task.
struct Metabolism {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl fmt::Debug for CognitiveWorkflows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CognitiveWorkflows")
            .field("namespace", &self.engine.namespace())
            .field("thought_chains", &self.chain_count())
            .field("metabolism", &self.metabolism_running())
            .finish()
    }
}

impl CognitiveWorkflows {
    pub fn new(engine: Arc<EsrEngine>) -> Self {
        Self {
            engine,
            chains: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
            metabolism: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> &Arc<EsrEngine> {
        &self.engine
    }

    /// Store a thought and return its id.
    ///
    /// Every association is linked in both directions. When the thought
    /// carries no context of its own and a context was built recently, the
    /// active topic is recorded on it.
    pub fn store_thought(&self, thought: NewThought, ci_id: Option<&str>) -> EngramResult<String> {
        thought.validate()?;

        let thought_type = ThoughtType::parse_or_default(&thought.thought_type);
        if thought_type.as_str() != thought.thought_type.trim().to_lowercase() {
            debug!(tag = %thought.thought_type, "Unrecognized thought type, storing as memory");
        }

        let mut context = thought.context;
        if context.is_empty() {
            if let Some(topic) = self.active_topic() {
                context.insert("topic".to_string(), Value::String(topic));
            }
        }

        let mut associations = Vec::with_capacity(thought.associations.len());
        for id in thought.associations {
            if !associations.contains(&id) {
                associations.push(id);
            }
        }

        let record = Thought {
            id: String::new(),
            content: thought.content,
            thought_type,
            context,
            associations,
            confidence: thought.confidence,
            ci_id: ci_id.map(str::to_string),
            timestamp: Utc::now(),
        }
        .to_record();
        let linked = record.associations.clone();

        let mut metadata = thought.metadata;
        metadata.insert(CONFIDENCE_FIELD.to_string(), json!(record.confidence));
        metadata.insert(CI_FIELD.to_string(), json!(ci_id));

        let content =
            serde_json::to_value(&record).map_err(|e| ValidationError::InvalidValue {
                field: "content".to_string(),
                reason: e.to_string(),
            })?;
        let id = self
            .engine
            .store(content, thought_type.as_str(), metadata, ci_id)?;

        self.link(&id, &linked);
        debug!(id = %id, thought_type = %thought_type, associations = linked.len(), "Thought stored");
        Ok(id)
    }

    /// Read a thought back, counting an access on the underlying key.
    pub async fn recall_thought(&self, id: &str, ci_id: Option<&str>) -> EngramResult<Thought> {
        let content = self
            .engine
            .retrieve(id, ci_id)
            .await?
            .ok_or_else(|| EngramError::NotFound { key: id.to_string() })?;
        let entry = self.engine.entry(id);
        let content_type = entry
            .as_ref()
            .map(|e| e.content_type.as_str())
            .unwrap_or_default();
        Ok(Thought::from_content(
            id,
            &content,
            content_type,
            entry.as_ref().map(|e| e.created_at),
        ))
    }

    /// Thoughts related to `reference`: its associations first, then the
    /// closest search matches.
    ///
    /// `reference` is either a thought id or free text. A known id searches
    /// by that thought's content and is itself excluded from the results.
    pub async fn recall_similar(
        &self,
        reference: &str,
        limit: usize,
        ci_id: Option<&str>,
    ) -> EngramResult<Vec<Thought>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut seen = HashSet::from([reference.to_string()]);
        let mut similar = Vec::new();

        for id in self.associations_of(reference) {
            if similar.len() >= limit {
                return Ok(similar);
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            match self.recall_thought(&id, ci_id).await {
                Ok(thought) => similar.push(thought),
                Err(EngramError::NotFound { .. }) => {
                    debug!(reference = %reference, id = %id, "Skipping dangling association");
                }
                Err(e) => return Err(e),
            }
        }

        let query = match self.engine.entry(reference) {
            Some(entry) => {
                let thought =
                    Thought::from_content(reference, &entry.content, &entry.content_type, None);
                searchable_text(&thought.content)
            }
            None => reference.to_string(),
        };
        let results = self
            .engine
            .search(&query, SearchType::Semantic, limit + seen.len(), ci_id)
            .await?;
        for result in results {
            if similar.len() >= limit {
                break;
            }
            if seen.insert(result.key.clone()) {
                similar.push(Thought::from_search(result));
            }
        }
        Ok(similar)
    }

    /// Gather thoughts around `topic`.
    ///
    /// Direct matches come from a semantic search. Each further level follows
    /// the associations of the previous one, up to `depth` levels (never more
    /// than [`MAX_CONTEXT_DEPTH`]) and [`MAX_CONTEXT_MEMORIES`] thoughts in
    /// total. Associations that no longer resolve are reported in
    /// [`ThoughtContext::dangling`].
    pub async fn build_context(
        &self,
        topic: &str,
        depth: usize,
        ci_id: Option<&str>,
    ) -> EngramResult<ThoughtContext> {
        let max_depth = depth.min(MAX_CONTEXT_DEPTH);
        let results = self
            .engine
            .search(topic, SearchType::Semantic, MAX_CONTEXT_MEMORIES, ci_id)
            .await?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut memories = Vec::new();
        let mut frontier = Vec::new();
        for result in results {
            if visited.insert(result.key.clone()) {
                let thought = Thought::from_search(result);
                frontier.push(thought.clone());
                memories.push(ContextMemory { hop: 0, thought });
            }
        }

        let mut dangling = Vec::new();
        let mut reached = 0;
        'levels: for hop in 1..=max_depth {
            let mut next = Vec::new();
            for parent in &frontier {
                let mut linked = self.associations_of(&parent.id);
                for id in &parent.associations {
                    if !linked.contains(id) {
                        linked.push(id.clone());
                    }
                }
                for id in linked {
                    if memories.len() >= MAX_CONTEXT_MEMORIES {
                        break 'levels;
                    }
                    if !visited.insert(id.clone()) {
                        continue;
                    }
                    match self.recall_thought(&id, ci_id).await {
                        Ok(thought) => {
                            reached = hop;
                            next.push(thought.clone());
                            memories.push(ContextMemory { hop, thought });
                        }
                        Err(EngramError::NotFound { .. }) => dangling.push(id),
                        Err(e) => return Err(e),
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        self.set_active(topic);
        info!(
            topic = %topic,
            memories = memories.len(),
            depth = reached,
            dangling = dangling.len(),
            "Context built"
        );
        Ok(ThoughtContext {
            topic: topic.to_string(),
            memories,
            dangling,
            depth: reached,
            timestamp: Utc::now(),
        })
    }

    /// Touch a memory so it counts towards promotion. False when the key is
    /// gone.
    pub async fn strengthen_memory(&self, key: &str, ci_id: Option<&str>) -> EngramResult<bool> {
        Ok(self.engine.retrieve(key, ci_id).await?.is_some())
    }

    /// Let memories idle for longer than `older_than` fade from the cache.
    ///
    /// Thoughts that were never made durable are gone afterwards, so their
    /// association chains go with them. Durable thoughts keep their links.
    pub fn forget_naturally(&self, older_than: Duration) -> usize {
        let removed = self.engine.forget_idle(older_than);
        let lost: Vec<&String> = removed
            .iter()
            .filter(|key| self.engine.location(key).is_none())
            .collect();
        for key in &lost {
            self.unlink(key);
        }
        if !removed.is_empty() {
            info!(removed = removed.len(), chains_dropped = lost.len(), "Memories faded");
        }
        removed.len()
    }

    /// Forget an active context that has outlived [`ACTIVE_CONTEXT_TTL`].
    /// True when one was cleared.
    pub fn clear_stale_context(&self) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let stale = active.as_ref().is_some_and(|current| {
            Utc::now()
                .signed_duration_since(current.built_at)
                .to_std()
                .is_ok_and(|age| age > ACTIVE_CONTEXT_TTL)
        });
        if stale {
            *active = None;
        }
        stale
    }

    // ========================================================================
    // METABOLISM
    // ========================================================================

    /// Start the background metabolism: every `interval` it runs
    /// [`forget_naturally`](Self::forget_naturally) with `idle_after` and
    /// clears a stale active context.
    ///
    /// The task only holds a weak reference and ends once the workflows are
    /// dropped. Returns false when metabolism is already running. Must be
    /// called from within a tokio runtime.
    pub fn start_metabolism(self: &Arc<Self>, interval: Duration, idle_after: Duration) -> bool {
        let mut slot = self.metabolism.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let workflows = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            metabolize(workflows, &mut shutdown_rx, interval, idle_after).await;
        });
        *slot = Some(Metabolism {
            shutdown_tx,
            handle,
        });
        info!(
            interval_ms = interval.as_millis() as u64,
            idle_after_ms = idle_after.as_millis() as u64,
            "Memory metabolism started"
        );
        true
    }

    /// Stop the metabolism task and wait for it to finish. Returns false when
    /// it was not running.
    pub async fn stop_metabolism(&self) -> bool {
        let running = self
            .metabolism
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Metabolism {
            shutdown_tx,
            handle,
        }) = running
        else {
            return false;
        };
        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Memory metabolism task ended abnormally");
        }
        info!("Memory metabolism stopped");
        true
    }

    pub fn metabolism_running(&self) -> bool {
        self.metabolism
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Delete a thought everywhere, along with its association links.
    pub async fn forget_thought(&self, id: &str) -> EngramResult<()> {
        self.engine.forget(id).await?;
        self.unlink(id);
        Ok(())
    }

    /// Ids linked to `id`, in stable order.
    pub fn associations_of(&self, id: &str) -> Vec<String> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|linked| linked.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_topic(&self) -> Option<String> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let current = active.as_ref()?;
        let age = Utc::now().signed_duration_since(current.built_at);
        match age.to_std() {
            Ok(age) if age > ACTIVE_CONTEXT_TTL => None,
            _ => Some(current.topic.clone()),
        }
    }

    pub fn memory_stats(&self) -> MemoryStats {
        let (thought_chains, total_associations) = {
            let chains = self.chains.read().unwrap_or_else(PoisonError::into_inner);
            (chains.len(), chains.values().map(BTreeSet::len).sum())
        };
        let engine = self.engine.get_statistics();
        MemoryStats {
            cache_entries: engine.cache_entries,
            thought_chains,
            total_associations,
            active_topic: self.active_topic(),
            engine,
        }
    }

    fn chain_count(&self) -> usize {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn link(&self, id: &str, associations: &[String]) {
        if associations.is_empty() {
            return;
        }
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        for other in associations.iter().filter(|other| other.as_str() != id) {
            chains
                .entry(id.to_string())
                .or_default()
                .insert(other.clone());
            chains
                .entry(other.clone())
                .or_default()
                .insert(id.to_string());
        }
    }

    fn unlink(&self, id: &str) {
        let mut chains = self.chains.write().unwrap_or_else(PoisonError::into_inner);
        let Some(linked) = chains.remove(id) else {
            return;
        };
        for other in linked {
            if let Some(back) = chains.get_mut(&other) {
                back.remove(id);
                if back.is_empty() {
                    chains.remove(&other);
                }
            }
        }
    }

    fn set_active(&self, topic: &str) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(ActiveContext {
            topic: topic.to_string(),
            built_at: Utc::now(),
        });
    }
}

async fn metabolize(
    workflows: Weak<CognitiveWorkflows>,
    shutdown_rx: &mut watch::Receiver<bool>,
    interval: Duration,
    idle_after: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let Some(workflows) = workflows.upgrade() else {
                    break;
                };
                let faded = workflows.forget_naturally(idle_after);
                let cleared = workflows.clear_stale_context();
                debug!(faded, cleared, "Metabolism cycle");
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

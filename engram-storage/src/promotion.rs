//! Promotion pipeline: moves hot cache entries into durable storage.
//!
//! Request handlers call [`PromotionPipeline::schedule`], which classifies the
//! entry and pushes a [`PromotionTask`] onto a bounded channel without
//! waiting. A single [`PromotionWorker`] drains the channel, writes each task
//! to its decided family with bounded exponential backoff, and either marks
//! the cache entry promoted or records a [`DeadLetter`].
//!
//! On shutdown the worker stops accepting, drains what is queued until the
//! shutdown deadline, and reports whatever it could not reach.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use engram_core::{
    new_task_id, BackendError, Content, EngramError, EngramResult, Metadata, PromotionError,
    RetryConfig, StorageFamily, TaskId, Timestamp,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{BackendRegistry, Namespace};
use crate::cache::{CacheEntry, CacheTier, PromotionPolicy};
use crate::decision::DecisionEngine;
use crate::stats::EngineMetrics;

/// Bookkeeping fields written next to caller metadata in durable records.
pub const CONTENT_TYPE_FIELD: &str = "content_type";
pub const CI_SOURCES_FIELD: &str = "ci_sources";
pub const ACCESS_COUNT_FIELD: &str = "access_count";
pub const PROMOTED_AT_FIELD: &str = "promoted_at";

/// Dead letters kept in memory; older ones are dropped (the counter keeps
/// the total).
pub const DEAD_LETTER_RETENTION: usize = 1_024;

/// A unit of promotion work. Consumed exactly once by the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionTask {
    pub task_id: TaskId,
    pub key: String,
    pub content: Content,
    pub content_type: String,
    pub metadata: Metadata,
    pub decided_family: StorageFamily,
    pub enqueued_at: Timestamp,
}

/// A promotion that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub task_id: TaskId,
    pub key: String,
    pub family: StorageFamily,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: Timestamp,
}

impl DeadLetter {
    pub fn to_error(&self) -> PromotionError {
        PromotionError::Failed {
            key: self.key.clone(),
            family: self.family,
            attempts: self.attempts,
            reason: self.last_error.clone(),
        }
    }
}

/// What `stop()` accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Tasks completed (promoted or dead-lettered) after shutdown began
    pub drained: u64,
    /// Tasks still queued when the deadline passed
    pub undrained: u64,
    /// Dead letters recorded over the engine lifetime
    pub dead_letters: u64,
}

/// Family each promoted key was written to.
#[derive(Debug, Default)]
pub struct LocationIndex {
    locations: RwLock<HashMap<String, StorageFamily>>,
}

impl LocationIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StorageFamily> {
        self.locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    pub fn insert(&self, key: &str, family: StorageFamily) {
        self.locations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), family);
    }

    pub fn remove(&self, key: &str) -> Option<StorageFamily> {
        self.locations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    pub fn len(&self) -> usize {
        self.locations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Failed promotions, most recent last.
#[derive(Debug, Default)]
pub struct DeadLetterLog {
    letters: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, letter: DeadLetter) {
        let mut letters = self.letters.lock().unwrap_or_else(PoisonError::into_inner);
        if letters.len() >= DEAD_LETTER_RETENTION {
            letters.pop_front();
        }
        letters.push_back(letter);
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

// ============================================================================
// PRODUCER
// ============================================================================

/// Producer side of the promotion queue.
#[derive(Debug)]
pub struct PromotionPipeline {
    decision: DecisionEngine,
    policy: PromotionPolicy,
    sender: mpsc::Sender<PromotionTask>,
    capacity: usize,
    accepting: AtomicBool,
}

impl PromotionPipeline {
    /// Build a pipeline and the receiving end its worker will consume.
    pub fn channel(
        decision: DecisionEngine,
        policy: PromotionPolicy,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<PromotionTask>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let pipeline = Self {
            decision,
            policy,
            sender,
            capacity,
            accepting: AtomicBool::new(true),
        };
        (pipeline, receiver)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn decision(&self) -> &DecisionEngine {
        &self.decision
    }

    /// Tasks currently waiting in the queue.
    pub fn queued(&self) -> usize {
        self.capacity - self.sender.capacity()
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Refuse further tasks. Already queued tasks are still drained.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Enqueue a promotion for `entry` without waiting.
    ///
    /// Returns `Ok(None)` when the entry is already durable or not eligible.
    /// The caller must hold the entry's promotion claim.
    pub fn schedule(&self, entry: &CacheEntry) -> EngramResult<Option<TaskId>> {
        if entry.promoted || !self.policy.is_eligible(entry) {
            return Ok(None);
        }
        if !self.is_accepting() {
            return Err(PromotionError::ShuttingDown.into());
        }

        let decision = self
            .decision
            .decide(&entry.content, &entry.content_type, &entry.metadata);
        let task = PromotionTask {
            task_id: new_task_id(),
            key: entry.key.clone(),
            content: decision.content,
            content_type: decision.content_type,
            metadata: decision.metadata,
            decided_family: decision.family,
            enqueued_at: Utc::now(),
        };
        let task_id = task.task_id;

        match self.sender.try_send(task) {
            Ok(()) => {
                debug!(
                    key = %entry.key,
                    family = %decision.family,
                    reason = ?decision.reason,
                    task_id = %task_id,
                    "Promotion scheduled"
                );
                Ok(Some(task_id))
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(PromotionError::QueueFull {
                capacity: self.capacity,
            }
            .into()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PromotionError::ShuttingDown.into()),
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// Shared state the worker writes through.
#[derive(Debug, Clone)]
pub struct PromotionTargets {
    pub cache: Arc<CacheTier>,
    pub registry: Arc<BackendRegistry>,
    pub namespace: Namespace,
    pub locations: Arc<LocationIndex>,
    pub dead_letters: Arc<DeadLetterLog>,
    pub metrics: Arc<EngineMetrics>,
}

enum Outcome {
    Promoted,
    DeadLettered,
    Skipped,
}

/// Consumer side of the promotion queue.
pub struct PromotionWorker {
    receiver: mpsc::Receiver<PromotionTask>,
    shutdown_rx: watch::Receiver<bool>,
    targets: PromotionTargets,
    retry: RetryConfig,
    write_timeout: Duration,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for PromotionWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionWorker")
            .field("retry", &self.retry)
            .field("write_timeout", &self.write_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl PromotionWorker {
    pub fn new(
        receiver: mpsc::Receiver<PromotionTask>,
        shutdown_rx: watch::Receiver<bool>,
        targets: PromotionTargets,
        retry: RetryConfig,
        write_timeout: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            receiver,
            shutdown_rx,
            targets,
            retry,
            write_timeout,
            shutdown_timeout,
        }
    }

    /// Consume tasks until shutdown is signalled, then drain up to the
    /// shutdown deadline.
    pub async fn run(mut self) -> ShutdownReport {
        info!(
            max_attempts = self.retry.max_attempts,
            shutdown_timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "Promotion worker started"
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }

                task = self.receiver.recv() => match task {
                    Some(task) => {
                        self.process(task).await;
                    }
                    None => break,
                }
            }
        }

        let report = self.drain().await;
        info!(
            drained = report.drained,
            undrained = report.undrained,
            dead_letters = report.dead_letters,
            "Promotion worker stopped"
        );
        report
    }

    async fn drain(&mut self) -> ShutdownReport {
        self.receiver.close();
        let deadline = Instant::now() + self.shutdown_timeout;
        let mut report = ShutdownReport::default();

        loop {
            let task = match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(task)) => task,
                Ok(None) | Err(_) => break,
            };
            let key = task.key.clone();
            match tokio::time::timeout_at(deadline, self.process(task)).await {
                Ok(_) => report.drained += 1,
                Err(_) => {
                    warn!(key = %key, "Shutdown deadline reached during promotion");
                    self.targets.cache.release_claim(&key);
                    report.undrained += 1;
                    break;
                }
            }
        }

        while let Ok(task) = self.receiver.try_recv() {
            self.targets.cache.release_claim(&task.key);
            report.undrained += 1;
        }
        if report.undrained > 0 {
            warn!(undrained = report.undrained, "Promotion tasks left undrained at shutdown");
        }

        report.dead_letters = self.targets.metrics.dead_letters.load(Ordering::Relaxed);
        report
    }

    async fn process(&self, task: PromotionTask) -> Outcome {
        let targets = &self.targets;

        // Forgotten while queued.
        let Some(entry) = targets.cache.peek(&task.key) else {
            debug!(key = %task.key, "Promotion skipped, entry no longer cached");
            return Outcome::Skipped;
        };
        if entry.promoted {
            return Outcome::Skipped;
        }

        let record_metadata = durable_metadata(&task, &entry);
        let scoped = targets.namespace.scope(&task.key);
        let family = task.decided_family;
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            match self.write(family, &scoped, &task.content, &record_metadata).await {
                Ok(()) => {
                    targets.locations.insert(&task.key, family);
                    if targets.cache.mark_promoted(&task.key) {
                        EngineMetrics::incr(&targets.metrics.promotions);
                        info!(key = %task.key, family = %family, attempt, "Entry promoted");
                    }
                    return Outcome::Promoted;
                }
                Err(e) => {
                    EngineMetrics::incr(&targets.metrics.errors);
                    last_error = e.to_string();
                    if attempt < self.retry.max_attempts {
                        let backoff = self.retry.backoff_for(attempt);
                        warn!(
                            key = %task.key,
                            family = %family,
                            attempt,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Promotion write failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let letter = DeadLetter {
            task_id: task.task_id,
            key: task.key.clone(),
            family,
            attempts: self.retry.max_attempts,
            last_error,
            failed_at: Utc::now(),
        };
        error!(
            key = %letter.key,
            family = %family,
            attempts = letter.attempts,
            error = %letter.last_error,
            "Promotion dead-lettered"
        );
        targets.dead_letters.record(letter);
        EngineMetrics::incr(&targets.metrics.dead_letters);
        targets.cache.release_claim(&task.key);
        Outcome::DeadLettered
    }

    async fn write(
        &self,
        family: StorageFamily,
        scoped_key: &str,
        content: &Content,
        metadata: &Metadata,
    ) -> EngramResult<()> {
        let backend = self
            .targets
            .registry
            .get(family)
            .ok_or(BackendError::NotEnabled { family })?;
        match tokio::time::timeout(self.write_timeout, backend.store(scoped_key, content, metadata))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(EngramError::Backend(BackendError::Timeout {
                family,
                after: self.write_timeout,
            })),
        }
    }
}

/// Caller metadata plus the fields needed to rebuild a cache entry on read-back.
fn durable_metadata(task: &PromotionTask, entry: &CacheEntry) -> Metadata {
    let mut metadata = task.metadata.clone();
    metadata.insert(
        CONTENT_TYPE_FIELD.to_string(),
        Value::String(task.content_type.clone()),
    );
    metadata.insert(CI_SOURCES_FIELD.to_string(), json!(entry.ci_sources));
    metadata.insert(ACCESS_COUNT_FIELD.to_string(), json!(entry.access_count));
    metadata.insert(
        PROMOTED_AT_FIELD.to_string(),
        Value::String(Utc::now().to_rfc3339()),
    );
    metadata
}

/// Strip the bookkeeping fields from a durable record's metadata.
pub fn caller_metadata(mut metadata: Metadata) -> (Option<String>, Metadata) {
    let content_type = match metadata.remove(CONTENT_TYPE_FIELD) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    metadata.remove(CI_SOURCES_FIELD);
    metadata.remove(ACCESS_COUNT_FIELD);
    metadata.remove(PROMOTED_AT_FIELD);
    (content_type, metadata)
}

//! Shared helpers for the integration tests
//!
//! Test doubles for the embedder and the mirror, plus builders for an
//! engine over in-memory SQLite stores.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use whisper_sync::config::SyncSettings;
use whisper_sync::graph::relationship;
use whisper_sync::{
    BatchOutcome, Embedder, EmbeddingError, MirrorBatch, MirrorEdge, MirrorNode, MirrorStore,
    NodeRef, OpenStore, Partition, PrimaryStore, RetryPolicy, SqliteGraphStore,
    SqliteWhisperStore, StorageError, StorageResult, SyncEngine, WhisperId,
};

/// Fixed-vector embedder that counts calls and records inputs.
#[derive(Default)]
pub struct CountingEmbedder {
    calls: AtomicUsize,
    inputs: std::sync::Mutex<Vec<String>>,
}

impl CountingEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Embedder for CountingEmbedder {
    fn model_name(&self) -> &str {
        "counting"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().push(text.to_string());
        Ok(vec![0.1, 0.2, 0.3])
    }
}

/// Embedder that always fails.
pub struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::ModelError("model offline".into()))
    }
}

/// Mirror wrapper that can fail writes, delay them, or hold them back.
pub struct FlakyMirror {
    inner: SqliteGraphStore,
    /// Number of upcoming executes that fail
    failures: AtomicU32,
    /// Fail every execute while set
    down: AtomicBool,
    /// Sleep before each execute
    delay_ms: AtomicU32,
    executes: AtomicUsize,
}

impl FlakyMirror {
    pub fn new() -> Self {
        Self {
            inner: SqliteGraphStore::open_in_memory().unwrap(),
            failures: AtomicU32::new(0),
            down: AtomicBool::new(false),
            delay_ms: AtomicU32::new(0),
            executes: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    /// Execute directly against the backing store, bypassing fault
    /// injection.
    pub async fn execute_direct(&self, batch: MirrorBatch) -> StorageResult<BatchOutcome> {
        self.inner.execute(batch).await
    }
}

#[async_trait]
impl MirrorStore for FlakyMirror {
    fn partition(&self) -> &Partition {
        self.inner.partition()
    }

    async fn execute(&self, batch: MirrorBatch) -> StorageResult<BatchOutcome> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::from(delay))).await;
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("mirror down".into()));
        }
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StorageError::Unavailable("transient mirror failure".into()));
        }
        self.inner.execute(batch).await
    }

    async fn load_node(&self, node: &NodeRef) -> StorageResult<Option<MirrorNode>> {
        self.inner.load_node(node).await
    }

    async fn edges_from(
        &self,
        node: &NodeRef,
        relationship: Option<&str>,
    ) -> StorageResult<Vec<MirrorEdge>> {
        self.inner.edges_from(node, relationship).await
    }

    async fn edges_to(
        &self,
        node: &NodeRef,
        relationship: Option<&str>,
    ) -> StorageResult<Vec<MirrorEdge>> {
        self.inner.edges_to(node, relationship).await
    }
}

/// Settings with fast retries for tests.
pub fn test_settings(max_attempts: u32) -> SyncSettings {
    let mut settings = SyncSettings::default();
    settings.mirror.workers = 4;
    settings.mirror.queue_capacity = 64;
    settings.mirror.retry = RetryPolicy::default()
        .with_max_attempts(max_attempts)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(10));
    settings
}

pub struct Harness {
    pub engine: SyncEngine,
    pub primary: Arc<SqliteWhisperStore>,
    pub mirror: Arc<FlakyMirror>,
    pub embedder: Arc<CountingEmbedder>,
}

pub async fn harness() -> Harness {
    harness_with(test_settings(5)).await
}

pub async fn harness_with(settings: SyncSettings) -> Harness {
    let primary = Arc::new(SqliteWhisperStore::open_in_memory().unwrap());
    primary.ensure_indexes().await.unwrap();
    let mirror = Arc::new(FlakyMirror::new());
    let embedder = Arc::new(CountingEmbedder::default());
    let engine = SyncEngine::new(
        primary.clone(),
        mirror.clone(),
        embedder.clone(),
        settings,
    );
    Harness {
        engine,
        primary,
        mirror,
        embedder,
    }
}

/// Tag keys the mirror links to the whisper, sorted.
pub async fn mirror_tags(mirror: &dyn MirrorStore, id: &WhisperId) -> Vec<String> {
    let mut tags: Vec<String> = mirror
        .edges_from(&NodeRef::whisper(id.as_str()), Some(relationship::TAGGED))
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.to.key)
        .collect();
    tags.sort();
    tags
}

pub fn tag_set(tags: &[&str]) -> BTreeSet<String> {
    tags.iter().map(|t| t.to_string()).collect()
}

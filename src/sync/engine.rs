//! SyncEngine: the write path across both stores
//!
//! Every write goes to the primary store first and must succeed there.
//! Mirror propagation is queued afterwards and never awaited by the caller.
//! The primary write and its hand-off to the queue run as one spawned task,
//! so a caller that stops waiting cannot commit a write without its job.

use super::error::{SyncError, SyncResult};
use super::propagation::{property, MirrorJob};
use super::worker::{AbandonedJob, PropagationQueue, PropagationStats};
use crate::config::{Config, SyncSettings};
use crate::embedding::{truncate_chars, Embedder, EmbeddingError};
use crate::graph::{relationship, MirrorNode, NodeRef};
use crate::model::{
    ValidationError, Whisper, WhisperDraft, WhisperFilter, WhisperId, WhisperPatch,
};
use crate::storage::{
    MirrorStore, OpenStore, PrimaryStore, SqliteGraphStore, SqliteWhisperStore, StorageError,
    StorageResult,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

/// What the mirror currently holds for one whisper.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MirrorView {
    pub node: MirrorNode,
    /// Targets of TAGGED edges, sorted
    pub tags: Vec<String>,
    /// Target of the CREATED_IN edge
    pub year: Option<i32>,
}

impl MirrorView {
    pub fn source_path(&self) -> Option<&str> {
        self.node
            .property(property::SOURCE_PATH)
            .and_then(|v| v.as_str())
    }

    pub fn text_prefix(&self) -> Option<&str> {
        self.node
            .property(property::TEXT_PREFIX)
            .and_then(|v| v.as_str())
    }

    pub fn embedding(&self) -> Option<Vec<f32>> {
        self.node
            .property(property::EMBEDDING)
            .and_then(|v| v.as_vector())
    }

    /// Revision of the last full sync applied, 0 if none.
    pub fn revision(&self) -> i64 {
        self.node.int_or_zero(property::REVISION)
    }

    /// Revision of the last tag resync applied, 0 if none.
    pub fn tags_revision(&self) -> i64 {
        self.node.int_or_zero(property::TAGS_REVISION)
    }
}

/// Run a primary write and its queue hand-off to completion even if the
/// awaiting caller is dropped.
async fn detached<T, F>(write: F) -> SyncResult<T>
where
    F: Future<Output = StorageResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(write)
        .await
        .map_err(StorageError::from)
        .and_then(|result| result)
        .map_err(SyncError::PrimaryStore)
}

/// Dual-store synchronization engine
pub struct SyncEngine {
    primary: Arc<dyn PrimaryStore>,
    mirror: Arc<dyn MirrorStore>,
    embedder: Arc<dyn Embedder>,
    queue: Arc<PropagationQueue>,
    settings: SyncSettings,
}

impl SyncEngine {
    /// Open the SQLite stores named by `config`, declare primary indexes,
    /// and start the propagation workers.
    pub async fn connect(config: &Config, embedder: Arc<dyn Embedder>) -> SyncResult<Self> {
        let primary_path = config.storage.primary_db_path();
        let mirror_path = config.storage.mirror_db_path();

        let primary = SqliteWhisperStore::open(&primary_path).map_err(SyncError::PrimaryStore)?;
        let mirror = SqliteGraphStore::open(&mirror_path)
            .map_err(SyncError::MirrorStore)?
            .with_partition(config.storage.partition());

        let engine = Self::new(
            Arc::new(primary),
            Arc::new(mirror),
            embedder,
            SyncSettings::from(config),
        );
        engine
            .primary
            .ensure_indexes()
            .await
            .map_err(SyncError::PrimaryStore)?;

        info!(
            primary = %primary_path.display(),
            mirror = %mirror_path.display(),
            partition = %config.storage.partition,
            model = engine.embedder.model_name(),
            "sync engine connected"
        );
        Ok(engine)
    }

    /// Build an engine over existing stores. Must be called inside a tokio
    /// runtime. Does not call `ensure_indexes`.
    pub fn new(
        primary: Arc<dyn PrimaryStore>,
        mirror: Arc<dyn MirrorStore>,
        embedder: Arc<dyn Embedder>,
        settings: SyncSettings,
    ) -> Self {
        let queue = Arc::new(PropagationQueue::start(Arc::clone(&mirror), &settings.mirror));
        Self {
            primary,
            mirror,
            embedder,
            queue,
            settings,
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    async fn embed(&self, text: &str) -> SyncResult<Vec<f32>> {
        let input = truncate_chars(text, self.settings.embedding.max_input_chars);
        let timeout = self.settings.embedding.timeout;

        let vector = tokio::time::timeout(timeout, self.embedder.embed(input))
            .await
            .map_err(|_| {
                EmbeddingError::Timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX))
            })??;
        if vector.is_empty() {
            return Err(EmbeddingError::EmptyResult.into());
        }
        Ok(vector)
    }

    /// Insert or replace the whisper at `draft.source_path`.
    ///
    /// Computes an embedding if the draft has none. Returns the record as
    /// stored; the mirror catches up in the background.
    pub async fn upsert(&self, draft: WhisperDraft) -> SyncResult<Whisper> {
        draft.validate()?;

        let mut draft = draft;
        draft.tags = draft.normalized_tags().into_iter().collect();
        if draft.embedding.is_none() {
            debug!(
                source_path = %draft.source_path,
                model = self.embedder.model_name(),
                "embedding whisper"
            );
            draft.embedding = Some(self.embed(&draft.raw_text).await?);
        }

        let primary = Arc::clone(&self.primary);
        let queue = Arc::clone(&self.queue);
        let prefix_chars = self.settings.mirror.text_prefix_chars;
        let outcome = detached(async move {
            let outcome = primary.upsert_by_source_path(&draft).await?;
            let whisper = &outcome.whisper;
            debug!(
                whisper_id = %whisper.id,
                revision = whisper.revision,
                inserted = outcome.inserted(),
                "primary upsert"
            );

            queue.submit(MirrorJob::full_sync(whisper, prefix_chars)).await;
            // Full sync only adds edges; removed tags need a resync
            if outcome.tags_changed() {
                queue.submit(MirrorJob::tag_resync(whisper)).await;
            }
            Ok::<_, StorageError>(outcome)
        })
        .await?;

        Ok(outcome.whisper)
    }

    /// Patch fields of an existing whisper. `Ok(None)` if the id is unknown.
    pub async fn update(&self, id: &str, patch: WhisperPatch) -> SyncResult<Option<Whisper>> {
        let id = WhisperId::parse(id)?;
        patch.validate()?;
        if patch.is_empty() {
            return self.find_by_id(&id).await;
        }

        let patch = patch.normalized();
        let primary = Arc::clone(&self.primary);
        let queue = Arc::clone(&self.queue);
        detached(async move {
            let updated = primary.update_fields(&id, &patch).await?;
            if let Some(whisper) = &updated {
                debug!(whisper_id = %whisper.id, revision = whisper.revision, "primary update");
                if patch.touches_tags() {
                    queue.submit(MirrorJob::tag_resync(whisper)).await;
                }
            }
            Ok::<_, StorageError>(updated)
        })
        .await
    }

    /// Delete from the primary store and queue the mirror delete. Returns
    /// whether the primary record existed.
    pub async fn delete(&self, id: &str) -> SyncResult<bool> {
        let id = WhisperId::parse(id)?;
        let primary = Arc::clone(&self.primary);
        let queue = Arc::clone(&self.queue);
        detached(async move {
            let existed = primary.delete(&id).await?;
            debug!(whisper_id = %id, existed, "primary delete");

            queue.submit(MirrorJob::delete(id)).await;
            Ok::<_, StorageError>(existed)
        })
        .await
    }

    /// Full-text search, most relevant first.
    pub async fn search_text(&self, query: &str, limit: usize) -> SyncResult<Vec<Whisper>> {
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.primary
            .search_text(query, limit)
            .await
            .map_err(SyncError::PrimaryStore)
    }

    pub async fn get(&self, id: &str) -> SyncResult<Option<Whisper>> {
        let id = WhisperId::parse(id)?;
        self.find_by_id(&id).await
    }

    async fn find_by_id(&self, id: &WhisperId) -> SyncResult<Option<Whisper>> {
        self.primary
            .find_by_id(id)
            .await
            .map_err(SyncError::PrimaryStore)
    }

    pub async fn get_by_source_path(&self, source_path: &str) -> SyncResult<Option<Whisper>> {
        if source_path.trim().is_empty() {
            return Err(ValidationError::EmptySourcePath.into());
        }
        self.primary
            .find_by_source_path(source_path)
            .await
            .map_err(SyncError::PrimaryStore)
    }

    /// Whispers matching `filter`, newest first.
    pub async fn find(&self, filter: &WhisperFilter) -> SyncResult<Vec<Whisper>> {
        self.primary
            .find(filter)
            .await
            .map_err(SyncError::PrimaryStore)
    }

    /// Read the mirror's node for `id` with its tag and year edges.
    pub async fn mirror_view(&self, id: &str) -> SyncResult<Option<MirrorView>> {
        let id = WhisperId::parse(id)?;
        let node_ref = NodeRef::whisper(id.as_str());

        let Some(node) = self
            .mirror
            .load_node(&node_ref)
            .await
            .map_err(SyncError::MirrorStore)?
        else {
            return Ok(None);
        };

        let mut tags: Vec<String> = self
            .mirror
            .edges_from(&node_ref, Some(relationship::TAGGED))
            .await
            .map_err(SyncError::MirrorStore)?
            .into_iter()
            .map(|edge| edge.to.key)
            .collect();
        tags.sort();

        let year = self
            .mirror
            .edges_from(&node_ref, Some(relationship::CREATED_IN))
            .await
            .map_err(SyncError::MirrorStore)?
            .first()
            .and_then(|edge| edge.to.key.parse().ok());

        Ok(Some(MirrorView { node, tags, year }))
    }

    /// Wait for all queued propagation to finish.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }

    /// Drain and stop the workers. Later writes still reach the primary
    /// store but their mirror jobs are dropped.
    pub async fn shutdown(&self) -> PropagationStats {
        self.queue.shutdown().await
    }

    pub fn stats(&self) -> PropagationStats {
        self.queue.stats()
    }

    pub fn abandoned(&self) -> Vec<AbandonedJob> {
        self.queue.abandoned()
    }

    /// Resubmit abandoned jobs, e.g. after the mirror is reachable again.
    pub async fn requeue_abandoned(&self) -> usize {
        self.queue.requeue_abandoned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use async_trait::async_trait;
    use std::time::Duration;

    fn engine_with(embedder: Arc<dyn Embedder>, settings: SyncSettings) -> SyncEngine {
        let primary = SqliteWhisperStore::open_in_memory().unwrap();
        let mirror = SqliteGraphStore::open_in_memory().unwrap();
        SyncEngine::new(Arc::new(primary), Arc::new(mirror), embedder, settings)
    }

    async fn engine() -> SyncEngine {
        let engine = engine_with(Arc::new(HashingEmbedder::default()), SyncSettings::default());
        engine.primary.ensure_indexes().await.unwrap();
        engine
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![1.0])
        }
    }

    struct EmptyEmbedder;

    #[async_trait]
    impl Embedder for EmptyEmbedder {
        fn model_name(&self) -> &str {
            "empty"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn upsert_embeds_and_normalizes() {
        let engine = engine().await;
        let w = engine
            .upsert(WhisperDraft::new("/a.md", "hello").with_tags(["B", "b", " A"]))
            .await
            .unwrap();
        assert_eq!(w.tag_list(), vec!["a", "b"]);
        assert_eq!(w.embedding.as_ref().map(Vec::len), Some(384));
    }

    #[tokio::test]
    async fn upsert_accepts_symbol_only_text() {
        let engine = engine().await;
        let w = engine
            .upsert(WhisperDraft::new("/e.md", "🙂 !!!"))
            .await
            .unwrap();
        assert_eq!(w.raw_text, "🙂 !!!");
        assert_eq!(w.embedding.as_ref().map(Vec::len), Some(384));
    }

    #[tokio::test]
    async fn validation_happens_before_any_write() {
        let engine = engine().await;
        let err = engine
            .upsert(WhisperDraft::new("/a.md", "  "))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::EmptyText)));
        assert!(engine.get_by_source_path("/a.md").await.unwrap().is_none());

        let err = engine.get("nope").await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::MalformedId(_))));

        let err = engine.search_text("   ", 5).await.unwrap_err();
        assert!(matches!(err, SyncError::Validation(ValidationError::EmptyQuery)));
    }

    #[tokio::test]
    async fn embedder_timeout_writes_nothing() {
        let mut settings = SyncSettings::default();
        settings.embedding.timeout = Duration::from_millis(20);
        let engine = engine_with(Arc::new(SlowEmbedder), settings);

        let err = engine
            .upsert(WhisperDraft::new("/slow.md", "text"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Embedding(EmbeddingError::Timeout(20))));
        assert!(engine.get_by_source_path("/slow.md").await.unwrap().is_none());
        assert_eq!(engine.stats().submitted, 0);
    }

    #[tokio::test]
    async fn empty_embedding_is_a_failure() {
        let engine = engine_with(Arc::new(EmptyEmbedder), SyncSettings::default());
        let err = engine
            .upsert(WhisperDraft::new("/e.md", "text"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Embedding(EmbeddingError::EmptyResult)));
    }

    #[tokio::test]
    async fn search_with_zero_limit_is_empty() {
        let engine = engine().await;
        engine
            .upsert(WhisperDraft::new("/a.md", "searchable words"))
            .await
            .unwrap();
        assert!(engine.search_text("searchable", 0).await.unwrap().is_empty());
        assert_eq!(engine.search_text("searchable", 3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mirror_view_reflects_drained_state() {
        let engine = engine().await;
        let w = engine
            .upsert(WhisperDraft::new("/a.md", "hello mirror").with_tags(["x", "y"]))
            .await
            .unwrap();
        engine.drain().await;

        let view = engine.mirror_view(w.id.as_str()).await.unwrap().unwrap();
        assert_eq!(view.tags, vec!["x", "y"]);
        assert_eq!(view.source_path(), Some("/a.md"));
        assert_eq!(view.text_prefix(), Some("hello mirror"));
        assert_eq!(view.revision(), 1);
        assert_eq!(view.year, Some(chrono::Datelike::year(&w.created_at)));
        assert!(view.embedding().is_some());

        assert!(engine
            .mirror_view(WhisperId::mint().as_str())
            .await
            .unwrap()
            .is_none());
    }
}

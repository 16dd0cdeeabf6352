//! Storage trait definitions

use crate::graph::{BatchOutcome, MirrorBatch, MirrorEdge, MirrorNode, NodeRef, Partition};
use crate::model::{Whisper, WhisperDraft, WhisperFilter, WhisperId, WhisperPatch};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(String),

    #[error("Connection lock poisoned")]
    LockPoisoned,

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::Task(e.to_string())
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// What an upsert-by-source-path did.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// The record as read back after the write
    pub whisper: Whisper,
    /// Tags the record carried before this write; `None` when it was inserted
    pub previous_tags: Option<BTreeSet<String>>,
}

impl UpsertOutcome {
    pub fn inserted(&self) -> bool {
        self.previous_tags.is_none()
    }

    /// True if an existing record's tag set was replaced by a different one.
    pub fn tags_changed(&self) -> bool {
        matches!(&self.previous_tags, Some(prev) if *prev != self.whisper.tags)
    }
}

/// The authoritative document store.
///
/// Every method is a single atomic operation from the caller's point of
/// view. Implementations must be `Send + Sync`; the engine shares one
/// instance across all in-flight operations.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    /// Declare indexes on creation time, tags, and text. Safe to call
    /// repeatedly.
    async fn ensure_indexes(&self) -> StorageResult<()>;

    /// Insert a new record for `draft.source_path`, or replace the content
    /// fields of the existing one while keeping its id and created_at.
    ///
    /// The draft must already be validated, carry normalized tags, and
    /// have an embedding.
    async fn upsert_by_source_path(&self, draft: &WhisperDraft) -> StorageResult<UpsertOutcome>;

    /// Point lookup by key.
    async fn find_by_id(&self, id: &WhisperId) -> StorageResult<Option<Whisper>>;

    /// Lookup by the unique source path.
    async fn find_by_source_path(&self, source_path: &str) -> StorageResult<Option<Whisper>>;

    /// Records matching the filter, newest first.
    async fn find(&self, filter: &WhisperFilter) -> StorageResult<Vec<Whisper>>;

    /// Full-text search ordered by relevance.
    async fn search_text(&self, query: &str, limit: usize) -> StorageResult<Vec<Whisper>>;

    /// Apply a field patch. Returns the updated record, or `None` if no
    /// record has this id. Tags in the patch must already be normalized.
    async fn update_fields(
        &self,
        id: &WhisperId,
        patch: &WhisperPatch,
    ) -> StorageResult<Option<Whisper>>;

    /// Delete by key. Returns whether a record was removed.
    async fn delete(&self, id: &WhisperId) -> StorageResult<bool>;
}

/// The derived relationship mirror.
///
/// Writes go through [`MirrorStore::execute`], which applies a whole batch
/// atomically or not at all. Node keys removed with a detach-delete are
/// tombstoned: later batches merging them come back as
/// [`BatchOutcome::Stale`].
#[async_trait]
pub trait MirrorStore: Send + Sync {
    /// The logical partition this store reads and writes.
    fn partition(&self) -> &Partition;

    /// Execute a batch atomically.
    async fn execute(&self, batch: MirrorBatch) -> StorageResult<BatchOutcome>;

    /// Load a node by label and key.
    async fn load_node(&self, node: &NodeRef) -> StorageResult<Option<MirrorNode>>;

    /// Edges leaving `node`, optionally restricted to one relationship.
    async fn edges_from(
        &self,
        node: &NodeRef,
        relationship: Option<&str>,
    ) -> StorageResult<Vec<MirrorEdge>>;

    /// Edges arriving at `node`, optionally restricted to one relationship.
    async fn edges_to(
        &self,
        node: &NodeRef,
        relationship: Option<&str>,
    ) -> StorageResult<Vec<MirrorEdge>>;
}

/// Extension trait for opening stores from paths
pub trait OpenStore: Sized {
    /// Open or create a store at the given path
    fn open(path: impl AsRef<Path>) -> StorageResult<Self>;

    /// Create an in-memory store (useful for testing)
    fn open_in_memory() -> StorageResult<Self>;
}

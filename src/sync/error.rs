//! Error types for the synchronization engine

use crate::embedding::EmbeddingError;
use crate::model::ValidationError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced to callers of [`SyncEngine`](super::SyncEngine).
///
/// Background mirror failures never appear here; they are retried, then
/// logged and recorded as abandoned.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("primary store failed: {0}")]
    PrimaryStore(#[source] StorageError),

    #[error("mirror store failed: {0}")]
    MirrorStore(#[source] StorageError),
}

/// Result type for engine operations
pub type SyncResult<T> = Result<T, SyncError>;

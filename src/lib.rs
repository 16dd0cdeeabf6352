//! whisper-sync: dual-store persistence for short text whispers
//!
//! Whispers are stored in an authoritative primary store (full text,
//! tags, embedding) and projected into a graph mirror (whisper, tag, and
//! year nodes). Writes succeed once the primary store confirms them; the
//! mirror is updated by background workers and converges to the primary.
//!
//! # Core Concepts
//!
//! - **Primary store**: source of truth, queried for reads and text search
//! - **Mirror**: derived graph, may lag but never shows a write the primary
//!   did not make
//! - **Revision**: per-record write counter that lets the mirror discard
//!   out-of-order propagation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use whisper_sync::{Config, HashingEmbedder, SyncEngine, WhisperDraft};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load(None)?;
//! let embedder = Arc::new(HashingEmbedder::new(config.embedding.dimensions));
//! let engine = SyncEngine::connect(&config, embedder).await?;
//!
//! let whisper = engine
//!     .upsert(WhisperDraft::new("/notes/a.md", "hello").with_tags(["Greeting"]))
//!     .await?;
//! assert_eq!(whisper.tag_list(), vec!["greeting"]);
//!
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod embedding;
pub mod graph;
pub mod ingest;
pub mod model;
pub mod storage;
pub mod sync;

pub use config::{Config, ConfigError, SyncSettings};
pub use embedding::{Embedder, EmbeddingError, HashingEmbedder};
#[cfg(feature = "embeddings")]
pub use embedding::FastEmbedEmbedder;
pub use graph::{BatchOutcome, MirrorBatch, MirrorEdge, MirrorNode, NodeRef, Partition, PropertyValue};
pub use model::{
    normalize_tags, ValidationError, Whisper, WhisperDraft, WhisperFilter, WhisperId, WhisperPatch,
};
pub use storage::{
    MirrorStore, OpenStore, PrimaryStore, SqliteGraphStore, SqliteWhisperStore, StorageError,
    StorageResult, UpsertOutcome,
};
pub use sync::{
    AbandonedJob, MirrorJob, MirrorView, PropagationStats, RetryPolicy, SyncEngine, SyncError,
    SyncResult,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

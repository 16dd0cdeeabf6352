//! Storage backends
//!
//! Two capability traits sit at this seam: `PrimaryStore` for the
//! authoritative whisper documents and `MirrorStore` for the derived tag
//! graph. Both ship with a SQLite implementation.

mod documents;
mod sqlite;
mod traits;

pub use documents::SqliteWhisperStore;
pub use sqlite::SqliteGraphStore;
pub(crate) use sqlite::timestamp_to_text;
pub use traits::{MirrorStore, OpenStore, PrimaryStore, StorageError, StorageResult, UpsertOutcome};

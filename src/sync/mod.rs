//! Synchronization between the primary store and the mirror

mod engine;
mod error;
pub mod propagation;
pub mod retry;
mod worker;

pub use engine::{MirrorView, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use propagation::{MirrorJob, MirrorSnapshot};
pub use retry::RetryPolicy;
pub use worker::{AbandonedJob, PropagationQueue, PropagationStats};

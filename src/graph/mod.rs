//! Relationship mirror data structures

mod batch;
mod edge;
mod node;
mod partition;

pub use batch::{revision_to_i64, BatchOutcome, Guard, GuardCheck, MirrorBatch, MirrorOp};
pub use edge::{relationship, MirrorEdge};
pub use node::{label, MirrorNode, NodeRef, Properties, PropertyValue};
pub use partition::Partition;

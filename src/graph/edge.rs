//! Edge representation in the relationship mirror

use super::node::NodeRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known relationship types
pub mod relationship {
    /// Whisper -> Tag
    pub const TAGGED: &str = "TAGGED";
    /// Whisper -> Year
    pub const CREATED_IN: &str = "CREATED_IN";
}

/// A directed edge between two mirror nodes.
///
/// Edges carry no identity of their own: at most one edge exists per
/// (from, relationship, to) triple, so merging is create-if-absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorEdge {
    pub from: NodeRef,
    pub relationship: String,
    pub to: NodeRef,
    /// When the edge was first merged
    pub created_at: DateTime<Utc>,
}

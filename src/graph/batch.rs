//! Mirror batches: the unit of atomic work against a mirror store
//!
//! A batch is a list of graph operations plus an optional revision guard.
//! The store either applies every operation or none: if the guard rejects
//! the stored state, or any node the batch merges has been tombstoned, the
//! batch is skipped and reported as [`BatchOutcome::Stale`].

use super::node::{NodeRef, Properties, PropertyValue};

/// Comparison a guard applies to the stored integer property.
///
/// A missing property counts as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardCheck {
    /// stored <= value
    AtMost(i64),
    /// stored < value
    Below(i64),
}

/// Precondition on an integer property of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    pub node: NodeRef,
    pub property: String,
    pub check: GuardCheck,
}

impl Guard {
    /// Passes unless the node already holds a newer value.
    pub fn not_newer_than(node: NodeRef, property: impl Into<String>, revision: u64) -> Self {
        Self {
            node,
            property: property.into(),
            check: GuardCheck::AtMost(revision_to_i64(revision)),
        }
    }

    /// Passes only if the node holds an older value.
    pub fn older_than(node: NodeRef, property: impl Into<String>, revision: u64) -> Self {
        Self {
            node,
            property: property.into(),
            check: GuardCheck::Below(revision_to_i64(revision)),
        }
    }

    pub fn admits(&self, stored: i64) -> bool {
        match self.check {
            GuardCheck::AtMost(value) => stored <= value,
            GuardCheck::Below(value) => stored < value,
        }
    }
}

/// Revisions are stored as SQLite integers.
pub fn revision_to_i64(revision: u64) -> i64 {
    i64::try_from(revision).unwrap_or(i64::MAX)
}

/// A single graph operation.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorOp {
    /// Create the node if absent, then overwrite the listed properties.
    /// Properties not listed are left as they are.
    MergeNode { node: NodeRef, set: Properties },
    /// Create the edge if absent. Both endpoints must exist.
    MergeEdge {
        from: NodeRef,
        relationship: String,
        to: NodeRef,
    },
    /// Delete every edge of this relationship leaving `from`.
    DeleteEdges { from: NodeRef, relationship: String },
    /// Delete the node with all incident edges and tombstone its key.
    DetachDelete { node: NodeRef },
}

/// Result of executing a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Applied,
    /// Guard rejected, or a merged node was tombstoned. Nothing changed.
    Stale,
}

/// Ordered operations executed in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MirrorBatch {
    pub guard: Option<Guard>,
    pub ops: Vec<MirrorOp>,
}

impl MirrorBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn merge_node(mut self, node: NodeRef) -> Self {
        self.ops.push(MirrorOp::MergeNode {
            node,
            set: Properties::new(),
        });
        self
    }

    pub fn merge_node_with<I, K>(mut self, node: NodeRef, set: I) -> Self
    where
        I: IntoIterator<Item = (K, PropertyValue)>,
        K: Into<String>,
    {
        self.ops.push(MirrorOp::MergeNode {
            node,
            set: set.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        });
        self
    }

    pub fn merge_edge(mut self, from: NodeRef, relationship: &str, to: NodeRef) -> Self {
        self.ops.push(MirrorOp::MergeEdge {
            from,
            relationship: relationship.to_string(),
            to,
        });
        self
    }

    pub fn delete_edges(mut self, from: NodeRef, relationship: &str) -> Self {
        self.ops.push(MirrorOp::DeleteEdges {
            from,
            relationship: relationship.to_string(),
        });
        self
    }

    pub fn detach_delete(mut self, node: NodeRef) -> Self {
        self.ops.push(MirrorOp::DetachDelete { node });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Nodes this batch creates or updates.
    pub fn merged_nodes(&self) -> impl Iterator<Item = &NodeRef> {
        self.ops.iter().filter_map(|op| match op {
            MirrorOp::MergeNode { node, .. } => Some(node),
            _ => None,
        })
    }
}

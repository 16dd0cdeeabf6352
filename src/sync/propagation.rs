//! Mirror jobs and their translation into mirror batches
//!
//! Every job carries the primary revision it was built from. The batches
//! guard on the revisions already stored on the mirror node, so jobs may be
//! applied in any order and retried any number of times:
//!
//! - full sync writes scalars only if nothing newer is stored, and adds tag
//!   edges only if no tag resync at this revision or later has landed;
//! - tag resync replaces the edge set only if no newer resync has landed;
//! - delete tombstones the key, so every later merge of it is stale.

use crate::embedding::truncate_chars;
use crate::graph::{relationship, Guard, MirrorBatch, NodeRef, PropertyValue};
use crate::model::{Whisper, WhisperId};
use crate::storage::timestamp_to_text;
use chrono::{DateTime, Datelike, Utc};
use std::collections::BTreeSet;
use std::fmt;

/// Property names on mirror `Whisper` nodes.
pub mod property {
    pub const SOURCE_PATH: &str = "source_path";
    pub const TEXT_PREFIX: &str = "text_prefix";
    pub const EMBEDDING: &str = "embedding";
    pub const CREATED_AT: &str = "created_at";
    /// Primary revision of the last full sync applied
    pub const REVISION: &str = "revision";
    /// Primary revision of the last tag resync applied
    pub const TAGS_REVISION: &str = "tags_revision";
}

/// The slice of a whisper the mirror keeps.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSnapshot {
    pub id: WhisperId,
    pub source_path: String,
    pub text_prefix: String,
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub revision: u64,
}

impl MirrorSnapshot {
    pub fn from_whisper(whisper: &Whisper, text_prefix_chars: usize) -> Self {
        Self {
            id: whisper.id.clone(),
            source_path: whisper.source_path.clone(),
            text_prefix: truncate_chars(&whisper.raw_text, text_prefix_chars).to_string(),
            embedding: whisper.embedding.clone(),
            created_at: whisper.created_at,
            tags: whisper.tags.clone(),
            revision: whisper.revision,
        }
    }
}

/// A unit of mirror propagation work.
#[derive(Debug, Clone, PartialEq)]
pub enum MirrorJob {
    /// Additive sync after an upsert
    FullSync(MirrorSnapshot),
    /// Replace the TAGGED edge set with exactly `tags`
    TagResync {
        id: WhisperId,
        revision: u64,
        tags: BTreeSet<String>,
    },
    /// Detach-delete the node
    Delete { id: WhisperId },
}

impl MirrorJob {
    pub fn full_sync(whisper: &Whisper, text_prefix_chars: usize) -> Self {
        MirrorJob::FullSync(MirrorSnapshot::from_whisper(whisper, text_prefix_chars))
    }

    pub fn tag_resync(whisper: &Whisper) -> Self {
        MirrorJob::TagResync {
            id: whisper.id.clone(),
            revision: whisper.revision,
            tags: whisper.tags.clone(),
        }
    }

    pub fn delete(id: WhisperId) -> Self {
        MirrorJob::Delete { id }
    }

    pub fn whisper_id(&self) -> &WhisperId {
        match self {
            MirrorJob::FullSync(snapshot) => &snapshot.id,
            MirrorJob::TagResync { id, .. } | MirrorJob::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MirrorJob::FullSync(_) => "full_sync",
            MirrorJob::TagResync { .. } => "tag_resync",
            MirrorJob::Delete { .. } => "delete",
        }
    }

    /// Primary revision the job was built from; deletes have none.
    pub fn revision(&self) -> Option<u64> {
        match self {
            MirrorJob::FullSync(snapshot) => Some(snapshot.revision),
            MirrorJob::TagResync { revision, .. } => Some(*revision),
            MirrorJob::Delete { .. } => None,
        }
    }

    /// Batches to execute, in order. Each is atomic on its own.
    pub fn batches(&self) -> Vec<MirrorBatch> {
        match self {
            MirrorJob::FullSync(snapshot) => full_sync_batches(snapshot),
            MirrorJob::TagResync { id, revision, tags } => {
                vec![tag_resync_batch(id, *revision, tags)]
            }
            MirrorJob::Delete { id } => {
                vec![MirrorBatch::new().detach_delete(NodeRef::whisper(id.as_str()))]
            }
        }
    }
}

impl fmt::Display for MirrorJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.revision() {
            Some(rev) => write!(f, "{}({}@{})", self.kind(), self.whisper_id(), rev),
            None => write!(f, "{}({})", self.kind(), self.whisper_id()),
        }
    }
}

fn full_sync_batches(snapshot: &MirrorSnapshot) -> Vec<MirrorBatch> {
    let node = NodeRef::whisper(snapshot.id.as_str());
    let year = NodeRef::year(snapshot.created_at.year());
    let revision = crate::graph::revision_to_i64(snapshot.revision);

    let mut scalars = vec![
        (property::SOURCE_PATH, PropertyValue::from(snapshot.source_path.as_str())),
        (property::TEXT_PREFIX, PropertyValue::from(snapshot.text_prefix.as_str())),
        (
            property::CREATED_AT,
            PropertyValue::from(timestamp_to_text(&snapshot.created_at)),
        ),
        (property::REVISION, PropertyValue::from(revision)),
    ];
    if let Some(embedding) = &snapshot.embedding {
        scalars.push((property::EMBEDDING, PropertyValue::from_vector(embedding)));
    }

    let record = MirrorBatch::new()
        .when(Guard::not_newer_than(
            node.clone(),
            property::REVISION,
            snapshot.revision,
        ))
        .merge_node_with(node.clone(), scalars)
        .merge_node(year.clone())
        .merge_edge(node.clone(), relationship::CREATED_IN, year);

    let mut batches = vec![record];
    if !snapshot.tags.is_empty() {
        let tags = snapshot.tags.iter().fold(
            MirrorBatch::new()
                .when(Guard::older_than(
                    node.clone(),
                    property::TAGS_REVISION,
                    snapshot.revision,
                ))
                .merge_node(node.clone()),
            |batch, tag| {
                let tag = NodeRef::tag(tag.as_str());
                batch
                    .merge_node(tag.clone())
                    .merge_edge(node.clone(), relationship::TAGGED, tag)
            },
        );
        batches.push(tags);
    }
    batches
}

fn tag_resync_batch(id: &WhisperId, revision: u64, tags: &BTreeSet<String>) -> MirrorBatch {
    let node = NodeRef::whisper(id.as_str());
    let batch = MirrorBatch::new()
        .when(Guard::not_newer_than(
            node.clone(),
            property::TAGS_REVISION,
            revision,
        ))
        .merge_node_with(
            node.clone(),
            [(
                property::TAGS_REVISION,
                PropertyValue::from(crate::graph::revision_to_i64(revision)),
            )],
        )
        .delete_edges(node.clone(), relationship::TAGGED);

    tags.iter().fold(batch, |batch, tag| {
        let tag = NodeRef::tag(tag.as_str());
        batch
            .merge_node(tag.clone())
            .merge_edge(node.clone(), relationship::TAGGED, tag)
    })
}

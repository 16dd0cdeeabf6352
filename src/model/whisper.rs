//! Whisper records, drafts, and patches

use super::tags::normalize_tags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

/// Reasons a request is rejected before any store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("raw_text must not be empty")]
    EmptyText,

    #[error("source_path must not be empty")]
    EmptySourcePath,

    #[error("malformed whisper id: {0:?}")]
    MalformedId(String),

    #[error("embedding must not be empty")]
    EmptyEmbedding,

    #[error("search query must not be empty")]
    EmptyQuery,
}

/// Primary-store key of a whisper.
///
/// Minted by the primary store on first insert (UUID v4 text) and never
/// changed afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WhisperId(String);

impl WhisperId {
    /// Mint a fresh id. Only primary stores should call this.
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Parse a caller-supplied id.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        Uuid::parse_str(trimmed)
            .map(|uuid| Self(uuid.to_string()))
            .map_err(|_| ValidationError::MalformedId(raw.to_string()))
    }

    /// Wrap an id read back from storage without re-validating it.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WhisperId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WhisperId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A whisper as confirmed by the primary store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Whisper {
    pub id: WhisperId,
    /// Natural identity used for upsert-by-source-path
    pub source_path: String,
    pub raw_text: String,
    /// Set on first insert, never changed
    pub created_at: DateTime<Utc>,
    /// Time of the most recent primary write
    pub updated_at: DateTime<Utc>,
    /// Normalized tag set
    pub tags: BTreeSet<String>,
    pub embedding: Option<Vec<f32>>,
    /// Informational token count
    pub tokens: Option<u32>,
    /// Primary write counter: 1 on insert, +1 per update
    pub revision: u64,
}

impl Whisper {
    /// Tags as an ordered list.
    pub fn tag_list(&self) -> Vec<String> {
        self.tags.iter().cloned().collect()
    }
}

/// Input to an upsert. Carries no id: the primary store resolves identity
/// from `source_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct WhisperDraft {
    pub source_path: String,
    pub raw_text: String,
    /// Unnormalized tags as supplied by the caller
    pub tags: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub tokens: Option<u32>,
    /// Used only when the upsert inserts a new record
    pub created_at: Option<DateTime<Utc>>,
}

impl WhisperDraft {
    pub fn new(source_path: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            raw_text: raw_text.into(),
            tags: Vec::new(),
            embedding: None,
            tokens: None,
            created_at: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Check the draft's own invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.source_path.trim().is_empty() {
            return Err(ValidationError::EmptySourcePath);
        }
        if self.raw_text.trim().is_empty() {
            return Err(ValidationError::EmptyText);
        }
        if matches!(&self.embedding, Some(v) if v.is_empty()) {
            return Err(ValidationError::EmptyEmbedding);
        }
        Ok(())
    }

    /// The draft's tags after normalization.
    pub fn normalized_tags(&self) -> BTreeSet<String> {
        normalize_tags(&self.tags)
    }
}

/// Partial field update keyed by id.
///
/// `tags: Some(vec![])` clears all tags; `tags: None` leaves them alone.
/// There is no way to clear an embedding through a patch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WhisperPatch {
    pub tags: Option<Vec<String>>,
    pub embedding: Option<Vec<f32>>,
    pub tokens: Option<u32>,
}

impl WhisperPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Shorthand for a patch that removes every tag.
    pub fn clear_tags() -> Self {
        Self {
            tags: Some(Vec::new()),
            ..Self::default()
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_tokens(mut self, tokens: u32) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// True if the patch would not change any field.
    pub fn is_empty(&self) -> bool {
        self.tags.is_none() && self.embedding.is_none() && self.tokens.is_none()
    }

    pub fn touches_tags(&self) -> bool {
        self.tags.is_some()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if matches!(&self.embedding, Some(v) if v.is_empty()) {
            return Err(ValidationError::EmptyEmbedding);
        }
        Ok(())
    }

    /// Return a copy with the tag list normalized, so stores never see raw
    /// caller input.
    pub fn normalized(&self) -> Self {
        Self {
            tags: self
                .tags
                .as_ref()
                .map(|tags| normalize_tags(tags).into_iter().collect()),
            embedding: self.embedding.clone(),
            tokens: self.tokens,
        }
    }
}

/// Filter criteria for listing whispers
#[derive(Debug, Clone, Default)]
pub struct WhisperFilter {
    /// Only whispers carrying this tag (normalized before use)
    pub tag: Option<String>,
    /// Created at or after this instant
    pub created_after: Option<DateTime<Utc>>,
    /// Created strictly before this instant
    pub created_before: Option<DateTime<Utc>>,
    /// Maximum number of results
    pub limit: Option<usize>,
}

impl WhisperFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A tag that normalizes to nothing matches no whisper.
    pub fn with_tag(mut self, tag: impl AsRef<str>) -> Self {
        self.tag = Some(normalize_tags([tag]).into_iter().next().unwrap_or_default());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn created_before(mut self, at: DateTime<Utc>) -> Self {
        self.created_before = Some(at);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_uuid_and_rejects_garbage() {
        let minted = WhisperId::mint();
        assert_eq!(WhisperId::parse(minted.as_str()).unwrap(), minted);
        assert_eq!(
            WhisperId::parse("not-an-id"),
            Err(ValidationError::MalformedId("not-an-id".to_string()))
        );
        assert!(WhisperId::parse("").is_err());
    }

    #[test]
    fn filter_tag_is_normalized_and_blank_stays_set() {
        assert_eq!(WhisperFilter::new().with_tag(" Rust ").tag.as_deref(), Some("rust"));
        assert_eq!(WhisperFilter::new().with_tag("  ").tag.as_deref(), Some(""));
        assert!(WhisperFilter::new().tag.is_none());
    }

    #[test]
    fn draft_rejects_blank_text_and_path() {
        assert_eq!(
            WhisperDraft::new("/a.md", "   ").validate(),
            Err(ValidationError::EmptyText)
        );
        assert_eq!(
            WhisperDraft::new("", "hello").validate(),
            Err(ValidationError::EmptySourcePath)
        );
        assert_eq!(
            WhisperDraft::new("/a.md", "hello")
                .with_embedding(Vec::new())
                .validate(),
            Err(ValidationError::EmptyEmbedding)
        );
        assert!(WhisperDraft::new("/a.md", "hello").validate().is_ok());
    }

    #[test]
    fn draft_normalizes_tags() {
        let draft = WhisperDraft::new("/a.md", "hello").with_tags(["B", "b", " A"]);
        let tags: Vec<_> = draft.normalized_tags().into_iter().collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn empty_patch_is_empty_but_clear_tags_is_not() {
        assert!(WhisperPatch::new().is_empty());
        let clear = WhisperPatch::clear_tags();
        assert!(!clear.is_empty());
        assert!(clear.touches_tags());
        assert_eq!(clear.tags, Some(Vec::new()));
    }

    #[test]
    fn patch_normalization_keeps_absent_tags_absent() {
        let patch = WhisperPatch::new().with_tokens(3).normalized();
        assert!(patch.tags.is_none());

        let patch = WhisperPatch::new().with_tags(["X", "x ", "y"]).normalized();
        assert_eq!(patch.tags, Some(vec!["x".to_string(), "y".to_string()]));
    }

    #[test]
    fn filter_normalizes_tag() {
        let filter = WhisperFilter::new().with_tag("  Rust ");
        assert_eq!(filter.tag.as_deref(), Some("rust"));
    }

    #[test]
    fn whisper_serializes_tags_as_sorted_array() {
        let now = Utc::now();
        let whisper = Whisper {
            id: WhisperId::mint(),
            source_path: "/a.md".to_string(),
            raw_text: "hello".to_string(),
            created_at: now,
            updated_at: now,
            tags: normalize_tags(["b", "a"]),
            embedding: None,
            tokens: Some(1),
            revision: 1,
        };
        let json = serde_json::to_value(&whisper).unwrap();
        assert_eq!(json["tags"], serde_json::json!(["a", "b"]));
        assert_eq!(json["id"], serde_json::json!(whisper.id.as_str()));
    }
}

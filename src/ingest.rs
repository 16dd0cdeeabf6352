//! Turning text files into whisper drafts
//!
//! A file may open with a YAML frontmatter block:
//!
//! ```text
//! ---
//! tags: [travel, avignon]
//! ---
//! body text
//! ```
//!
//! Its `tags` (a list, or one comma-separated string) become the draft's
//! tags and the block is stripped from the stored text.

use crate::model::WhisperDraft;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// File extensions picked up by folder ingest.
pub const INGEST_EXTENSIONS: &[&str] = &["md", "txt"];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub fn is_ingestible(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| INGEST_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Ingestible files directly inside `dir` (not recursive), sorted by path.
pub fn list_sources(dir: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let io_err = |source| IngestError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && is_ingestible(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Split off a leading frontmatter block. Returns (yaml, body).
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let trimmed = content.trim_start();
    let after_first = trimmed.strip_prefix("---")?;
    let end_pos = after_first.find("\n---")?;
    let yaml = &after_first[..end_pos];
    let rest = &after_first[end_pos + "\n---".len()..];
    // Drop the remainder of the closing fence line
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    Some((yaml, body))
}

fn tags_from_frontmatter(frontmatter: &Value) -> Vec<String> {
    match frontmatter.get("tags") {
        Some(Value::Sequence(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(s)) => s.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

/// Build a draft from file content. Tags are left unnormalized; the engine
/// normalizes them.
pub fn draft_from_text(source_path: &str, content: &str) -> WhisperDraft {
    let (tags, body) = match split_frontmatter(content) {
        Some((yaml, body)) => match serde_yaml::from_str::<Value>(yaml) {
            Ok(frontmatter) => (tags_from_frontmatter(&frontmatter), body),
            Err(e) => {
                warn!(source_path, error = %e, "ignoring malformed frontmatter");
                (Vec::new(), content)
            }
        },
        None => (Vec::new(), content),
    };

    WhisperDraft::new(source_path, body.trim())
        .with_tags(tags)
        .with_tokens(word_count(body))
}

/// Read one file into a draft keyed by its canonical path.
pub async fn read_draft(path: &Path) -> Result<WhisperDraft, IngestError> {
    let io_err = |source| IngestError::Io {
        path: path.to_path_buf(),
        source,
    };
    let content = tokio::fs::read_to_string(path).await.map_err(io_err)?;
    let source_path = tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf());
    Ok(draft_from_text(&source_path.to_string_lossy(), &content))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_has_no_tags() {
        let draft = draft_from_text("/a.txt", "just some words here\n");
        assert!(draft.tags.is_empty());
        assert_eq!(draft.raw_text, "just some words here");
        assert_eq!(draft.tokens, Some(4));
    }

    #[test]
    fn frontmatter_list_tags_are_extracted() {
        let content = "---\ntags: [Travel, avignon]\ntitle: Trip\n---\nBody text.\n";
        let draft = draft_from_text("/trip.md", content);
        assert_eq!(draft.tags, vec!["Travel", "avignon"]);
        assert_eq!(draft.raw_text, "Body text.");
        assert_eq!(draft.tokens, Some(2));
    }

    #[test]
    fn frontmatter_string_tags_are_split() {
        let content = "---\ntags: \"rust, async\"\n---\nbody\n";
        let draft = draft_from_text("/r.md", content);
        let tags: Vec<_> = draft.normalized_tags().into_iter().collect();
        assert_eq!(tags, vec!["async", "rust"]);
    }

    #[test]
    fn malformed_frontmatter_keeps_whole_text() {
        let content = "---\ntags: [unclosed\n---\nbody\n";
        let draft = draft_from_text("/bad.md", content);
        assert!(draft.tags.is_empty());
        assert!(draft.raw_text.contains("body"));
    }

    #[test]
    fn list_sources_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "b").unwrap();
        std::fs::write(dir.path().join("a.TXT"), "a").unwrap();
        std::fs::write(dir.path().join("c.rs"), "c").unwrap();
        std::fs::create_dir(dir.path().join("sub.md")).unwrap();

        let files = list_sources(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.TXT", "b.md"]);
    }

    #[tokio::test]
    async fn read_draft_uses_canonical_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.md");
        std::fs::write(&path, "hello there").unwrap();

        let draft = read_draft(&path).await.unwrap();
        let expected = std::fs::canonicalize(&path).unwrap();
        assert_eq!(draft.source_path, expected.to_string_lossy());
        assert!(read_draft(&dir.path().join("missing.md")).await.is_err());
    }
}

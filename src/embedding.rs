//! Embedding backends
//!
//! The engine only needs one vector per whisper, so the trait embeds a
//! single text. `HashingEmbedder` is always available and deterministic;
//! `FastEmbedEmbedder` runs a local ONNX model behind the `embeddings`
//! feature.

use async_trait::async_trait;
use thiserror::Error;

/// Error type for embedding operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmbeddingError {
    /// The embedding model returned no results
    #[error("embedding returned no results")]
    EmptyResult,

    /// Model loading or inference failed
    #[error("embedding model error: {0}")]
    ModelError(String),

    #[error("embedding timed out after {0} ms")]
    Timeout(u64),
}

/// Turns text into a vector.
///
/// Implementations may be remote and slow. Callers bound both the input
/// length and the wall-clock time spent waiting.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier stored alongside nothing, but logged with every call.
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Feature-hashing embedder.
///
/// Each lower-cased alphanumeric token adds ±1 to one bucket; the result is
/// L2-normalized. Text with no such token (emoji, punctuation) is hashed one
/// non-whitespace character at a time instead. Same text, same vector, on
/// every platform.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
    name: String,
}

impl HashingEmbedder {
    pub const DEFAULT_DIMENSIONS: usize = 384;

    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            name: format!("hashing-{}", dimensions),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed_sync(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();
        if tokens.is_empty() {
            tokens = text
                .chars()
                .filter(|c| !c.is_whitespace())
                .map(String::from)
                .collect();
        }
        if tokens.is_empty() {
            return Err(EmbeddingError::EmptyResult);
        }

        let mut vector = vec![0.0f32; self.dimensions];
        for token in &tokens {
            let hash = fnv1a(token.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if hash >> 63 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_sync(text)
    }
}

// ---------------------------------------------------------------------------
// FastEmbedEmbedder (behind `embeddings` feature)
// ---------------------------------------------------------------------------

#[cfg(feature = "embeddings")]
mod fastembed_impl {
    use super::{Embedder, EmbeddingError};
    use async_trait::async_trait;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use std::sync::{Arc, Mutex};

    /// Local embedder backed by fastembed (ONNX Runtime).
    ///
    /// `TextEmbedding::embed` takes `&mut self`, so the model sits behind a
    /// mutex and inference runs on the blocking pool.
    pub struct FastEmbedEmbedder {
        model: Arc<Mutex<TextEmbedding>>,
        name: String,
    }

    impl FastEmbedEmbedder {
        pub fn new(model: EmbeddingModel) -> Result<Self, EmbeddingError> {
            let name = format!("{:?}", model);
            let options = InitOptions::new(model).with_show_download_progress(false);
            let embedding = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;
            Ok(Self {
                model: Arc::new(Mutex::new(embedding)),
                name,
            })
        }

        /// all-MiniLM-L6-v2, 384 dimensions.
        pub fn default_model() -> Result<Self, EmbeddingError> {
            Self::new(EmbeddingModel::AllMiniLML6V2)
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedEmbedder {
        fn model_name(&self) -> &str {
            &self.name
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let model = Arc::clone(&self.model);
            let text = text.to_string();
            tokio::task::spawn_blocking(move || {
                let mut model = model
                    .lock()
                    .map_err(|_| EmbeddingError::ModelError("model lock poisoned".into()))?;
                let embeddings = model
                    .embed(vec![text], None)
                    .map_err(|e| EmbeddingError::ModelError(e.to_string()))?;
                embeddings.into_iter().next().ok_or(EmbeddingError::EmptyResult)
            })
            .await
            .map_err(|e| EmbeddingError::ModelError(e.to_string()))?
        }
    }
}

#[cfg(feature = "embeddings")]
pub use fastembed_impl::FastEmbedEmbedder;

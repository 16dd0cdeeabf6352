//! Whisper record model

mod tags;
mod whisper;

pub use tags::normalize_tags;
pub use whisper::{
    ValidationError, Whisper, WhisperDraft, WhisperFilter, WhisperId, WhisperPatch,
};

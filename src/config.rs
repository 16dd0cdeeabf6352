//! Configuration
//!
//! Loaded from YAML. Every field has a default, so an empty or missing file
//! is a valid configuration. Environment variables override the storage
//! section after the file is read.

use crate::graph::Partition;
use crate::sync::retry::{millis, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PRIMARY_DB: &str = "WHISPER_PRIMARY_DB";
pub const ENV_MIRROR_DB: &str = "WHISPER_MIRROR_DB";
pub const ENV_MIRROR_PARTITION: &str = "WHISPER_MIRROR_PARTITION";

const APP_DIR: &str = "whisper-sync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub mirror: MirrorConfig,
}

/// Where the two stores live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to `<data_dir>/whisper-sync/primary.db`
    pub primary_db: Option<PathBuf>,
    /// Defaults to `<data_dir>/whisper-sync/mirror.db`
    pub mirror_db: Option<PathBuf>,
    pub partition: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            primary_db: None,
            mirror_db: None,
            partition: Partition::DEFAULT.to_string(),
        }
    }
}

impl StorageConfig {
    pub fn primary_db_path(&self) -> PathBuf {
        self.primary_db
            .clone()
            .unwrap_or_else(|| default_data_dir().join("primary.db"))
    }

    pub fn mirror_db_path(&self) -> PathBuf {
        self.mirror_db
            .clone()
            .unwrap_or_else(|| default_data_dir().join("mirror.db"))
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.partition.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Output size of the built-in hashing embedder
    pub dimensions: usize,
    /// Text longer than this is truncated before embedding
    pub max_input_chars: usize,
    #[serde(rename = "timeout_ms", with = "millis")]
    pub timeout: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: 384,
            max_input_chars: 8192,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Characters of raw text copied onto the mirror node
    pub text_prefix_chars: usize,
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            text_prefix_chars: 280,
            workers: 4,
            queue_capacity: 1024,
            retry: RetryPolicy::default(),
        }
    }
}

/// Engine-level settings, without store locations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSettings {
    pub embedding: EmbeddingConfig,
    pub mirror: MirrorConfig,
}

impl From<&Config> for SyncSettings {
    fn from(config: &Config) -> Self {
        Self {
            embedding: config.embedding.clone(),
            mirror: config.mirror.clone(),
        }
    }
}

/// `<data_dir>/whisper-sync`, falling back to `~/.local/share/whisper-sync`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_default().join(".local/share"))
        .join(APP_DIR)
}

/// `<config_dir>/whisper-sync/config.yaml`, if a config dir is known.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.yaml"))
}

impl Config {
    /// Parse a YAML document.
    pub fn from_yaml(yaml: &str, origin: &Path) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&yaml, path)
    }

    /// Load from `explicit` if given, else from the default location if a
    /// file exists there, else defaults. Environment overrides apply last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(path) = get(ENV_PRIMARY_DB) {
            self.storage.primary_db = Some(PathBuf::from(path));
        }
        if let Some(path) = get(ENV_MIRROR_DB) {
            self.storage.mirror_db = Some(PathBuf::from(path));
        }
        if let Some(partition) = get(ENV_MIRROR_PARTITION) {
            self.storage.partition = partition;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.partition.trim().is_empty() {
            return Err(ConfigError::Invalid("storage.partition must not be empty".into()));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid("embedding.dimensions must be positive".into()));
        }
        if self.embedding.max_input_chars == 0 {
            return Err(ConfigError::Invalid(
                "embedding.max_input_chars must be positive".into(),
            ));
        }
        if self.mirror.workers == 0 || self.mirror.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "mirror.workers and mirror.queue_capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

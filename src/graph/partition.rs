//! Partition: the named logical slice of the mirror a store operates on

use serde::{Deserialize, Serialize};

/// Name of a mirror partition.
///
/// Several independent mirrors can share one database file; every node,
/// edge, and tombstone row is scoped by partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Partition(String);

impl Partition {
    pub const DEFAULT: &'static str = "whispers";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Partition {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Partition {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Partition {
    fn from(s: String) -> Self {
        Self(s)
    }
}

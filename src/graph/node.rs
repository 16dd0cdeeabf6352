//! Node representation in the relationship mirror

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Well-known node labels
pub mod label {
    /// One node per primary-store whisper, keyed by whisper id
    pub const WHISPER: &str = "Whisper";
    /// One node per normalized tag value
    pub const TAG: &str = "Tag";
    /// Coarse time bucket, one node per calendar year
    pub const YEAR: &str = "Year";
}

/// Typed property values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<PropertyValue>),
    Object(HashMap<String, PropertyValue>),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read back a vector stored with [`PropertyValue::from_vector`].
    pub fn as_vector(&self) -> Option<Vec<f32>> {
        match self {
            PropertyValue::Array(items) => items
                .iter()
                .map(|v| match v {
                    PropertyValue::Float(f) => Some(*f as f32),
                    PropertyValue::Int(i) => Some(*i as f32),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }

    pub fn from_vector(vector: &[f32]) -> Self {
        PropertyValue::Array(
            vector
                .iter()
                .map(|f| PropertyValue::Float(f64::from(*f)))
                .collect(),
        )
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(i: i64) -> Self {
        PropertyValue::Int(i)
    }
}

/// Properties collection
pub type Properties = HashMap<String, PropertyValue>;

/// Identity of a mirror node: label plus key, unique within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub label: String,
    pub key: String,
}

impl NodeRef {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
        }
    }

    pub fn whisper(id: impl Into<String>) -> Self {
        Self::new(label::WHISPER, id)
    }

    pub fn tag(value: impl Into<String>) -> Self {
        Self::new(label::TAG, value)
    }

    pub fn year(year: i32) -> Self {
        Self::new(label::YEAR, year.to_string())
    }
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}:{})", self.label, self.key)
    }
}

/// A node as stored in the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorNode {
    pub node: NodeRef,
    pub properties: Properties,
}

impl MirrorNode {
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Integer property, treating a missing value as zero.
    pub fn int_or_zero(&self, key: &str) -> i64 {
        self.properties
            .get(key)
            .and_then(PropertyValue::as_int)
            .unwrap_or(0)
    }
}

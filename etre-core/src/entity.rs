//! Entity model: schemaless labeled documents.
//!
//! An entity is a mapping from label name to value. Labels beginning with
//! `_` are reserved meta-labels maintained by the server: `_id` (opaque
//! server-issued identifier), `_type` (entity type / backing collection)
//! and `_rev` (monotonic write counter).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{META_LABEL_ID, META_LABEL_REV, META_LABEL_TYPE};

// ============================================================================
// VALUE
// ============================================================================

/// A label value: string, 64-bit integer, boolean, or (for schema-declared
/// object fields) a JSON object.
///
/// JSON numbers that do not fit in an `i64` fail deserialization, which the
/// API surfaces as `invalid-content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Bool(bool),
    String(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl Value {
    /// The string form used by the selector language (unquoted).
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// True for the empty string, which existence checks treat as "not set".
    pub fn is_empty_string(&self) -> bool {
        matches!(self, Value::String(s) if s.is_empty())
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Bool(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Bool(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Object(m) => {
                write!(f, "{}", serde_json::Value::Object(m.clone()))
            }
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    /// Total order: by type rank, then by value within the type. Needed for
    /// deterministic distinct projections.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Object(a), Value::Object(b)) => {
                let a = serde_json::Value::Object(a.clone()).to_string();
                let b = serde_json::Value::Object(b.clone()).to_string();
                a.cmp(&b)
            }
            (a, b) => a.type_rank().cmp(&b.type_rank()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

// ============================================================================
// ENTITY
// ============================================================================

/// A labeled document: the unit of storage and of the CDC event.
///
/// The map is ordered so serialized entities and test expectations are
/// deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity(pub BTreeMap<String, Value>);

impl Entity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        self.0.get(label)
    }

    pub fn insert(&mut self, label: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(label.into(), value.into())
    }

    pub fn remove(&mut self, label: &str) -> Option<Value> {
        self.0.remove(label)
    }

    pub fn contains_label(&self, label: &str) -> bool {
        self.0.contains_key(label)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The server-issued id, when set.
    pub fn id(&self) -> Option<&str> {
        self.get(META_LABEL_ID).and_then(Value::as_str)
    }

    /// The entity type, when set.
    pub fn entity_type(&self) -> Option<&str> {
        self.get(META_LABEL_TYPE).and_then(Value::as_str)
    }

    /// The revision counter, when set.
    pub fn rev(&self) -> Option<i64> {
        self.get(META_LABEL_REV).and_then(Value::as_int)
    }

    /// All non-meta label names, sorted.
    pub fn labels(&self) -> Vec<String> {
        self.0
            .keys()
            .filter(|k| !is_meta_label(k))
            .cloned()
            .collect()
    }

    /// Copy of the entity restricted to the given labels. An empty list
    /// means no projection (full entity).
    pub fn project(&self, return_labels: &[String]) -> Entity {
        if return_labels.is_empty() {
            return self.clone();
        }
        Entity(
            self.0
                .iter()
                .filter(|(k, _)| return_labels.iter().any(|l| l == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

impl FromIterator<(String, Value)> for Entity {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Entity(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, Value); N]> for Entity {
    fn from(labels: [(&str, Value); N]) -> Self {
        Entity(labels.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }
}

/// Labels beginning with `_` are reserved for the server.
pub fn is_meta_label(label: &str) -> bool {
    label.starts_with('_')
}

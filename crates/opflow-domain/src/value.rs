use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A dynamically-typed configuration value as the planner and providers see
/// it. Unlike plain JSON this keeps the "not yet known" placeholder as a
/// first-class value, at any nesting depth, because planned values routinely
/// contain attributes that only the apply step can fill in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DynValue {
    Unknown,
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<DynValue>),
    Map(BTreeMap<String, DynValue>),
}

impl DynValue {
    pub fn is_unknown(&self) -> bool {
        matches!(self, DynValue::Unknown)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DynValue::Null)
    }

    pub fn string(s: impl Into<String>) -> Self {
        DynValue::String(s.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert to JSON, mapping unknown placeholders to null. Good enough for
    /// logging and debug dumps; not reversible.
    pub fn to_json_lossy(&self) -> serde_json::Value {
        match self {
            DynValue::Unknown | DynValue::Null => serde_json::Value::Null,
            DynValue::Bool(b) => serde_json::Value::Bool(*b),
            DynValue::Number(n) => serde_json::Value::Number(n.clone()),
            DynValue::String(s) => serde_json::Value::String(s.clone()),
            DynValue::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| v.to_json_lossy()).collect())
            }
            DynValue::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_lossy()))
                    .collect(),
            ),
        }
    }
}

impl From<serde_json::Value> for DynValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => DynValue::Null,
            serde_json::Value::Bool(b) => DynValue::Bool(b),
            serde_json::Value::Number(n) => DynValue::Number(n),
            serde_json::Value::String(s) => DynValue::String(s),
            serde_json::Value::Array(items) => {
                DynValue::List(items.into_iter().map(DynValue::from).collect())
            }
            serde_json::Value::Object(entries) => DynValue::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, DynValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynValue::Unknown => write!(f, "(unknown)"),
            DynValue::Null => write!(f, "null"),
            DynValue::Bool(b) => write!(f, "{}", b),
            DynValue::Number(n) => write!(f, "{}", n),
            DynValue::String(s) => write!(f, "{:?}", s),
            DynValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            DynValue::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}: {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

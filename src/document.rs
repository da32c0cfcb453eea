//! The dynamically typed document tree used as message payload. Values are
//! serialized as JSON on the wire, with object keys emitted in sorted order
//! so that a document has a single canonical serialization. Readers must not
//! rely on key ordering.

use crate::error::Result;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A document value: a tagged tree of scalars, arrays, and nested documents.
///
/// The untagged serde representation maps directly onto JSON, so a payload
/// like {"Address": "host:5000"} round-trips without any envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// An absent value.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit floating point number.
    Float(f64),
    /// A UTF-8 encoded string.
    String(String),
    /// An ordered list of values.
    Array(Vec<Value>),
    /// A nested document with sorted keys.
    Document(BTreeMap<String, Value>),
}

impl Value {
    /// Returns an empty document.
    pub fn empty() -> Self {
        Value::Document(BTreeMap::new())
    }

    /// Builds a document from key/value pairs.
    pub fn document<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Document(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Looks up a value by dotted path, e.g. "a.b.c", as a fold over nested
    /// documents. Returns None if any path segment is missing or the
    /// intermediate value is not a document.
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(self, |value, segment| match value {
            Value::Document(fields) => fields.get(segment),
            _ => None,
        })
    }

    /// Looks up a string by dotted path.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Looks up an integer by dotted path.
    pub fn get_i64(&self, path: &str) -> Option<i64> {
        self.get(path).and_then(Value::as_i64)
    }

    /// Returns the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Returns the integer contents, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the boolean contents, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Serializes the value to canonical JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes a value from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => Err(std::fmt::Error),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(v: Vec<V>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

//! Deterministic serialization of JSON-shaped values.
//!
//! The output is only ever fed to SHA-256; the single requirement is that
//! the same value tree yields the same bytes on every run and platform.
//! Mapping keys are emitted in ascending lexicographic order of their
//! UTF-8 bytes, sequence order is preserved, and strings use standard
//! JSON escaping. Absent entries are never inserted, so they simply do
//! not appear in the output.

use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

impl Value {
    pub fn object() -> BTreeMap<String, Value> {
        BTreeMap::new()
    }

    fn check_finite(&self) -> Result<(), SerializationError> {
        match self {
            Value::Number(n) if !n.is_finite() => Err(SerializationError::NonFiniteNumber(*n)),
            Value::Array(items) => items.iter().try_for_each(Value::check_finite),
            Value::Object(entries) => entries.values().try_for_each(Value::check_finite),
            _ => Ok(()),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(value: Vec<V>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Value>> From<BTreeMap<String, V>> for Value {
    fn from(value: BTreeMap<String, V>) -> Self {
        Value::Object(value.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum SerializationError {
    #[error("non-finite number {0} in serialized value")]
    NonFiniteNumber(f64),
}

/// Serializes `value` to its canonical byte form.
///
/// Cyclic input is unrepresentable in the owned [`Value`] tree, so only
/// non-finite numbers can fail here.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, SerializationError> {
    value.check_finite()?;
    Ok(serde_json::to_vec(value).expect("finite value tree serializes"))
}

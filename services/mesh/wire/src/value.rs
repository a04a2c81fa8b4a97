//! Tagged-variant payload values with CBOR encoding.
//!
//! Structured application payloads (profile cards, chat envelopes) are built
//! from [`Value`] rather than loosely typed maps.

use crate::error::WireError;
use bytes::Bytes;
use std::collections::BTreeMap;

/// Self-describing payload value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent value
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Integer(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Ordered list
    Array(Vec<Value>),
    /// String-keyed map
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Empty map
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Insert into a map value; no-op on other variants
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Map(map) = &mut self {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    /// Look up a key in a map value
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Text content, if this is a text value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer value
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Encode as canonical CBOR
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = Vec::new();
        ciborium::into_writer(&self.to_cbor(), &mut buf)
            .map_err(|_| WireError::Malformed("value not encodable"))?;
        Ok(Bytes::from(buf))
    }

    /// Decode from CBOR
    pub fn decode(raw: &[u8]) -> Result<Self, WireError> {
        let value: ciborium::Value =
            ciborium::from_reader(raw).map_err(|_| WireError::Malformed("invalid cbor"))?;
        Self::from_cbor(value)
    }

    fn to_cbor(&self) -> ciborium::Value {
        match self {
            Value::Null => ciborium::Value::Null,
            Value::Bool(b) => ciborium::Value::Bool(*b),
            Value::Integer(i) => ciborium::Value::Integer((*i).into()),
            Value::Float(f) => ciborium::Value::Float(*f),
            Value::Text(s) => ciborium::Value::Text(s.clone()),
            Value::Bytes(b) => ciborium::Value::Bytes(b.clone()),
            Value::Array(items) => ciborium::Value::Array(items.iter().map(Value::to_cbor).collect()),
            Value::Map(map) => ciborium::Value::Map(
                map.iter()
                    .map(|(k, v)| (ciborium::Value::Text(k.clone()), v.to_cbor()))
                    .collect(),
            ),
        }
    }

    fn from_cbor(value: ciborium::Value) -> Result<Self, WireError> {
        Ok(match value {
            ciborium::Value::Null => Value::Null,
            ciborium::Value::Bool(b) => Value::Bool(b),
            ciborium::Value::Integer(i) => Value::Integer(
                i64::try_from(i128::from(i))
                    .map_err(|_| WireError::Malformed("integer out of range"))?,
            ),
            ciborium::Value::Float(f) => Value::Float(f),
            ciborium::Value::Text(s) => Value::Text(s),
            ciborium::Value::Bytes(b) => Value::Bytes(b),
            ciborium::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_cbor)
                    .collect::<Result<_, _>>()?,
            ),
            ciborium::Value::Map(entries) => {
                let mut map = BTreeMap::new();
                for (k, v) in entries {
                    let ciborium::Value::Text(key) = k else {
                        return Err(WireError::Malformed("map key must be text"));
                    };
                    map.insert(key, Value::from_cbor(v)?);
                }
                Value::Map(map)
            }
            ciborium::Value::Tag(_, inner) => Value::from_cbor(*inner)?,
            _ => return Err(WireError::Malformed("unsupported cbor item")),
        })
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, GeoPoint, Timestamp};
use crate::value::{ArrayValue, BytesValue, MapValue};

/// A typed document value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Value {
    kind: ValueKind,
}

/// Write-time placeholders. They never reach the cache: user-data parsing
/// turns them into field transforms or mask deletions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SentinelValue {
    ServerTimestamp,
    Delete,
    ArrayUnion(Vec<Value>),
    ArrayRemove(Vec<Value>),
    NumericIncrement(Box<Value>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    /// A server timestamp that has been applied locally but not yet
    /// acknowledged. `previous` keeps the value it replaced.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous: Option<Box<Value>>,
    },
    String(String),
    Bytes(BytesValue),
    Reference(DocumentKey),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
    Sentinel(SentinelValue),
}

impl Value {
    fn with_kind(kind: ValueKind) -> Self {
        Self { kind }
    }

    pub fn null() -> Self {
        Self::with_kind(ValueKind::Null)
    }

    pub fn from_bool(value: bool) -> Self {
        Self::with_kind(ValueKind::Boolean(value))
    }

    pub fn from_integer(value: i64) -> Self {
        Self::with_kind(ValueKind::Integer(value))
    }

    pub fn from_double(value: f64) -> Self {
        Self::with_kind(ValueKind::Double(value))
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self::with_kind(ValueKind::Timestamp(value))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self::with_kind(ValueKind::String(value.into()))
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self::with_kind(ValueKind::Bytes(value))
    }

    pub fn from_reference(key: DocumentKey) -> Self {
        Self::with_kind(ValueKind::Reference(key))
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self::with_kind(ValueKind::GeoPoint(value))
    }

    pub fn from_array(values: Vec<Value>) -> Self {
        Self::with_kind(ValueKind::Array(ArrayValue::new(values)))
    }

    pub fn from_map(map: BTreeMap<String, Value>) -> Self {
        Self::with_kind(ValueKind::Map(MapValue::new(map)))
    }

    /// Field value populated with the commit time by the remote authority.
    pub fn server_timestamp() -> Self {
        Self::with_kind(ValueKind::Sentinel(SentinelValue::ServerTimestamp))
    }

    /// Marks a field for deletion inside `update` and `set_merge` data.
    pub fn delete_field() -> Self {
        Self::with_kind(ValueKind::Sentinel(SentinelValue::Delete))
    }

    pub fn array_union(elements: Vec<Value>) -> Self {
        Self::with_kind(ValueKind::Sentinel(SentinelValue::ArrayUnion(elements)))
    }

    pub fn array_remove(elements: Vec<Value>) -> Self {
        Self::with_kind(ValueKind::Sentinel(SentinelValue::ArrayRemove(elements)))
    }

    pub fn increment(operand: Value) -> Self {
        Self::with_kind(ValueKind::Sentinel(SentinelValue::NumericIncrement(
            Box::new(operand),
        )))
    }

    pub(crate) fn pending_server_timestamp(
        local_write_time: Timestamp,
        previous: Option<Value>,
    ) -> Self {
        // Chained pending timestamps keep the oldest non-pending value.
        let previous = match previous {
            Some(Value {
                kind: ValueKind::ServerTimestamp { previous, .. },
            }) => previous,
            other => other.map(Box::new),
        };
        Self::with_kind(ValueKind::ServerTimestamp {
            local_write_time,
            previous,
        })
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn into_kind(self) -> ValueKind {
        self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self.kind, ValueKind::Sentinel(_))
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value),
            _ => None,
        }
    }

    /// Numeric value widened to `f64`.
    pub fn as_double(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value as f64),
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.kind {
            ValueKind::Boolean(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match &self.kind {
            ValueKind::Array(array) => Some(array.values()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&DocumentKey> {
        match &self.kind {
            ValueKind::Reference(key) => Some(key),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::from_bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::from_integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::from_integer(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::from_double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::from_string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::from_string(value)
    }
}

impl From<Timestamp> for Value {
    fn from(value: Timestamp) -> Self {
        Value::from_timestamp(value)
    }
}

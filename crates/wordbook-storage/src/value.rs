//! Bound parameter and column value types
//!
//! Callers hand the database host-side shapes (absent values, booleans,
//! timestamps, possibly NaN floats). Neither engine binds all of those the
//! same way, so [`normalize`] rewrites a parameter list into the subset every
//! engine accepts before it reaches an adapter.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{Serialize, Serializer};

/// A value bound to a statement parameter or read back from a result column.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// No value supplied by the caller. Normalizes to [`Value::Null`].
    Absent,
    /// SQL NULL.
    Null,
    /// Boolean flag. Normalizes to `0` / `1`.
    Bool(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// Double precision float. NaN normalizes to [`Value::Null`].
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Binary blob.
    Blob(Vec<u8>),
    /// Point in time. Normalizes to an ISO-8601 UTC string.
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Rewrites this value into a shape both engines bind identically.
    pub fn normalized(self) -> Value {
        match self {
            Value::Absent => Value::Null,
            Value::Real(f) if f.is_nan() => Value::Null,
            Value::Bool(b) => Value::Integer(i64::from(b)),
            Value::Timestamp(t) => Value::Text(format_timestamp(&t)),
            other => other,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Absent)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }
}

/// Normalizes a parameter list. Idempotent.
pub fn normalize(params: &[Value]) -> Vec<Value> {
    params.iter().cloned().map(Value::normalized).collect()
}

/// ISO-8601 with millisecond precision and a `Z` suffix.
pub(crate) fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Absent | Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Real(f) if f.is_nan() => ToSqlOutput::Owned(SqlValue::Null),
            Value::Real(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::Timestamp(t) => ToSqlOutput::Owned(SqlValue::Text(format_timestamp(t))),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Absent | Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Real(f) if f.is_nan() => serializer.serialize_none(),
            Value::Real(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Blob(b) => serializer.serialize_bytes(b),
            Value::Timestamp(t) => serializer.serialize_str(&format_timestamp(t)),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Absent, Into::into)
    }
}

/// Builds an owned parameter list.
///
/// Usage: `params![1_i64, "text", None::<String>, true]`
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($val:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($val)),+]
    };
}

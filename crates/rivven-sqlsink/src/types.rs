//! Record and parameter types for rivven-sqlsink
//!
//! - [`FieldValue`]: the closed set of value types a record field can hold
//! - [`Record`]: an insertion-ordered set of named fields
//! - [`Param`]: a positional statement parameter produced by the binder
//! - [`SensitiveString`]: a string that never shows up in logs

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use crate::error::{Error, Result};

/// Name of the conventional event timestamp field
pub const TIMESTAMP_FIELD: &str = "@timestamp";

/// Format used when binding timestamps as text.
///
/// Millisecond precision: anything finer is truncated when bound.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// A record field value
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Point in time
    Timestamp(DateTime<Utc>),
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point
    Float(f64),
    /// UTF-8 text
    Text(String),
    /// Boolean
    Boolean(bool),
    /// Absent or null
    Null,
}

impl FieldValue {
    /// Render as text, `None` for null.
    ///
    /// Timestamps render as RFC 3339 with millisecond precision.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Self::Timestamp(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Self::Integer(n) => Some(n.to_string()),
            Self::Float(n) => Some(n.to_string()),
            Self::Text(s) => Some(s.clone()),
            Self::Boolean(b) => Some(b.to_string()),
            Self::Null => None,
        }
    }

    /// Convert a JSON value. Nested objects and arrays are kept as compact JSON text.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Boolean(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Integer(i)
                } else if let Some(f) = n.as_f64() {
                    Self::Float(f)
                } else {
                    Self::Text(n.to_string())
                }
            }
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                Self::Text(value.to_string())
            }
        }
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Timestamp(ts) => {
                serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
            Self::Integer(n) => serializer.serialize_i64(*n),
            Self::Float(n) => serializer.serialize_f64(*n),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Null => serializer.serialize_none(),
        }
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Integer(i64::from(v))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_owned())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// A structured record, fields kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    /// Field names
    names: Vec<String>,
    /// Field values (same order as names)
    values: Vec<FieldValue>,
}

impl Record {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a field. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        let name = name.into();
        let value = value.into();
        match self.names.iter().position(|n| *n == name) {
            Some(idx) => self.values[idx] = value,
            None => {
                self.names.push(name);
                self.values.push(value);
            }
        }
    }

    /// Get a field by exact name
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|idx| self.values.get(idx))
    }

    /// Get a field, treating a missing field as null
    pub fn value(&self, name: &str) -> &FieldValue {
        self.get(name).unwrap_or(&FieldValue::Null)
    }

    /// The record's `@timestamp`, if it holds a timestamp
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self.get(TIMESTAMP_FIELD) {
            Some(FieldValue::Timestamp(ts)) => Some(*ts),
            _ => None,
        }
    }

    /// Field count
    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if the record has no fields
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Iterate fields in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.names.iter().map(String::as_str).zip(self.values.iter())
    }

    /// Build a record from a JSON object.
    ///
    /// `@timestamp` is parsed as RFC 3339 when it is a string.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let serde_json::Value::Object(map) = value else {
            return Err(Error::decode("record must be a JSON object"));
        };

        let mut record = Self::new();
        for (name, value) in &map {
            let field = match (name.as_str(), value) {
                (TIMESTAMP_FIELD, serde_json::Value::String(s)) => {
                    match DateTime::parse_from_rfc3339(s) {
                        Ok(ts) => FieldValue::Timestamp(ts.with_timezone(&Utc)),
                        Err(_) => FieldValue::Text(s.clone()),
                    }
                }
                _ => FieldValue::from_json(value),
            };
            record.insert(name.as_str(), field);
        }
        Ok(record)
    }

    /// Parse one line of newline-delimited JSON
    pub fn from_json_str(line: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| Error::decode(e.to_string()))?;
        Self::from_json(value)
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => write!(f, "{:?}", self),
        }
    }
}

/// A positional statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// Bound as a string
    Text(String),
    /// Bound as a 64-bit integer
    Integer(i64),
    /// Bound as a double
    Float(f64),
    /// Bound as a boolean
    Boolean(bool),
    /// SQL NULL
    Null,
}

/// A string that is redacted in `Debug`, `Display` and serialized output.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

impl JsonSchema for SensitiveString {
    fn schema_name() -> String {
        "SensitiveString".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = gen.subschema_for::<String>();
        if let schemars::schema::Schema::Object(obj) = &mut schema {
            obj.format = Some("password".to_string());
        }
        schema
    }
}

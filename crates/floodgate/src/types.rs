//! Value types for floodgate
//!
//! A compact SQL value model: enough for the pool to bind parameters by
//! inferred type and for drivers to hand rows back. Full relational type
//! fidelity (decimals, temporal types, ranges) belongs to the driver
//! implementations behind the [`crate::driver::Driver`] seam.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// SQL value that can be bound as a parameter or returned in a row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Text string (VARCHAR, TEXT)
    String(String),
    /// Binary data (BYTEA, BLOB)
    Bytes(Vec<u8>),
    /// UUID
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::Float64(_) => "DOUBLE PRECISION",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "BYTEA",
            Self::Uuid(_) => "UUID",
            Self::Json(_) => "JSONB",
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            _ => None,
        }
    }

    /// Try to convert to a string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Approximate wire size in bytes, used by the DoS guard
    pub fn size_hint(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int32(_) => 4,
            Self::Int64(_) | Self::Float64(_) => 8,
            Self::String(s) => s.len(),
            Self::Bytes(b) => b.len(),
            Self::Uuid(_) => 16,
            Self::Json(j) => j.to_string().len(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Self::Null,
        }
    }
}

/// A row returned from a query: column name to value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<String>,
    values: HashMap<String, Value>,
}

impl Row {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column value, preserving column order
    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        let column = column.into();
        if !self.values.contains_key(&column) {
            self.columns.push(column.clone());
        }
        self.values.insert(column, value);
    }

    /// Get a value by column name
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Column names in result order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, value) in iter {
            row.push(column, value);
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(42_i32).as_i64(), Some(42));
        assert_eq!(Value::from(42_i64).as_i64(), Some(42));
        assert_eq!(Value::from("7").as_i64(), Some(7));
        assert_eq!(Value::from(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert_eq!(Value::from("hello").as_str(), Some("hello"));
        assert!(Value::from(None::<i64>).is_null());
    }

    #[test]
    fn test_value_sql_type() {
        assert_eq!(Value::Null.sql_type(), "NULL");
        assert_eq!(Value::Int64(1).sql_type(), "BIGINT");
        assert_eq!(Value::String("x".into()).sql_type(), "VARCHAR");
        assert_eq!(Value::Bytes(vec![1]).sql_type(), "BYTEA");
    }

    #[test]
    fn test_value_size_hint() {
        assert_eq!(Value::Null.size_hint(), 0);
        assert_eq!(Value::Int64(9).size_hint(), 8);
        assert_eq!(Value::String("abcd".into()).size_hint(), 4);
        assert_eq!(Value::Bytes(vec![0; 32]).size_hint(), 32);
    }

    #[test]
    fn test_row_order_and_lookup() {
        let mut row = Row::new();
        row.push("id", Value::Int64(1));
        row.push("name", Value::from("alice"));

        assert_eq!(row.len(), 2);
        assert_eq!(row.columns(), &["id".to_string(), "name".to_string()]);
        assert_eq!(row.get("name").and_then(Value::as_str), Some("alice"));
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn test_row_from_iterator() {
        let row: Row = vec![
            ("a".to_string(), Value::Int32(1)),
            ("b".to_string(), Value::Bool(false)),
        ]
        .into_iter()
        .collect();

        assert_eq!(row.len(), 2);
        assert_eq!(row.get("b").and_then(Value::as_bool), Some(false));
    }
}

//! Scalar values exchanged between records, conditions and storage
//!
//! `Value` is the closed union every cell in the engine is expressed in.
//! Comparison and coercion are always driven by the column's declared
//! [`ColumnKind`], never by the runtime variant alone: a `Number` column
//! compares `Int` and `Decimal` operands numerically, but a `Text` column
//! never silently compares against a number.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::metadata::ColumnKind;

/// A single scalar cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Decimal(Decimal),
    Text(String),
    DateTime(DateTime<Utc>),
    Bytes(Vec<u8>),
}

impl Value {
    /// The zero value a lazily-resolved field falls back to on failure.
    pub const fn zero() -> Self {
        Self::Null
    }

    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Decimal(_) => "decimal",
            Self::Text(_) => "text",
            Self::DateTime(_) => "datetime",
            Self::Bytes(_) => "bytes",
        }
    }

    /// Whether this value can be stored in (or compared against) a column of
    /// the given declared kind. `Null` is compatible with every kind; the
    /// nullable flag is enforced separately at save time.
    pub fn coercible_to(&self, kind: &ColumnKind) -> bool {
        match (self, kind) {
            (Self::Null, _) => true,
            (Self::Int(_) | Self::Decimal(_), ColumnKind::Number | ColumnKind::Decimal { .. }) => {
                true
            }
            (Self::Bool(_), ColumnKind::Boolean) => true,
            (Self::Text(_), ColumnKind::Text | ColumnKind::Custom) => true,
            (Self::DateTime(_), ColumnKind::DateTime) => true,
            (Self::Bytes(_), ColumnKind::Binary) => true,
            _ => false,
        }
    }

    /// Numeric view of the value, used when the declared kind is numeric.
    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Int(n) => Some(Decimal::from(*n)),
            Self::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    /// Compare two values under a column's declared kind.
    ///
    /// Returns `None` when either side is `Null` or does not coerce to the
    /// declared kind; callers treat `None` as SQL's "unknown".
    pub fn compare(&self, other: &Self, kind: &ColumnKind) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        match kind {
            ColumnKind::Number | ColumnKind::Decimal { .. } => {
                Some(self.as_decimal()?.cmp(&other.as_decimal()?))
            }
            ColumnKind::Boolean => match (self, other) {
                (Self::Bool(a), Self::Bool(b)) => Some(a.cmp(b)),
                _ => None,
            },
            ColumnKind::DateTime => match (self, other) {
                (Self::DateTime(a), Self::DateTime(b)) => Some(a.cmp(b)),
                _ => None,
            },
            ColumnKind::Binary => match (self, other) {
                (Self::Bytes(a), Self::Bytes(b)) => Some(a.cmp(b)),
                _ => None,
            },
            ColumnKind::Text | ColumnKind::Custom => match (self, other) {
                (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
                _ => None,
            },
        }
    }

    /// Whether two values are equal under a column's declared kind.
    pub fn equals(&self, other: &Self, kind: &ColumnKind) -> bool {
        self.compare(other, kind) == Some(Ordering::Equal)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Decimal(d) => write!(f, "{d}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::DateTime(t) => write!(f, "{}", t.to_rfc3339()),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

//! Cell values and column types.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const DATE_FORMAT: &str = "%Y-%m-%d";

const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
];

/// A single cell of a [`Frame`](super::Frame).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Missing value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// Free text.
    Text(String),
    /// Calendar date.
    Date(NaiveDate),
    /// Date and time without timezone.
    Timestamp(NaiveDateTime),
}

/// Column types a [`Value`] can be cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// Boolean.
    Bool,
    /// 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Free text.
    Text,
    /// Calendar date.
    Date,
    /// Date and time.
    Timestamp,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Text => write!(f, "text"),
            Self::Date => write!(f, "date"),
            Self::Timestamp => write!(f, "timestamp"),
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(Self::Bool),
            "int" | "int64" | "integer" => Ok(Self::Int),
            "float" | "float64" | "double" => Ok(Self::Float),
            "text" | "str" | "string" => Ok(Self::Text),
            "date" => Ok(Self::Date),
            "timestamp" | "datetime" => Ok(Self::Timestamp),
            other => Err(Error::invalid_argument(format!("unknown dtype: {other}"))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s}"),
            Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
            Self::Timestamp(ts) => write!(f, "{ts}"),
        }
    }
}

impl Value {
    /// Check whether the value is missing. NaN floats count as missing.
    #[must_use]
    pub fn is_null(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Float(x) => x.is_nan(),
            _ => false,
        }
    }

    /// The type of a non-null value.
    #[must_use]
    pub fn dtype(&self) -> Option<DType> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(DType::Bool),
            Self::Int(_) => Some(DType::Int),
            Self::Float(_) => Some(DType::Float),
            Self::Text(_) => Some(DType::Text),
            Self::Date(_) => Some(DType::Date),
            Self::Timestamp(_) => Some(DType::Timestamp),
        }
    }

    /// Numeric view of the value.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(x) if !x.is_nan() => Some(*x),
            _ => None,
        }
    }

    /// A hashable key for grouping and duplicate detection.
    ///
    /// Keys carry a type tag, so `Int(1)` and `Text("1")` differ. Integers
    /// and whole floats share the numeric tag and compare equal. Missing
    /// values share one key.
    #[must_use]
    pub fn group_key(&self) -> String {
        match self {
            Self::Null => "null".to_string(),
            Self::Float(_) if self.is_null() => "null".to_string(),
            Self::Bool(b) => format!("b:{b}"),
            Self::Int(i) => format!("n:{i}"),
            Self::Float(x) => match float_to_int(*x) {
                Some(i) => format!("n:{i}"),
                None => format!("n:{x}"),
            },
            Self::Text(s) => format!("s:{s}"),
            Self::Date(d) => format!("d:{}", d.format(DATE_FORMAT)),
            Self::Timestamp(ts) => format!("t:{ts}"),
        }
    }

    /// Convert the value to another type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cast`] if the value has no representation in `dtype`.
    pub fn cast(&self, dtype: DType) -> Result<Self> {
        if self.is_null() {
            return Ok(Self::Null);
        }
        let cast = match (dtype, self) {
            (DType::Text, value) => Some(Self::Text(value.to_string())),
            (DType::Int, Self::Int(i)) => Some(Self::Int(*i)),
            (DType::Int, Self::Float(x)) => float_to_int(*x).map(Self::Int),
            (DType::Int, Self::Bool(b)) => Some(Self::Int(i64::from(*b))),
            (DType::Int, Self::Text(s)) => parse_int(s).map(Self::Int),
            (DType::Float, Self::Bool(b)) => Some(Self::Float(f64::from(u8::from(*b)))),
            (DType::Float, Self::Text(s)) => s.trim().parse().ok().map(Self::Float),
            (DType::Float, value) => value.as_f64().map(Self::Float),
            (DType::Bool, Self::Bool(b)) => Some(Self::Bool(*b)),
            (DType::Bool, Self::Int(0)) => Some(Self::Bool(false)),
            (DType::Bool, Self::Int(1)) => Some(Self::Bool(true)),
            (DType::Bool, Self::Text(s)) => parse_bool(s).map(Self::Bool),
            (DType::Date, Self::Date(d)) => Some(Self::Date(*d)),
            (DType::Date, Self::Timestamp(ts)) => Some(Self::Date(ts.date())),
            (DType::Date, Self::Text(s)) => parse_timestamp(s).map(|ts| Self::Date(ts.date())),
            (DType::Timestamp, Self::Timestamp(ts)) => Some(Self::Timestamp(*ts)),
            (DType::Timestamp, Self::Date(d)) => Some(Self::Timestamp(d.and_time(NaiveTime::MIN))),
            (DType::Timestamp, Self::Text(s)) => parse_timestamp(s).map(Self::Timestamp),
            _ => None,
        };
        cast.ok_or_else(|| Error::Cast {
            value: self.to_string(),
            dtype: dtype.to_string(),
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn float_to_int(x: f64) -> Option<i64> {
    // Outside this range the cast saturates
    let in_range = x >= i64::MIN as f64 && x < i64::MAX as f64;
    (x.is_finite() && x.fract() == 0.0 && in_range).then_some(x as i64)
}

fn parse_int(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse()
        .ok()
        .or_else(|| s.parse::<f64>().ok().and_then(float_to_int))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" => Some(true),
        "f" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, DATE_FORMAT)
                .ok()
                .map(|d| d.and_time(NaiveTime::MIN))
        })
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

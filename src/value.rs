//! Tagged values shared by filters, write payloads and decoded rows.
//!
//! Every value crossing the store boundary is one of a small closed set of
//! variants. Filters are validated against these variants when they are
//! compiled, so a malformed filter fails the same way on every backend.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Text layout used for timestamps stored as text (`YYYY-MM-DD HH:MM:SS`).
pub const TIMESTAMP_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Layout used when writing timestamps; keeps microseconds so round trips
/// through text columns stay lossless.
pub const TIMESTAMP_WRITE_LAYOUT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A storage value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::List(_) => "list",
        }
    }

    /// Whether this value can sit on either side of an ordering comparison.
    pub fn is_comparable_scalar(&self) -> bool {
        matches!(
            self,
            Value::Int(_) | Value::Float(_) | Value::Text(_) | Value::Bytes(_) | Value::Timestamp(_)
        )
    }

    /// True for values a backend would never generate as a key: null, zero, empty text.
    pub fn is_unset_key(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Int(i) => *i == 0,
            Value::Text(s) => s.is_empty(),
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => f.write_str(&String::from_utf8_lossy(b)),
            Value::Timestamp(t) => f.write_str(&format_timestamp(t)),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                f.write_str("]")
            }
        }
    }
}

/// Format a timestamp for text storage.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.format(TIMESTAMP_WRITE_LAYOUT).to_string()
}

/// Parse a timestamp stored as text.
///
/// Accepts the fixed layout, the same layout with fractional seconds and
/// RFC 3339.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, TIMESTAMP_LAYOUT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|ndt| ndt.and_utc())
        .ok()
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(v as i64)
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
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

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl From<uuid::Uuid> for Value {
    fn from(v: uuid::Uuid) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Value {
    fn from(v: [T; N]) -> Self {
        Value::List(v.into_iter().map(Into::into).collect())
    }
}

impl From<Value> for bson::Bson {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => bson::Bson::Null,
            Value::Bool(b) => bson::Bson::Boolean(b),
            Value::Int(i) => bson::Bson::Int64(i),
            Value::Float(f) => bson::Bson::Double(f),
            Value::Text(s) => bson::Bson::String(s),
            Value::Bytes(bytes) => bson::Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes,
            }),
            Value::Timestamp(t) => {
                bson::Bson::DateTime(bson::DateTime::from_millis(t.timestamp_millis()))
            }
            Value::List(items) => bson::Bson::Array(items.into_iter().map(Into::into).collect()),
        }
    }
}

impl From<bson::Bson> for Value {
    fn from(b: bson::Bson) -> Self {
        use bson::Bson;

        match b {
            Bson::Null | Bson::Undefined => Value::Null,
            Bson::Boolean(b) => Value::Bool(b),
            Bson::Int32(i) => Value::Int(i as i64),
            Bson::Int64(i) => Value::Int(i),
            Bson::Double(f) => Value::Float(f),
            Bson::String(s) => Value::Text(s),
            Bson::Binary(bin) => Value::Bytes(bin.bytes),
            Bson::DateTime(dt) => DateTime::<Utc>::from_timestamp_millis(dt.timestamp_millis())
                .map(Value::Timestamp)
                .unwrap_or(Value::Null),
            Bson::Array(items) => Value::List(items.into_iter().map(Into::into).collect()),
            Bson::ObjectId(oid) => Value::Text(oid.to_hex()),
            Bson::Symbol(s) => Value::Text(s),
            Bson::RegularExpression(re) => Value::Text(re.pattern),
            Bson::Timestamp(ts) => Value::Int(ts.time as i64),
            other => Value::Text(other.into_relaxed_extjson().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_timestamp_layouts() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();

        assert_eq!(parse_timestamp("2024-03-09 14:05:07"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-09T14:05:07Z"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-03-09 14:05:07.250000"),
            Some(expected + chrono::Duration::milliseconds(250))
        );
        assert_eq!(parse_timestamp("09/03/2024"), None);
    }

    #[test]
    fn test_timestamp_text_round_trip_keeps_micros() {
        let t = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(parse_timestamp(&format_timestamp(&t)), Some(t));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(5u8), Value::Int(5));
        assert_eq!(Value::from(None::<i32>), Value::Null);
        assert_eq!(
            Value::from(vec!["a", "b"]),
            Value::List(vec![Value::Text("a".into()), Value::Text("b".into())])
        );
        assert_eq!(Value::from([25, 35]), Value::List(vec![Value::Int(25), Value::Int(35)]));
    }

    #[test]
    fn test_bson_conversion() {
        let t = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(Value::from(bson::Bson::from(Value::Timestamp(t))), Value::Timestamp(t));
        assert_eq!(bson::Bson::from(Value::Int(4)), bson::Bson::Int64(4));
        assert_eq!(Value::from(bson::Bson::Int32(4)), Value::Int(4));
        assert_eq!(
            Value::from(bson::Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: vec![1, 2],
            })),
            Value::Bytes(vec![1, 2])
        );
    }

    #[test]
    fn test_unset_key() {
        assert!(Value::Int(0).is_unset_key());
        assert!(Value::Text(String::new()).is_unset_key());
        assert!(Value::Null.is_unset_key());
        assert!(!Value::Int(7).is_unset_key());
    }
}

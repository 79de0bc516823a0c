//! Conversions between field types and [`Value`].
//!
//! Backends hand back loosely typed data: SQLite stores booleans as 0/1
//! integers and timestamps as text, drivers may return numerals as bytes.
//! [`FromValue`] accepts all of those shapes for each field type:
//!
//! | Field type | Accepted values |
//! |---|---|
//! | `bool` | bool, 0/1 integers, `"0"`/`"1"`/`"true"`/`"false"` (any case) |
//! | integers, floats | numbers, decimal numerals as text or bytes |
//! | `DateTime<Utc>` | timestamps, text in `YYYY-MM-DD HH:MM:SS` (or RFC 3339) |
//! | `Option<T>` | null → `None`, anything else coerced into `T` |
//!
//! Types with their own string form (status enums and the like) plug in
//! through [`from_str_value`]/[`display_value`], which `#[derive(Entity)]`
//! uses for fields marked `#[store(from_str)]`.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;

use crate::value::{Value, format_timestamp, parse_timestamp};

/// A value could not be converted into a field's type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoercionError {
    #[error("cannot convert {found} into {target}")]
    Mismatch { target: &'static str, found: String },

    #[error("cannot parse {input:?} as {target}: {message}")]
    Parse {
        target: &'static str,
        input: String,
        message: String,
    },

    #[error("{value} is out of range for {target}")]
    OutOfRange { target: &'static str, value: String },

    #[error("no mapped field named `{0}`")]
    UnknownField(String),
}

impl CoercionError {
    pub fn unknown_field(name: &str) -> Self {
        Self::UnknownField(name.to_string())
    }

    fn mismatch(target: &'static str, found: &Value) -> Self {
        Self::Mismatch {
            target,
            found: found.kind().to_string(),
        }
    }
}

/// Conversion from a stored value into a field type.
pub trait FromValue: Sized {
    fn from_value(value: Value) -> Result<Self, CoercionError>;
}

/// Conversion from a field into a storable value.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

/// Textual view of text or byte values, trimmed.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(s.trim().to_string()),
        Value::Bytes(b) => std::str::from_utf8(b).ok().map(|s| s.trim().to_string()),
        _ => None,
    }
}

impl FromValue for bool {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Ok(false),
            Value::Bool(b) => Ok(b),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            Value::Int(i) => Err(CoercionError::OutOfRange {
                target: "bool",
                value: i.to_string(),
            }),
            ref other => match text_of(other) {
                Some(s) => match s.to_ascii_lowercase().as_str() {
                    "1" | "true" => Ok(true),
                    "0" | "false" => Ok(false),
                    _ => Err(CoercionError::Parse {
                        target: "bool",
                        input: s,
                        message: "expected 0, 1, true or false".to_string(),
                    }),
                },
                None => Err(CoercionError::mismatch("bool", other)),
            },
        }
    }
}

impl ToValue for bool {
    fn to_value(&self) -> Value {
        Value::Bool(*self)
    }
}

fn parse_i64(value: Value, target: &'static str) -> Result<i64, CoercionError> {
    match value {
        Value::Null => Ok(0),
        Value::Int(i) => Ok(i),
        Value::Bool(b) => Ok(b as i64),
        Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
        Value::Float(f) => Err(CoercionError::OutOfRange {
            target,
            value: f.to_string(),
        }),
        ref other => match text_of(other) {
            Some(s) => s.parse::<i64>().map_err(|e| CoercionError::Parse {
                target,
                input: s,
                message: e.to_string(),
            }),
            None => Err(CoercionError::mismatch(target, other)),
        },
    }
}

macro_rules! impl_integer {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Result<Self, CoercionError> {
                    let wide = parse_i64(value, stringify!($t))?;
                    <$t>::try_from(wide).map_err(|_| CoercionError::OutOfRange {
                        target: stringify!($t),
                        value: wide.to_string(),
                    })
                }
            }

            impl ToValue for $t {
                fn to_value(&self) -> Value {
                    Value::Int(*self as i64)
                }
            }
        )*
    };
}

impl_integer!(i8, i16, i32, i64, u8, u16, u32);

// Values above `i64::MAX` travel as decimal text.
macro_rules! impl_wide_unsigned {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: Value) -> Result<Self, CoercionError> {
                    if let Some(s) = text_of(&value) {
                        return s.parse::<$t>().map_err(|e| CoercionError::Parse {
                            target: stringify!($t),
                            input: s,
                            message: e.to_string(),
                        });
                    }
                    let wide = parse_i64(value, stringify!($t))?;
                    <$t>::try_from(wide).map_err(|_| CoercionError::OutOfRange {
                        target: stringify!($t),
                        value: wide.to_string(),
                    })
                }
            }

            impl ToValue for $t {
                fn to_value(&self) -> Value {
                    i64::try_from(*self)
                        .map(Value::Int)
                        .unwrap_or_else(|_| Value::Text(self.to_string()))
                }
            }
        )*
    };
}

impl_wide_unsigned!(u64, usize);

fn parse_f64(value: Value, target: &'static str) -> Result<f64, CoercionError> {
    match value {
        Value::Null => Ok(0.0),
        Value::Float(f) => Ok(f),
        Value::Int(i) => Ok(i as f64),
        ref other => match text_of(other) {
            Some(s) => s.parse::<f64>().map_err(|e| CoercionError::Parse {
                target,
                input: s,
                message: e.to_string(),
            }),
            None => Err(CoercionError::mismatch(target, other)),
        },
    }
}

impl FromValue for f64 {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        parse_f64(value, "f64")
    }
}

impl ToValue for f64 {
    fn to_value(&self) -> Value {
        Value::Float(*self)
    }
}

impl FromValue for f32 {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        parse_f64(value, "f32").map(|f| f as f32)
    }
}

impl ToValue for f32 {
    fn to_value(&self) -> Value {
        Value::Float(*self as f64)
    }
}

impl FromValue for String {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Ok(String::new()),
            Value::Text(s) => Ok(s),
            Value::Bytes(b) => String::from_utf8(b).map_err(|e| CoercionError::Parse {
                target: "String",
                input: "<bytes>".to_string(),
                message: e.to_string(),
            }),
            Value::List(_) => Err(CoercionError::Mismatch {
                target: "String",
                found: "list".to_string(),
            }),
            Value::Timestamp(t) => Ok(format_timestamp(&t)),
            other => Ok(other.to_string()),
        }
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Ok(Vec::new()),
            Value::Bytes(b) => Ok(b),
            Value::Text(s) => Ok(s.into_bytes()),
            other => Err(CoercionError::mismatch("bytes", &other)),
        }
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytes(self.clone())
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Ok(DateTime::<Utc>::default()),
            Value::Timestamp(t) => Ok(t),
            ref other => match text_of(other) {
                Some(s) => parse_timestamp(&s).ok_or_else(|| CoercionError::Parse {
                    target: "DateTime<Utc>",
                    input: s,
                    message: "expected YYYY-MM-DD HH:MM:SS".to_string(),
                }),
                None => Err(CoercionError::mismatch("DateTime<Utc>", other)),
            },
        }
    }
}

impl ToValue for DateTime<Utc> {
    fn to_value(&self) -> Value {
        Value::Timestamp(*self)
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        DateTime::<Utc>::from_value(value).map(|t| t.naive_utc())
    }
}

impl ToValue for NaiveDateTime {
    fn to_value(&self) -> Value {
        Value::Timestamp(self.and_utc())
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Ok(uuid::Uuid::nil()),
            ref other => match text_of(other) {
                Some(s) => uuid::Uuid::parse_str(&s).map_err(|e| CoercionError::Parse {
                    target: "Uuid",
                    input: s,
                    message: e.to_string(),
                }),
                None => Err(CoercionError::mismatch("Uuid", other)),
            },
        }
    }
}

impl ToValue for uuid::Uuid {
    fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self, CoercionError> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        match self {
            Some(v) => v.to_value(),
            None => Value::Null,
        }
    }
}

/// Coerce into a type that parses itself from text.
///
/// Null yields the type's default.
pub fn from_str_value<T>(value: Value) -> Result<T, CoercionError>
where
    T: FromStr + Default,
    T::Err: Display,
{
    match value {
        Value::Null => Ok(T::default()),
        other => {
            let text = String::from_value(other)?;
            text.trim().parse::<T>().map_err(|e| CoercionError::Parse {
                target: std::any::type_name::<T>(),
                input: text,
                message: e.to_string(),
            })
        }
    }
}

/// Optional variant of [`from_str_value`]: null stays `None`.
pub fn from_str_value_opt<T>(value: Value) -> Result<Option<T>, CoercionError>
where
    T: FromStr + Default,
    T::Err: Display,
{
    match value {
        Value::Null => Ok(None),
        other => from_str_value(other).map(Some),
    }
}

/// Store a type through its string form.
pub fn display_value<T: Display>(value: &T) -> Value {
    Value::Text(value.to_string())
}

/// Optional variant of [`display_value`].
pub fn display_value_opt<T: Display>(value: &Option<T>) -> Value {
    match value {
        Some(v) => display_value(v),
        None => Value::Null,
    }
}

//! Operator-suffixed filters.
//!
//! A filter is a mapping from raw keys to values. The key names a field and,
//! after a `__` separator, an operator:
//!
//! | Key | Predicate |
//! |---|---|
//! | `name` | equals |
//! | `name__not` | not equals |
//! | `age__gt`, `age__gte`, `age__lt`, `age__lte` | ordering comparison |
//! | `name__like`, `name__not_like` | pattern match (caller supplies `%`/`_`) |
//! | `name__ilike` | case-insensitive pattern match |
//! | `age__in` | membership in a list |
//! | `name__is_null`, `name__is_not_null` | nullability (value ignored) |
//!
//! Keys are kept sorted so compiled predicates are identical for identical
//! input. The same [`Filter`] compiles to SQL ([`sql`]) and to document
//! predicates ([`document`]); both validate it through
//! [`Filter::expressions`] first.

pub mod document;
pub mod sql;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{StoreError, StoreResult};
use crate::value::Value;

/// Separator between the field name and the operator suffix.
pub const OPERATOR_SEPARATOR: &str = "__";

/// Comparison applied by a filter key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    NotLike,
    In,
    IsNull,
    IsNotNull,
}

impl Operator {
    /// Operator named by a key suffix, if recognized.
    pub fn from_suffix(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "not" => Operator::Neq,
            "gt" => Operator::Gt,
            "gte" => Operator::Gte,
            "lt" => Operator::Lt,
            "lte" => Operator::Lte,
            "like" => Operator::Like,
            "ilike" => Operator::ILike,
            "not_like" => Operator::NotLike,
            "in" => Operator::In,
            "is_null" => Operator::IsNull,
            "is_not_null" => Operator::IsNotNull,
            _ => return None,
        })
    }

    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Operator::Eq => None,
            Operator::Neq => Some("not"),
            Operator::Gt => Some("gt"),
            Operator::Gte => Some("gte"),
            Operator::Lt => Some("lt"),
            Operator::Lte => Some("lte"),
            Operator::Like => Some("like"),
            Operator::ILike => Some("ilike"),
            Operator::NotLike => Some("not_like"),
            Operator::In => Some("in"),
            Operator::IsNull => Some("is_null"),
            Operator::IsNotNull => Some("is_not_null"),
        }
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte)
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Operator::Like | Operator::ILike | Operator::NotLike)
    }

    /// Nullability checks take no operand.
    pub fn is_unary(&self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix().unwrap_or("eq"))
    }
}

/// One parsed filter key.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterExpression {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl FilterExpression {
    /// Split `key` at the first `__`.
    ///
    /// Never fails: a key without a separator, or with a suffix that is not
    /// an operator, is an equality test on the whole key. `first__name` is
    /// therefore the field `first__name`, while `a__b__c` looks for the
    /// operator `b__c` and so also falls back to the whole key.
    pub fn parse(key: &str, value: Value) -> Self {
        if let Some((field, suffix)) = key.split_once(OPERATOR_SEPARATOR) {
            if let Some(operator) = Operator::from_suffix(suffix) {
                return Self {
                    field: field.to_string(),
                    operator,
                    value,
                };
            }
        }

        Self {
            field: key.to_string(),
            operator: Operator::Eq,
            value,
        }
    }

    /// Check that the value fits the operator.
    pub fn validate(&self) -> StoreResult<()> {
        let value = &self.value;
        let op = self.operator;

        let problem = if op.is_ordering() && !value.is_comparable_scalar() {
            Some(format!("`{}` needs a number, text or timestamp, got {}", op, value.kind()))
        } else if op.is_pattern() && !matches!(value, Value::Text(_)) {
            Some(format!("`{}` needs a text pattern, got {}", op, value.kind()))
        } else if op == Operator::In && !matches!(value, Value::List(_)) {
            Some(format!("`in` needs a list, got {}", value.kind()))
        } else if matches!(op, Operator::Eq | Operator::Neq) && matches!(value, Value::List(_)) {
            Some(format!("`{}` cannot compare against a list", op))
        } else if let (Operator::In, Value::List(items)) = (op, value) {
            items
                .iter()
                .any(|item| matches!(item, Value::List(_)))
                .then(|| "`in` list elements must be scalars".to_string())
        } else {
            None
        };

        match problem {
            Some(message) => Err(StoreError::type_mismatch(&self.field, message)),
            None => Ok(()),
        }
    }
}

/// Field/operator keys mapped to values, iterated in key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    entries: BTreeMap<String, Value>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, replacing any previous value for it.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Parse and validate every key, in key order.
    pub fn expressions(&self) -> StoreResult<Vec<FilterExpression>> {
        self.entries
            .iter()
            .map(|(key, value)| {
                let expr = FilterExpression::parse(key, value.clone());
                expr.validate()?;
                Ok(expr)
            })
            .collect()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Filter {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl<K: Into<String>, V: Into<Value>, const N: usize> From<[(K, V); N]> for Filter {
    fn from(pairs: [(K, V); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// Build a [`Filter`] from `key => value` pairs.
///
/// ```rust,ignore
/// let adults = filter! { "age__gte" => 18, "name__is_not_null" => true };
/// ```
#[macro_export]
macro_rules! filter {
    () => { $crate::filter::Filter::new() };
    ($($key:expr => $value:expr),+ $(,)?) => {
        $crate::filter::Filter::new()$(.with($key, $value))+
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_parse_suffixes() {
        let expr = FilterExpression::parse("age__gte", Value::Int(30));
        assert_eq!(expr.field, "age");
        assert_eq!(expr.operator, Operator::Gte);

        let expr = FilterExpression::parse("name__not_like", Value::from("%x%"));
        assert_eq!(expr.field, "name");
        assert_eq!(expr.operator, Operator::NotLike);

        let expr = FilterExpression::parse("name", Value::from("x"));
        assert_eq!(expr.operator, Operator::Eq);
    }

    #[test]
    fn test_unrecognized_suffix_is_equality_on_whole_key() {
        let expr = FilterExpression::parse("first__name", Value::from("Ana"));
        assert_eq!(expr.field, "first__name");
        assert_eq!(expr.operator, Operator::Eq);

        let expr = FilterExpression::parse("a__in__b", Value::Int(1));
        assert_eq!(expr.field, "a__in__b");
        assert_eq!(expr.operator, Operator::Eq);
    }

    #[test]
    fn test_validation_rejects_bad_shapes() {
        let bad = [
            ("age__gt", Value::Null),
            ("age__lte", Value::Bool(true)),
            ("age__gte", Value::from(vec![1, 2])),
            ("name__like", Value::Int(3)),
            ("age__in", Value::Int(3)),
            ("age", Value::from(vec![1])),
            ("age__in", Value::List(vec![Value::List(vec![])])),
        ];

        for (key, value) in bad {
            let filter = Filter::new().with(key, value);
            assert_matches!(filter.expressions(), Err(StoreError::TypeMismatch { .. }), "{}", key);
        }
    }

    #[test]
    fn test_null_predicates_accept_any_value() {
        let filter = Filter::new()
            .with("name__is_null", true)
            .with("email__is_not_null", Value::Null);
        assert_eq!(filter.expressions().unwrap().len(), 2);
    }

    #[test]
    fn test_expressions_are_key_ordered() {
        let filter: Filter = [("name", Value::from("x")), ("age", Value::Int(1))].into();
        let fields: Vec<_> = filter.expressions().unwrap().into_iter().map(|e| e.field).collect();
        assert_eq!(fields, vec!["age", "name"]);
    }

    #[test]
    fn test_filter_macro() {
        let filter = crate::filter! { "age__gte" => 18, "name" => "Ana" };
        assert_eq!(filter.len(), 2);
        assert_eq!(filter.get("age__gte"), Some(&Value::Int(18)));
    }
}

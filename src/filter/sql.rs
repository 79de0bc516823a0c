//! Filter → parameterized SQL predicate.

use crate::dialect::{Dialect, Placeholders};
use crate::entity::EntityDescriptor;
use crate::error::{StoreError, StoreResult};
use crate::value::Value;

use super::{Filter, FilterExpression, Operator};

/// What to do with filter fields the entity does not map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldPolicy {
    /// Use unknown names verbatim as column names.
    #[default]
    Trust,
    /// Reject unknown names with a validation error.
    Validate,
}

/// A predicate clause and its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryPlan {
    pub clause: String,
    pub params: Vec<Value>,
}

impl QueryPlan {
    pub fn is_empty(&self) -> bool {
        self.clause.is_empty()
    }

    /// ` WHERE <clause>`, or nothing for an empty plan.
    pub fn where_sql(&self) -> String {
        if self.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clause)
        }
    }
}

/// Compiles filters for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct SqlFilterCompiler<'a> {
    dialect: &'a dyn Dialect,
    descriptor: Option<&'a EntityDescriptor>,
    policy: FieldPolicy,
    offset: usize,
}

impl<'a> SqlFilterCompiler<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            descriptor: None,
            policy: FieldPolicy::Trust,
            offset: 0,
        }
    }

    /// Translate entity field names to storage keys.
    pub fn with_descriptor(mut self, descriptor: &'a EntityDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn with_policy(mut self, policy: FieldPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Number placeholders after `offset` parameters bound earlier in the
    /// same statement (e.g. the SET list of an UPDATE).
    pub fn starting_after(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Compile `filter` into an AND-joined predicate.
    ///
    /// Keys are compiled in sorted order, so equal filters always produce
    /// the same text and parameter order. An empty filter yields an empty
    /// plan.
    pub fn compile(&self, filter: &Filter) -> StoreResult<QueryPlan> {
        let expressions = filter.expressions()?;
        if expressions.is_empty() {
            return Ok(QueryPlan::default());
        }

        let mut placeholders = Placeholders::starting_after(self.dialect, self.offset);
        let mut conditions = Vec::with_capacity(expressions.len());
        let mut params = Vec::new();

        for expr in expressions {
            let column = self.column(&expr)?;
            conditions.push(self.condition(&column, expr, &mut placeholders, &mut params));
        }

        Ok(QueryPlan {
            clause: conditions.join(" AND "),
            params,
        })
    }

    fn column(&self, expr: &FilterExpression) -> StoreResult<String> {
        let key = match self.descriptor.and_then(|d| d.storage_key(&expr.field)) {
            Some(key) => key.to_string(),
            None if self.policy == FieldPolicy::Validate => {
                let entity = self.descriptor.map(|d| d.type_name).unwrap_or("entity");
                return Err(StoreError::validation(format!(
                    "unknown filter field `{}` for {}",
                    expr.field, entity
                )));
            }
            None => expr.field.clone(),
        };
        Ok(self.dialect.quote_identifier(&key))
    }

    fn condition(
        &self,
        column: &str,
        expr: FilterExpression,
        placeholders: &mut Placeholders<'_>,
        params: &mut Vec<Value>,
    ) -> String {
        let symbol = match expr.operator {
            Operator::IsNull => return format!("{} IS NULL", column),
            Operator::IsNotNull => return format!("{} IS NOT NULL", column),
            Operator::In => {
                let items = match expr.value {
                    Value::List(items) => items,
                    single => vec![single],
                };
                if items.is_empty() {
                    return "1 = 0".to_string();
                }
                let list: Vec<String> = items
                    .into_iter()
                    .map(|item| {
                        params.push(item);
                        placeholders.next_placeholder()
                    })
                    .collect();
                return format!("{} IN ({})", column, list.join(", "));
            }
            Operator::ILike if self.dialect.emulates_case_insensitive_match() => {
                params.push(expr.value);
                return format!("UPPER({}) LIKE UPPER({})", column, placeholders.next_placeholder());
            }
            Operator::ILike => "ILIKE",
            Operator::Eq => "=",
            Operator::Neq => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
        };

        params.push(expr.value);
        format!("{} {} {}", column, symbol, placeholders.next_placeholder())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{MySql, Oracle, Postgres, Sqlite};
    use crate::entity::FieldDescriptor;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn compile(filter: &Filter) -> QueryPlan {
        SqlFilterCompiler::new(&Sqlite).compile(filter).unwrap()
    }

    #[test]
    fn test_empty_filter_yields_empty_plan() {
        let plan = compile(&Filter::new());
        assert!(plan.is_empty());
        assert!(plan.params.is_empty());
        assert_eq!(plan.where_sql(), "");
    }

    #[test]
    fn test_operators() {
        let cases = [
            ("name", Value::from("Ana"), "name = ?", 1),
            ("name__not", Value::from("Ana"), "name != ?", 1),
            ("age__gt", Value::Int(30), "age > ?", 1),
            ("age__gte", Value::Int(30), "age >= ?", 1),
            ("age__lt", Value::Int(30), "age < ?", 1),
            ("age__lte", Value::Int(30), "age <= ?", 1),
            ("name__like", Value::from("%An%"), "name LIKE ?", 1),
            ("name__not_like", Value::from("%An%"), "name NOT LIKE ?", 1),
            ("name__ilike", Value::from("%an%"), "UPPER(name) LIKE UPPER(?)", 1),
            ("age__in", Value::from([25, 30, 35]), "age IN (?, ?, ?)", 3),
            ("name__is_null", Value::Bool(true), "name IS NULL", 0),
            ("name__is_not_null", Value::Bool(false), "name IS NOT NULL", 0),
        ];

        for (key, value, clause, params) in cases {
            let plan = compile(&Filter::new().with(key, value));
            assert_eq!(plan.clause, clause, "{}", key);
            assert_eq!(plan.params.len(), params, "{}", key);
        }
    }

    #[test]
    fn test_keys_are_sorted_and_params_follow() {
        let filter: Filter = [
            ("name", Value::from("Ana")),
            ("age__in", Value::from([25, 35])),
            ("email__is_null", Value::Bool(true)),
        ]
        .into();
        let plan = compile(&filter);
        assert_eq!(plan.clause, "age IN (?, ?) AND email IS NULL AND name = ?");
        assert_eq!(
            plan.params,
            vec![Value::Int(25), Value::Int(35), Value::from("Ana")]
        );
    }

    #[test]
    fn test_zero_length_in_is_always_false() {
        let plan = compile(&Filter::new().with("age__in", Value::List(vec![])));
        assert_eq!(plan.clause, "1 = 0");
        assert!(plan.params.is_empty());
    }

    #[test]
    fn test_native_ilike_on_postgres() {
        let plan = SqlFilterCompiler::new(&Postgres)
            .compile(&Filter::new().with("name__ilike", "%an%").with("age", 3))
            .unwrap();
        assert_eq!(plan.clause, "age = $1 AND name ILIKE $2");
    }

    #[test]
    fn test_placeholder_offset() {
        let plan = SqlFilterCompiler::new(&Oracle)
            .starting_after(2)
            .compile(&Filter::new().with("age__in", [1, 2]))
            .unwrap();
        assert_eq!(plan.clause, "age IN (:3, :4)");
    }

    #[test]
    fn test_identifiers_are_quoted_when_needed() {
        let plan = SqlFilterCompiler::new(&MySql)
            .compile(&Filter::new().with("order", 1))
            .unwrap();
        assert_eq!(plan.clause, "`order` = ?");
    }

    #[test]
    fn test_type_mismatch_fails_before_sql() {
        let err = SqlFilterCompiler::new(&Sqlite)
            .compile(&Filter::new().with("age__gt", true))
            .unwrap_err();
        assert_matches!(err, StoreError::TypeMismatch { field, .. } if field == "age");
    }

    fn descriptor() -> EntityDescriptor {
        EntityDescriptor::new(
            "Person",
            vec![
                FieldDescriptor::new("id", "id"),
                FieldDescriptor::new("age", "years"),
            ],
            vec![],
        )
    }

    #[test]
    fn test_field_names_map_to_storage_keys() {
        let d = descriptor();
        let plan = SqlFilterCompiler::new(&Sqlite)
            .with_descriptor(&d)
            .compile(&Filter::new().with("age__gte", 18).with("nickname", "x"))
            .unwrap();
        assert_eq!(plan.clause, "years >= ? AND nickname = ?");
    }

    #[test]
    fn test_validate_policy_rejects_unknown_fields() {
        let d = descriptor();
        let err = SqlFilterCompiler::new(&Sqlite)
            .with_descriptor(&d)
            .with_policy(FieldPolicy::Validate)
            .compile(&Filter::new().with("nickname", "x"))
            .unwrap_err();
        assert_matches!(err, StoreError::Validation(_));
    }
}

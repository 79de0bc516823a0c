//! Filter → BSON predicate document.
//!
//! Every key becomes `{ field: { $op: value } }`; several keys are combined
//! under `$and` in key order. LIKE patterns are translated into anchored
//! regular expressions (`%` → `.*`, `_` → `.`), with the `i` option for
//! `ilike`.

use bson::{Bson, Document, doc};

use crate::entity::EntityDescriptor;
use crate::error::{StoreError, StoreResult};
use crate::value::Value;

use super::sql::FieldPolicy;
use super::{Filter, FilterExpression, Operator};

/// Key under which document backends store the primary key.
pub const ID_KEY: &str = "_id";

/// Compiles filters into document-store predicates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentFilterCompiler<'a> {
    descriptor: Option<&'a EntityDescriptor>,
    policy: FieldPolicy,
}

impl<'a> DocumentFilterCompiler<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate field names to storage keys; the primary key becomes `_id`.
    pub fn with_descriptor(mut self, descriptor: &'a EntityDescriptor) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    pub fn with_policy(mut self, policy: FieldPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn compile(&self, filter: &Filter) -> StoreResult<Document> {
        let mut clauses = Vec::new();
        for expr in filter.expressions()? {
            let key = self.key(&expr)?;
            let mut clause = Document::new();
            clause.insert(key, condition(expr));
            clauses.push(clause);
        }

        Ok(match clauses.len() {
            0 => Document::new(),
            1 => clauses.remove(0),
            _ => doc! { "$and": clauses },
        })
    }

    fn key(&self, expr: &FilterExpression) -> StoreResult<String> {
        if expr.field == ID_KEY {
            return Ok(ID_KEY.to_string());
        }
        let Some(descriptor) = self.descriptor else {
            return Ok(expr.field.clone());
        };
        match descriptor.storage_key(&expr.field) {
            Some(key) => Ok(document_key(descriptor, key).to_string()),
            None if self.policy == FieldPolicy::Validate => Err(StoreError::validation(format!(
                "unknown filter field `{}` for {}",
                expr.field, descriptor.type_name
            ))),
            None => Ok(expr.field.clone()),
        }
    }
}

/// Document key for a storage key: the primary key lives under `_id`.
pub fn document_key<'k>(descriptor: &EntityDescriptor, key: &'k str) -> &'k str {
    if key == descriptor.primary_key().key {
        ID_KEY
    } else {
        key
    }
}

fn condition(expr: FilterExpression) -> Document {
    let value = expr.value;
    match expr.operator {
        Operator::Eq => doc! { "$eq": Bson::from(value) },
        Operator::Neq => doc! { "$ne": Bson::from(value) },
        Operator::Gt => doc! { "$gt": Bson::from(value) },
        Operator::Gte => doc! { "$gte": Bson::from(value) },
        Operator::Lt => doc! { "$lt": Bson::from(value) },
        Operator::Lte => doc! { "$lte": Bson::from(value) },
        Operator::In => doc! { "$in": Bson::from(value) },
        Operator::IsNull => doc! { "$eq": Bson::Null },
        Operator::IsNotNull => doc! { "$ne": Bson::Null },
        Operator::Like => regex_condition(&value, false),
        Operator::ILike => regex_condition(&value, true),
        Operator::NotLike => doc! { "$not": regex_condition(&value, false) },
    }
}

fn regex_condition(value: &Value, case_insensitive: bool) -> Document {
    let pattern = like_to_regex(value.as_text().unwrap_or_default());
    let options = if case_insensitive { "is" } else { "s" };
    doc! { "$regex": pattern, "$options": options }
}

/// Anchored regular expression equivalent to a SQL LIKE pattern.
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    out.push('^');
    let mut literal = String::new();
    for c in pattern.chars() {
        let wildcard = match c {
            '%' => ".*",
            '_' => ".",
            _ => {
                literal.push(c);
                continue;
            }
        };
        out.push_str(&regex::escape(&literal));
        literal.clear();
        out.push_str(wildcard);
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::FieldDescriptor;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_key() {
        let doc = DocumentFilterCompiler::new()
            .compile(&Filter::new().with("age__gte", 30))
            .unwrap();
        assert_eq!(doc, doc! { "age": { "$gte": 30_i64 } });
    }

    #[test]
    fn test_multiple_keys_use_and_in_key_order() {
        let doc = DocumentFilterCompiler::new()
            .compile(
                &Filter::new()
                    .with("name__is_null", true)
                    .with("age__in", [25, 35]),
            )
            .unwrap();
        assert_eq!(
            doc,
            doc! { "$and": [
                { "age": { "$in": [25_i64, 35_i64] } },
                { "name": { "$eq": Bson::Null } },
            ] }
        );
    }

    #[test]
    fn test_empty_filter_is_empty_document() {
        let doc = DocumentFilterCompiler::new().compile(&Filter::new()).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_zero_length_in() {
        let doc = DocumentFilterCompiler::new()
            .compile(&Filter::new().with("age__in", Value::List(vec![])))
            .unwrap();
        assert_eq!(doc, doc! { "age": { "$in": [] } });
    }

    #[test]
    fn test_like_patterns() {
        assert_eq!(like_to_regex("%Ana%"), "^.*Ana.*$");
        assert_eq!(like_to_regex("a_c"), "^a.c$");
        assert_eq!(like_to_regex("1.5%"), "^1\\.5.*$");

        let doc = DocumentFilterCompiler::new()
            .compile(&Filter::new().with("name__not_like", "J%"))
            .unwrap();
        assert_eq!(
            doc,
            doc! { "name": { "$not": { "$regex": "^J.*$", "$options": "s" } } }
        );
    }

    #[test]
    fn test_primary_key_maps_to_id() {
        let descriptor = EntityDescriptor::new(
            "Person",
            vec![
                FieldDescriptor::new("id", "id").primary_key(),
                FieldDescriptor::new("age", "years"),
            ],
            vec![],
        );
        let doc = DocumentFilterCompiler::new()
            .with_descriptor(&descriptor)
            .compile(&Filter::new().with("id", "abc").with("age__lt", 3))
            .unwrap();
        assert_eq!(
            doc,
            doc! { "$and": [
                { "years": { "$lt": 3_i64 } },
                { "_id": { "$eq": "abc" } },
            ] }
        );
    }
}

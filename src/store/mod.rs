//! The public CRUD surface.
//!
//! [`Store`] is implemented by [`SqlStore`] (relational backends, executed
//! through sqlx) and [`DocumentStore`] (document backends behind a
//! [`DocumentDriver`](crate::driver::DocumentDriver)). Both take the same
//! entity types, the same [`Filter`] vocabulary and the same options, and
//! both run a unit of work atomically with `with_transaction`.

pub mod document;
pub mod sql;
mod transaction;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityDescriptor, FieldDescriptor};
use crate::error::{StoreError, StoreResult};
use crate::filter::Filter;
use crate::filter::sql::FieldPolicy;
use crate::mapper::Generated;
use crate::value::Value;

pub use document::{DocTx, DocumentStore};
pub use sql::{DbPool, SqlStore, SqlTx};

/// Default page size.
pub const DEFAULT_LIMIT: i64 = 10;

// ============================================================================
// Options
// ============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn to_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    /// Sort direction as used by document backends.
    pub fn direction(&self) -> i32 {
        match self {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_sql())
    }
}

impl FromStr for SortOrder {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ASC" => Ok(SortOrder::Asc),
            "DESC" => Ok(SortOrder::Desc),
            other => Err(StoreError::validation(format!("invalid sort order `{}`", other))),
        }
    }
}

/// Paging and ordering for `find_all`.
#[derive(Debug, Clone, PartialEq)]
pub struct FindOptions {
    /// 1-based page number.
    pub page: i64,
    /// Page size; 0 returns every match.
    pub limit: i64,
    /// Field or storage key to sort by; defaults to the creation timestamp,
    /// else the primary key.
    pub sort_by: Option<String>,
    pub order: SortOrder,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_LIMIT,
            sort_by: None,
            order: SortOrder::Asc,
        }
    }
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every match, default order.
    pub fn unbounded() -> Self {
        Self::default().limit(0)
    }

    pub fn page(mut self, page: i64) -> Self {
        self.page = page;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.sort_by = Some(field.into());
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    /// Clamp out-of-range values: page below 1 becomes 1, a negative limit
    /// becomes the default, a blank sort field is dropped.
    pub fn normalized(mut self) -> Self {
        if self.page < 1 {
            self.page = 1;
        }
        if self.limit < 0 {
            self.limit = DEFAULT_LIMIT;
        }
        if self.sort_by.as_deref().is_some_and(|s| s.trim().is_empty()) {
            self.sort_by = None;
        }
        self
    }

    pub fn skip(&self) -> i64 {
        crate::page::skip(self.page, self.limit)
    }

    /// Storage key to sort by.
    pub fn sort_key(&self, descriptor: &EntityDescriptor) -> StoreResult<&'static str> {
        match self.sort_by.as_deref() {
            None => Ok(descriptor.default_sort_key()),
            Some(name) => descriptor.resolve_sort_key(name.trim()).ok_or_else(|| {
                StoreError::validation(format!(
                    "cannot sort {} by unknown field `{}`",
                    descriptor.type_name, name
                ))
            }),
        }
    }
}

/// Whether a bulk write stops at the first failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteOrder {
    /// Stop at the first failing operation.
    #[default]
    Ordered,
    /// Attempt every operation and report all failures.
    Unordered,
}

impl WriteOrder {
    pub fn is_ordered(&self) -> bool {
        *self == WriteOrder::Ordered
    }
}

// ============================================================================
// Write specs
// ============================================================================

/// One entry of `update_many`: the rows to match and the fields to set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateSpec {
    pub filter: Filter,
    pub fields: BTreeMap<String, Value>,
}

impl UpdateSpec {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            fields: BTreeMap::new(),
        }
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Both the filter and the field set must be non-empty.
    pub fn validate(&self, index: usize) -> StoreResult<()> {
        if self.filter.is_empty() {
            return Err(StoreError::validation(format!(
                "filter is required for update {}",
                index
            )));
        }
        if self.fields.is_empty() {
            return Err(StoreError::validation(format!(
                "fields are required for update {}",
                index
            )));
        }
        Ok(())
    }
}

/// Validate a whole `update_many` batch before anything is written.
pub(crate) fn validate_updates(specs: &[UpdateSpec]) -> StoreResult<()> {
    if specs.is_empty() {
        return Err(StoreError::validation("update_many needs at least one update"));
    }
    specs
        .iter()
        .enumerate()
        .try_for_each(|(index, spec)| spec.validate(index))
}

/// Resolve `update_many` field names to storage keys.
pub(crate) fn update_keys(
    descriptor: &EntityDescriptor,
    policy: FieldPolicy,
    fields: &BTreeMap<String, Value>,
) -> StoreResult<Vec<(String, Value)>> {
    fields
        .iter()
        .map(|(name, value)| match descriptor.storage_key(name) {
            Some(key) => Ok((key.to_string(), value.clone())),
            None if policy == FieldPolicy::Validate => Err(StoreError::validation(format!(
                "unknown update field `{}` for {}",
                name, descriptor.type_name
            ))),
            None => Ok((name.clone(), value.clone())),
        })
        .collect()
}

/// Conflict key of an upsert: `(entity field, storage key)` pairs.
///
/// An empty spec means the primary key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertSpec {
    pairs: Vec<(String, String)>,
}

impl UpsertSpec {
    /// Conflict on the primary key.
    pub fn primary_key() -> Self {
        Self::default()
    }

    /// Conflict on one field; its storage key comes from the descriptor.
    pub fn on(field: impl Into<String>) -> Self {
        Self::default().and(field)
    }

    /// Add another field to a composite key.
    pub fn and(mut self, field: impl Into<String>) -> Self {
        self.pairs.push((field.into(), String::new()));
        self
    }

    /// Add an explicit `(entity field, storage key)` pair.
    pub fn pair(mut self, field: impl Into<String>, key: impl Into<String>) -> Self {
        self.pairs.push((field.into(), key.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Conflict fields, checked against the descriptor.
    pub fn resolve<'d>(&self, descriptor: &'d EntityDescriptor) -> StoreResult<Vec<&'d FieldDescriptor>> {
        if self.pairs.is_empty() {
            return Ok(vec![descriptor.primary_key()]);
        }

        self.pairs
            .iter()
            .map(|(name, key)| {
                let field = descriptor
                    .field(name)
                    .or_else(|| descriptor.field_by_key(name))
                    .ok_or_else(|| {
                        StoreError::validation(format!(
                            "unknown conflict field `{}` for {}",
                            name, descriptor.type_name
                        ))
                    })?;
                if !key.is_empty() && key != field.key {
                    return Err(StoreError::validation(format!(
                        "conflict field `{}` is stored as `{}`, not `{}`",
                        name, field.key, key
                    )));
                }
                Ok(field)
            })
            .collect()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Outcome of an update or upsert.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
    /// Rows or documents inserted because nothing matched.
    pub upserted_count: u64,
    pub upserted_id: Option<Value>,
}

/// Outcome of `upsert`: the counts plus what was written back onto the entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UpsertOutcome {
    pub result: UpdateResult,
    pub generated: Generated,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// Aggregated counts of a bulk write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkWriteResult {
    pub inserted_count: u64,
    pub matched_count: u64,
    pub modified_count: u64,
    pub deleted_count: u64,
    pub upserted_count: u64,
    /// Generated ids of inserted entries, by batch index.
    pub upserted_ids: BTreeMap<usize, Value>,
}

impl BulkWriteResult {
    pub(crate) fn record_upsert(&mut self, index: usize, result: &UpdateResult) {
        self.matched_count += result.matched_count;
        self.modified_count += result.modified_count;
        self.upserted_count += result.upserted_count;
        if let Some(id) = &result.upserted_id {
            self.upserted_ids.insert(index, id.clone());
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// CRUD and upsert operations over one entity type.
#[async_trait]
pub trait Store<E: Entity>: Send + Sync {
    /// Whether a record with this primary key exists.
    async fn has<I: Into<Value> + Send>(&self, id: I) -> StoreResult<bool>;

    async fn count(&self, filter: &Filter) -> StoreResult<u64>;

    /// Fails with [`StoreError::NotFound`] when no record has this key.
    async fn find_by_id<I: Into<Value> + Send>(&self, id: I) -> StoreResult<E>;

    /// First match in default order; [`StoreError::NotFound`] if none.
    async fn find_one(&self, filter: &Filter) -> StoreResult<E>;

    async fn find_all(&self, filter: &Filter, options: FindOptions) -> StoreResult<Vec<E>>;

    /// Insert. Generated key and timestamps are written back onto `entity`.
    async fn save(&self, entity: &mut E) -> StoreResult<Generated>;

    async fn save_many(&self, entities: &mut [E]) -> StoreResult<InsertManyResult>;

    /// Overwrite the record with the entity's key; stamps the update time.
    async fn update(&self, entity: &mut E) -> StoreResult<()>;

    /// Apply every spec in order. Invalid specs fail before any write;
    /// relational stores also run the batch in one transaction.
    async fn update_many(&self, specs: &[UpdateSpec]) -> StoreResult<UpdateResult>;

    async fn upsert(&self, entity: &mut E, spec: &UpsertSpec) -> StoreResult<UpsertOutcome>;

    async fn upsert_many(
        &self,
        entities: &mut [E],
        spec: &UpsertSpec,
        order: WriteOrder,
    ) -> StoreResult<BulkWriteResult>;

    /// Fails with [`StoreError::NotFound`] when nothing was removed.
    async fn delete<I: Into<Value> + Send>(&self, id: I) -> StoreResult<()>;

    /// Remove the first match; [`StoreError::NotFound`] if none.
    async fn delete_one(&self, filter: &Filter) -> StoreResult<()>;

    /// Remove every match. An empty filter is rejected.
    async fn delete_many(&self, filter: &Filter) -> StoreResult<DeleteResult>;
}

//! Relational store executed through sqlx.
//!
//! Statements are always parameterized. Values are bound by variant:
//! booleans as 0/1 integers, timestamps as `YYYY-MM-DD HH:MM:SS.ffffff`
//! text, lists as JSON text. Rows are decoded column by column from the
//! storage class SQLite reports for each value, then coerced into the
//! entity's field types by the mapper.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteQueryResult, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool, Transaction, TypeInfo, ValueRef};

use super::transaction::{BoxError, Envelope, guarded, settle};
use super::{
    BulkWriteResult, DeleteResult, FindOptions, InsertManyResult, Store, UpdateResult,
    UpdateSpec, UpsertOutcome, UpsertSpec, WriteOrder, update_keys, validate_updates,
};
use crate::config::StoreConfig;
use crate::dialect::{Dialect, Placeholders, Sqlite as SqliteDialect, Statement, UpsertParts, UpsertStrategy};
use crate::entity::{Entity, EntityDescriptor, FieldDescriptor};
use crate::error::{StoreError, StoreResult, TransactionError};
use crate::filter::Filter;
use crate::filter::sql::{FieldPolicy, QueryPlan, SqlFilterCompiler};
use crate::mapper::{CoercionPolicy, EntityMapper, Generated};
use crate::page::Page;
use crate::value::{Value, format_timestamp};

/// Connection pool type used by [`SqlStore`].
pub type DbPool = SqlitePool;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

const DIALECT: &dyn Dialect = &SqliteDialect;

/// Current time at the precision timestamps are stored with.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Store over one table.
pub struct SqlStore<E> {
    pool: DbPool,
    table: Arc<str>,
    mapper: EntityMapper<E>,
    upsert: Arc<dyn UpsertStrategy>,
    field_policy: FieldPolicy,
    coercion: CoercionPolicy,
}

impl<E> Clone for SqlStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            table: self.table.clone(),
            mapper: self.mapper,
            upsert: self.upsert.clone(),
            field_policy: self.field_policy,
            coercion: self.coercion,
        }
    }
}

impl<E: Entity> SqlStore<E> {
    pub fn new(pool: DbPool, table: impl Into<String>) -> Self {
        let table: String = table.into();
        Self {
            pool,
            table: Arc::from(table),
            mapper: EntityMapper::new(),
            upsert: Arc::new(crate::dialect::OnConflict),
            field_policy: FieldPolicy::Trust,
            coercion: CoercionPolicy::Lenient,
        }
    }

    /// Store with the policies selected in `config`.
    pub fn from_config(pool: DbPool, table: impl Into<String>, config: &StoreConfig) -> Self {
        Self::new(pool, table)
            .with_field_policy(config.field_policy())
            .with_coercion_policy(config.coercion_policy())
    }

    /// Replace the dialect's default upsert strategy.
    ///
    /// Fails with [`StoreError::UnsupportedDialect`] when the strategy cannot
    /// be expressed on this backend.
    pub fn with_upsert_strategy<S>(mut self, strategy: S) -> StoreResult<Self>
    where
        S: UpsertStrategy + 'static,
    {
        let driver = DIALECT.driver();
        if !strategy.supports(driver) {
            return Err(StoreError::UnsupportedDialect(format!(
                "{} does not support {} upserts",
                driver,
                strategy.name()
            )));
        }
        if strategy.replaces_row() {
            tracing::warn!(
                table = %self.table,
                strategy = strategy.name(),
                "Upserts will delete and re-insert conflicting rows"
            );
        }
        self.upsert = Arc::new(strategy);
        Ok(self)
    }

    pub fn with_field_policy(mut self, policy: FieldPolicy) -> Self {
        self.field_policy = policy;
        self
    }

    pub fn with_coercion_policy(mut self, policy: CoercionPolicy) -> Self {
        self.coercion = policy;
        self
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn dialect(&self) -> &'static dyn Dialect {
        DIALECT
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        self.mapper.descriptor()
    }

    fn quote(&self, ident: &str) -> String {
        DIALECT.quote_identifier(ident)
    }

    fn compile(&self, filter: &Filter, offset: usize) -> StoreResult<QueryPlan> {
        SqlFilterCompiler::new(DIALECT)
            .with_descriptor(self.descriptor())
            .with_policy(self.field_policy)
            .starting_after(offset)
            .compile(filter)
    }

    fn select_sql(&self) -> String {
        let columns: Vec<String> = self
            .descriptor()
            .fields()
            .iter()
            .map(|f| self.quote(f.key))
            .collect();
        format!("SELECT {} FROM {}", columns.join(", "), self.quote(&self.table))
    }

    fn key_predicate(&self) -> String {
        format!(
            "{} = {}",
            self.quote(self.descriptor().primary_key().key),
            DIALECT.placeholder(1)
        )
    }

    fn not_found(&self, what: impl std::fmt::Display) -> StoreError {
        StoreError::NotFound(format!("{} with {}", self.descriptor().type_name, what))
    }

    fn decode(&self, row: &SqliteRow) -> StoreResult<E> {
        self.mapper.decode(decode_row(row)?, self.coercion)
    }

    // ========================================================================
    // Connection-level operations, shared by the pool and by transactions
    // ========================================================================

    async fn has_on(&self, conn: &mut SqliteConnection, id: Value) -> StoreResult<bool> {
        let sql = format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            self.quote(&self.table),
            self.key_predicate()
        );
        Ok(fetch_optional(conn, &sql, vec![id]).await?.is_some())
    }

    async fn count_on(&self, conn: &mut SqliteConnection, filter: &Filter) -> StoreResult<u64> {
        let plan = self.compile(filter, 0)?;
        let sql = format!("SELECT COUNT(*) FROM {}{}", self.quote(&self.table), plan.where_sql());
        let row = fetch_optional(conn, &sql, plan.params).await?;
        let count: i64 = match row {
            Some(row) => row.try_get(0)?,
            None => 0,
        };
        Ok(count.max(0) as u64)
    }

    async fn find_by_id_on(&self, conn: &mut SqliteConnection, id: Value) -> StoreResult<E> {
        let sql = format!("{} WHERE {} LIMIT 1", self.select_sql(), self.key_predicate());
        match fetch_optional(conn, &sql, vec![id.clone()]).await? {
            Some(row) => self.decode(&row),
            None => Err(self.not_found(format_args!("id {}", id))),
        }
    }

    async fn find_all_on(
        &self,
        conn: &mut SqliteConnection,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<E>> {
        let options = options.normalized();
        let descriptor = self.descriptor();
        let sort = options.sort_key(descriptor)?;
        let plan = self.compile(filter, 0)?;

        let mut sql = format!(
            "{}{} ORDER BY {} {}",
            self.select_sql(),
            plan.where_sql(),
            self.quote(sort),
            options.order.to_sql()
        );
        let key = descriptor.primary_key().key;
        if sort != key {
            sql.push_str(&format!(", {} {}", self.quote(key), options.order.to_sql()));
        }
        if options.limit > 0 {
            sql.push_str(&DIALECT.limit_offset(options.limit, options.skip()));
        }

        let rows = fetch_all(conn, &sql, plan.params).await?;
        rows.iter().map(|row| self.decode(row)).collect()
    }

    async fn save_on(&self, conn: &mut SqliteConnection, entity: &mut E) -> StoreResult<Generated> {
        let mut generated = self.mapper.stamp_insert(entity, now())?;
        let columns = self.mapper.insert_columns(entity);

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", self.quote(&self.table))
        } else {
            let mut placeholders = Placeholders::starting_after(DIALECT, 0);
            let names: Vec<String> = columns.iter().map(|(k, _)| self.quote(k)).collect();
            let values: Vec<String> = columns.iter().map(|_| placeholders.next_placeholder()).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                self.quote(&self.table),
                names.join(", "),
                values.join(", ")
            )
        };

        let generated_key = self.mapper.key_is_generated(entity);
        let params = columns.into_iter().map(|(_, v)| v).collect();
        let result = execute(conn, &sql, params).await?;

        if generated_key {
            self.mapper
                .apply_key(entity, &mut generated, Value::Int(result.last_insert_rowid()))?;
        }
        Ok(generated)
    }

    async fn update_on(&self, conn: &mut SqliteConnection, entity: &mut E) -> StoreResult<()> {
        self.mapper.stamp_update(entity, now())?;
        let id = self.mapper.key_value(entity);
        let columns = self.mapper.update_columns(entity);

        if columns.is_empty() {
            return match self.has_on(conn, id.clone()).await? {
                true => Ok(()),
                false => Err(self.not_found(format_args!("id {}", id))),
            };
        }

        let mut placeholders = Placeholders::starting_after(DIALECT, 0);
        let assignments: Vec<String> = columns
            .iter()
            .map(|(k, _)| format!("{} = {}", self.quote(k), placeholders.next_placeholder()))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.quote(&self.table),
            assignments.join(", "),
            self.quote(self.descriptor().primary_key().key),
            placeholders.next_placeholder()
        );

        let mut params: Vec<Value> = columns.into_iter().map(|(_, v)| v).collect();
        params.push(id.clone());

        let result = execute(conn, &sql, params).await?;
        if result.rows_affected() == 0 {
            return Err(self.not_found(format_args!("id {}", id)));
        }
        Ok(())
    }

    /// Prepare one `UPDATE … SET … WHERE …` per spec; SET parameters come
    /// before the WHERE parameters.
    fn update_statements(&self, specs: &[UpdateSpec]) -> StoreResult<Vec<Statement>> {
        let descriptor = self.descriptor();
        let stamp = Value::Timestamp(now());

        specs
            .iter()
            .map(|spec| -> StoreResult<Statement> {
                let mut sets = update_keys(descriptor, self.field_policy, &spec.fields)?;
                if let Some(updated) = descriptor.updated() {
                    if !sets.iter().any(|(k, _)| k == updated.key) {
                        sets.push((updated.key.to_string(), stamp.clone()));
                    }
                }

                let mut placeholders = Placeholders::starting_after(DIALECT, 0);
                let assignments: Vec<String> = sets
                    .iter()
                    .map(|(k, _)| format!("{} = {}", self.quote(k), placeholders.next_placeholder()))
                    .collect();
                let plan = self.compile(&spec.filter, placeholders.count())?;

                let sql = format!(
                    "UPDATE {} SET {}{}",
                    self.quote(&self.table),
                    assignments.join(", "),
                    plan.where_sql()
                );
                let mut params: Vec<Value> = sets.into_iter().map(|(_, v)| v).collect();
                params.extend(plan.params);
                Ok(Statement::new(sql, params))
            })
            .collect()
    }

    async fn update_many_on(
        &self,
        conn: &mut SqliteConnection,
        statements: Vec<Statement>,
    ) -> StoreResult<UpdateResult> {
        let mut total = UpdateResult::default();
        for stmt in statements {
            let affected = execute(conn, &stmt.sql, stmt.params).await?.rows_affected();
            total.matched_count += affected;
            total.modified_count += affected;
        }
        Ok(total)
    }

    /// Look up the row holding the conflict key's values, returning its
    /// primary key and creation timestamp.
    async fn probe(
        &self,
        conn: &mut SqliteConnection,
        conflict: &[&FieldDescriptor],
        columns: &[(&'static str, Value)],
    ) -> StoreResult<Option<Vec<(String, Value)>>> {
        let descriptor = self.descriptor();
        let mut wanted = vec![self.quote(descriptor.primary_key().key)];
        if let Some(created) = descriptor.created() {
            wanted.push(self.quote(created.key));
        }

        let mut placeholders = Placeholders::starting_after(DIALECT, 0);
        let mut params = Vec::with_capacity(conflict.len());
        let mut predicates = Vec::with_capacity(conflict.len());
        for field in conflict {
            let Some((_, value)) = columns.iter().find(|(k, _)| *k == field.key) else {
                // A key the backend has yet to generate cannot match anything.
                return Ok(None);
            };
            if value.is_null() {
                return Ok(None);
            }
            predicates.push(format!("{} = {}", self.quote(field.key), placeholders.next_placeholder()));
            params.push(value.clone());
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 1",
            wanted.join(", "),
            self.quote(&self.table),
            predicates.join(" AND ")
        );
        match fetch_optional(conn, &sql, params).await? {
            Some(row) => Ok(Some(decode_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn upsert_on(
        &self,
        conn: &mut SqliteConnection,
        entity: &mut E,
        spec: &UpsertSpec,
    ) -> StoreResult<UpsertOutcome> {
        let descriptor = self.descriptor();
        let conflict = spec.resolve(descriptor)?;
        let mut generated = self.mapper.stamp_insert(entity, now())?;
        let columns = self.mapper.insert_columns(entity);

        let conflict_keys: Vec<&'static str> = conflict.iter().map(|f| f.key).collect();
        let mut insert_only = vec![descriptor.primary_key().key];
        if let Some(created) = descriptor.created() {
            insert_only.push(created.key);
        }

        let statement = self.upsert.build(
            DIALECT,
            &UpsertParts {
                table: &self.table,
                columns: &columns,
                conflict: &conflict_keys,
                insert_only: &insert_only,
            },
        )?;

        let existing = self.probe(conn, &conflict, &columns).await?;
        let generated_key = self.mapper.key_is_generated(entity);
        let result = execute(conn, &statement.sql, statement.params).await?;

        let mut outcome = UpdateResult::default();
        match existing {
            Some(record) => {
                outcome.matched_count = 1;
                outcome.modified_count = result.rows_affected().min(1);
                if self.upsert.replaces_row() {
                    if generated_key {
                        self.mapper
                            .apply_key(entity, &mut generated, Value::Int(result.last_insert_rowid()))?;
                    }
                } else {
                    for (key, value) in record {
                        if key == descriptor.primary_key().key {
                            self.mapper.apply_key(entity, &mut generated, value)?;
                        } else {
                            self.mapper.apply_created(entity, &mut generated, value)?;
                        }
                    }
                }
            }
            None => {
                if generated_key {
                    self.mapper
                        .apply_key(entity, &mut generated, Value::Int(result.last_insert_rowid()))?;
                }
                outcome.upserted_count = 1;
                outcome.upserted_id = Some(generated.id.clone());
            }
        }

        tracing::debug!(
            table = %self.table,
            matched = outcome.matched_count,
            upserted = outcome.upserted_count,
            "Upserted entity"
        );
        Ok(UpsertOutcome {
            result: outcome,
            generated,
        })
    }

    async fn delete_on(&self, conn: &mut SqliteConnection, id: Value) -> StoreResult<()> {
        let sql = format!("DELETE FROM {} WHERE {}", self.quote(&self.table), self.key_predicate());
        let result = execute(conn, &sql, vec![id.clone()]).await?;
        if result.rows_affected() == 0 {
            return Err(self.not_found(format_args!("id {}", id)));
        }
        Ok(())
    }

    async fn delete_one_on(&self, conn: &mut SqliteConnection, filter: &Filter) -> StoreResult<()> {
        if filter.is_empty() {
            return Err(StoreError::validation("delete_one requires a filter"));
        }
        let plan = self.compile(filter, 0)?;
        let key = self.quote(self.descriptor().primary_key().key);
        let table = self.quote(&self.table);
        let sql = format!(
            "DELETE FROM {table} WHERE {key} IN (SELECT {key} FROM {table}{} LIMIT 1)",
            plan.where_sql()
        );
        let result = execute(conn, &sql, plan.params).await?;
        if result.rows_affected() == 0 {
            return Err(self.not_found("matching filter"));
        }
        Ok(())
    }

    async fn delete_many_on(&self, conn: &mut SqliteConnection, filter: &Filter) -> StoreResult<DeleteResult> {
        if filter.is_empty() {
            return Err(StoreError::validation("delete_many requires a filter"));
        }
        let plan = self.compile(filter, 0)?;
        let sql = format!("DELETE FROM {}{}", self.quote(&self.table), plan.where_sql());
        let result = execute(conn, &sql, plan.params).await?;
        Ok(DeleteResult {
            deleted_count: result.rows_affected(),
        })
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Run `work` inside one transaction.
    ///
    /// Commits when `work` returns `Ok`. On `Err` the transaction is rolled
    /// back and the error returned as is; a panic rolls back before it
    /// propagates.
    ///
    /// ```rust,ignore
    /// store
    ///     .with_transaction(|tx| {
    ///         Box::pin(async move {
    ///             tx.save(&mut alice).await?;
    ///             tx.save(&mut bob).await
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn with_transaction<R, F>(&self, work: F) -> StoreResult<R>
    where
        R: Send,
        F: for<'s> FnOnce(&'s mut SqlTx<E>) -> BoxFuture<'s, StoreResult<R>> + Send,
    {
        let mut session = self.begin().await?;
        let outcome = guarded(work(&mut session)).await;
        settle(session, outcome).await
    }

    async fn begin(&self) -> StoreResult<SqlTx<E>> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TransactionError::Begin(Box::new(e)))?;
        Ok(SqlTx {
            tx,
            store: self.clone(),
        })
    }

    /// One page of matches plus pagination metadata.
    pub async fn find_page(&self, filter: &Filter, options: FindOptions) -> StoreResult<Page<E>> {
        let options = options.normalized();
        let total = self.count(filter).await? as i64;
        if total == 0 {
            return Ok(Page::empty(options.page, options.limit));
        }
        let items = self.find_all(filter, options.clone()).await?;
        Ok(Page::new(items, options.page, options.limit, total))
    }
}

#[async_trait]
impl<E: Entity> Store<E> for SqlStore<E> {
    async fn has<I: Into<Value> + Send>(&self, id: I) -> StoreResult<bool> {
        let mut conn = self.pool.acquire().await?;
        self.has_on(&mut conn, id.into()).await
    }

    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        self.count_on(&mut conn, filter).await
    }

    async fn find_by_id<I: Into<Value> + Send>(&self, id: I) -> StoreResult<E> {
        let mut conn = self.pool.acquire().await?;
        self.find_by_id_on(&mut conn, id.into()).await
    }

    async fn find_one(&self, filter: &Filter) -> StoreResult<E> {
        let mut conn = self.pool.acquire().await?;
        let mut found = self
            .find_all_on(&mut conn, filter, FindOptions::new().limit(1))
            .await?;
        if found.is_empty() {
            return Err(self.not_found("matching filter"));
        }
        Ok(found.swap_remove(0))
    }

    async fn find_all(&self, filter: &Filter, options: FindOptions) -> StoreResult<Vec<E>> {
        let mut conn = self.pool.acquire().await?;
        self.find_all_on(&mut conn, filter, options).await
    }

    async fn save(&self, entity: &mut E) -> StoreResult<Generated> {
        let mut conn = self.pool.acquire().await?;
        self.save_on(&mut conn, entity).await
    }

    /// All-or-nothing: the first failure rolls back every insert.
    async fn save_many(&self, entities: &mut [E]) -> StoreResult<InsertManyResult> {
        if entities.is_empty() {
            return Ok(InsertManyResult::default());
        }
        let mut session = self.begin().await?;
        let outcome = guarded(async {
            let mut inserted_ids = Vec::with_capacity(entities.len());
            for entity in entities.iter_mut() {
                inserted_ids.push(session.save(entity).await?.id);
            }
            Ok::<_, StoreError>(InsertManyResult { inserted_ids })
        })
        .await;
        settle(session, outcome).await
    }

    async fn update(&self, entity: &mut E) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.update_on(&mut conn, entity).await
    }

    async fn update_many(&self, specs: &[UpdateSpec]) -> StoreResult<UpdateResult> {
        validate_updates(specs)?;
        let statements = self.update_statements(specs)?;
        let mut session = self.begin().await?;
        let outcome = guarded(self.update_many_on(&mut session.tx, statements)).await;
        settle(session, outcome).await
    }

    async fn upsert(&self, entity: &mut E, spec: &UpsertSpec) -> StoreResult<UpsertOutcome> {
        let mut session = self.begin().await?;
        let outcome = guarded(session.upsert(entity, spec)).await;
        settle(session, outcome).await
    }

    /// Always atomic on relational backends; `order` only affects logging.
    async fn upsert_many(
        &self,
        entities: &mut [E],
        spec: &UpsertSpec,
        order: WriteOrder,
    ) -> StoreResult<BulkWriteResult> {
        if entities.is_empty() {
            return Ok(BulkWriteResult::default());
        }
        if !order.is_ordered() {
            tracing::debug!(table = %self.table, "Unordered upsert batch runs atomically on SQL backends");
        }
        let mut session = self.begin().await?;
        let outcome = guarded(async {
            let mut total = BulkWriteResult::default();
            for (index, entity) in entities.iter_mut().enumerate() {
                let outcome = session.upsert(entity, spec).await?;
                total.record_upsert(index, &outcome.result);
            }
            Ok::<_, StoreError>(total)
        })
        .await;
        settle(session, outcome).await
    }

    async fn delete<I: Into<Value> + Send>(&self, id: I) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.delete_on(&mut conn, id.into()).await
    }

    async fn delete_one(&self, filter: &Filter) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        self.delete_one_on(&mut conn, filter).await
    }

    async fn delete_many(&self, filter: &Filter) -> StoreResult<DeleteResult> {
        let mut conn = self.pool.acquire().await?;
        self.delete_many_on(&mut conn, filter).await
    }
}

// ============================================================================
// Transaction session
// ============================================================================

/// Store operations bound to an open transaction.
pub struct SqlTx<E> {
    tx: Transaction<'static, Sqlite>,
    store: SqlStore<E>,
}

impl<E: Entity> SqlTx<E> {
    pub async fn save(&mut self, entity: &mut E) -> StoreResult<Generated> {
        self.store.save_on(&mut self.tx, entity).await
    }

    pub async fn update(&mut self, entity: &mut E) -> StoreResult<()> {
        self.store.update_on(&mut self.tx, entity).await
    }

    pub async fn upsert(&mut self, entity: &mut E, spec: &UpsertSpec) -> StoreResult<UpsertOutcome> {
        self.store.upsert_on(&mut self.tx, entity, spec).await
    }

    pub async fn find_by_id<I: Into<Value>>(&mut self, id: I) -> StoreResult<E> {
        self.store.find_by_id_on(&mut self.tx, id.into()).await
    }

    pub async fn find_all(&mut self, filter: &Filter, options: FindOptions) -> StoreResult<Vec<E>> {
        self.store.find_all_on(&mut self.tx, filter, options).await
    }

    pub async fn count(&mut self, filter: &Filter) -> StoreResult<u64> {
        self.store.count_on(&mut self.tx, filter).await
    }

    pub async fn delete<I: Into<Value>>(&mut self, id: I) -> StoreResult<()> {
        self.store.delete_on(&mut self.tx, id.into()).await
    }

    pub async fn delete_many(&mut self, filter: &Filter) -> StoreResult<DeleteResult> {
        self.store.delete_many_on(&mut self.tx, filter).await
    }
}

#[async_trait]
impl<E: Entity> Envelope for SqlTx<E> {
    async fn commit(self) -> Result<(), BoxError> {
        self.tx.commit().await.map_err(|e| Box::new(e) as BoxError)
    }

    async fn rollback(self) -> Result<(), BoxError> {
        self.tx.rollback().await.map_err(|e| Box::new(e) as BoxError)
    }
}

// ============================================================================
// Binding and decoding
// ============================================================================

fn bind_value(query: SqliteQuery<'_>, value: Value) -> SqliteQuery<'_> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(if b { 1i32 } else { 0i32 }),
        Value::Int(i) => query.bind(i),
        Value::Float(f) => query.bind(f),
        Value::Text(s) => query.bind(s),
        Value::Bytes(b) => query.bind(b),
        Value::Timestamp(t) => query.bind(format_timestamp(&t)),
        Value::List(items) => query.bind(sqlx::types::Json(items)),
    }
}

fn prepare(sql: &str, params: Vec<Value>) -> SqliteQuery<'_> {
    tracing::debug!(sql = %sql, params = params.len(), "Executing store statement");
    params.into_iter().fold(sqlx::query(sql), bind_value)
}

async fn execute(conn: &mut SqliteConnection, sql: &str, params: Vec<Value>) -> StoreResult<SqliteQueryResult> {
    Ok(prepare(sql, params).execute(conn).await?)
}

async fn fetch_all(conn: &mut SqliteConnection, sql: &str, params: Vec<Value>) -> StoreResult<Vec<SqliteRow>> {
    Ok(prepare(sql, params).fetch_all(conn).await?)
}

async fn fetch_optional(
    conn: &mut SqliteConnection,
    sql: &str,
    params: Vec<Value>,
) -> StoreResult<Option<SqliteRow>> {
    Ok(prepare(sql, params).fetch_optional(conn).await?)
}

/// Decode every column of a row by its runtime storage class.
fn decode_row(row: &SqliteRow) -> StoreResult<Vec<(String, Value)>> {
    row.columns()
        .iter()
        .map(|column| -> StoreResult<(String, Value)> {
            let index = column.ordinal();
            Ok((column.name().to_string(), decode_cell(row, index)?))
        })
        .collect()
}

fn decode_cell(row: &SqliteRow, index: usize) -> Result<Value, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();

    Ok(match type_name.as_str() {
        "INTEGER" | "INT" | "BIGINT" | "BOOLEAN" => Value::Int(row.try_get_unchecked::<i64, _>(index)?),
        "REAL" | "FLOAT" | "DOUBLE" | "NUMERIC" => Value::Float(row.try_get_unchecked::<f64, _>(index)?),
        "BLOB" => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(index)?),
        _ => Value::Text(row.try_get_unchecked::<String, _>(index)?),
    })
}

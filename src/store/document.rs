//! Document store over a [`DocumentDriver`].
//!
//! The primary key is stored under `_id`. An unset text key is filled with
//! a UUID v4 before the first write; integer keys must be set by the
//! caller. Timestamps are BSON datetimes (millisecond precision), so the
//! store stamps lifecycle fields with millisecond-truncated times.

use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use chrono::{DateTime, SubsecRound, Utc};
use futures::future::BoxFuture;

use super::transaction::{BoxError, Envelope, guarded, settle};
use super::{
    BulkWriteResult, DeleteResult, FindOptions, InsertManyResult, Store, UpdateResult, UpdateSpec,
    UpsertOutcome, UpsertSpec, WriteOrder, update_keys, validate_updates,
};
use crate::config::StoreConfig;
use crate::driver::{DocumentDriver, FindSpec, UpsertOp};
use crate::entity::{Entity, EntityDescriptor, FieldDescriptor};
use crate::error::{StoreError, StoreResult};
use crate::filter::Filter;
use crate::filter::document::{DocumentFilterCompiler, ID_KEY, document_key};
use crate::filter::sql::FieldPolicy;
use crate::mapper::{CoercionPolicy, EntityMapper, Generated};
use crate::page::Page;
use crate::value::Value;

/// Store over one collection.
pub struct DocumentStore<E, D> {
    driver: Arc<D>,
    collection: Arc<str>,
    mapper: EntityMapper<E>,
    field_policy: FieldPolicy,
    coercion: CoercionPolicy,
}

impl<E, D> Clone for DocumentStore<E, D> {
    fn clone(&self) -> Self {
        Self {
            driver: self.driver.clone(),
            collection: self.collection.clone(),
            mapper: self.mapper,
            field_policy: self.field_policy,
            coercion: self.coercion,
        }
    }
}

fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

impl<E: Entity, D: DocumentDriver> DocumentStore<E, D> {
    pub fn new(driver: impl Into<Arc<D>>, collection: impl Into<String>) -> Self {
        let collection: String = collection.into();
        Self {
            driver: driver.into(),
            collection: Arc::from(collection),
            mapper: EntityMapper::new(),
            field_policy: FieldPolicy::Trust,
            coercion: CoercionPolicy::Lenient,
        }
    }

    pub fn from_config(driver: impl Into<Arc<D>>, collection: impl Into<String>, config: &StoreConfig) -> Self {
        Self::new(driver, collection)
            .with_field_policy(config.field_policy())
            .with_coercion_policy(config.coercion_policy())
    }

    pub fn with_field_policy(mut self, policy: FieldPolicy) -> Self {
        self.field_policy = policy;
        self
    }

    pub fn with_coercion_policy(mut self, policy: CoercionPolicy) -> Self {
        self.coercion = policy;
        self
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn descriptor(&self) -> &'static EntityDescriptor {
        self.mapper.descriptor()
    }

    fn compile(&self, filter: &Filter) -> StoreResult<Document> {
        DocumentFilterCompiler::new()
            .with_descriptor(self.descriptor())
            .with_policy(self.field_policy)
            .compile(filter)
    }

    fn id_filter(id: Value) -> Document {
        let mut filter = Document::new();
        filter.insert(ID_KEY, Bson::from(id));
        filter
    }

    fn not_found(&self, what: impl std::fmt::Display) -> StoreError {
        StoreError::NotFound(format!("{} with {}", self.descriptor().type_name, what))
    }

    fn to_document(&self, columns: Vec<(&'static str, Value)>) -> Document {
        let descriptor = self.descriptor();
        columns
            .into_iter()
            .map(|(key, value)| (document_key(descriptor, key).to_string(), Bson::from(value)))
            .collect()
    }

    fn decode(&self, document: Document) -> StoreResult<E> {
        let key = self.descriptor().primary_key().key;
        let record = document.into_iter().map(|(name, value)| {
            let name = if name == ID_KEY { key.to_string() } else { name };
            (name, Value::from(value))
        });
        self.mapper.decode(record, self.coercion)
    }

    /// Give an unset text key a UUID; integer keys cannot be generated.
    fn fill_key(&self, entity: &mut E, generated: &mut Generated) -> StoreResult<()> {
        let key = self.mapper.key_value(entity);
        if !key.is_unset_key() {
            return Ok(());
        }
        if let Value::Int(_) = key {
            return Err(StoreError::validation(format!(
                "document stores only generate text keys; set {}.{} before writing",
                self.descriptor().type_name,
                self.descriptor().primary_key().name
            )));
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.mapper.apply_key(entity, generated, Value::Text(id))
    }

    /// Stamp timestamps and fill the key ahead of an insert or upsert.
    fn prepare_insert(&self, entity: &mut E) -> StoreResult<Generated> {
        let mut generated = self.mapper.stamp_insert(entity, now())?;
        self.fill_key(entity, &mut generated)?;
        Ok(generated)
    }

    fn insert_only_keys(&self) -> Vec<&'static str> {
        let descriptor = self.descriptor();
        let mut keys = vec![descriptor.primary_key().key];
        if let Some(created) = descriptor.created() {
            keys.push(created.key);
        }
        keys
    }

    /// `{ conflict equality }` plus `{ $set, $setOnInsert }` for one entity.
    fn upsert_op(&self, entity: &E, conflict: &[&FieldDescriptor]) -> UpsertOp {
        let descriptor = self.descriptor();
        let columns = self.mapper.insert_columns(entity);
        let insert_only = self.insert_only_keys();
        let is_conflict = |key: &str| conflict.iter().any(|f| f.key == key);

        let mut filter = Document::new();
        let mut set = Document::new();
        let mut set_on_insert = Document::new();
        for (key, value) in columns {
            let name = document_key(descriptor, key).to_string();
            if is_conflict(key) {
                filter.insert(name, Bson::from(value));
            } else if insert_only.contains(&key) {
                set_on_insert.insert(name, Bson::from(value));
            } else {
                set.insert(name, Bson::from(value));
            }
        }

        let mut update = Document::new();
        if !set.is_empty() {
            update.insert("$set", set);
        }
        if set_on_insert.is_empty() && update.is_empty() {
            set_on_insert.insert(ID_KEY, Bson::from(self.mapper.key_value(entity)));
        }
        if !set_on_insert.is_empty() {
            update.insert("$setOnInsert", set_on_insert);
        }
        UpsertOp { filter, update }
    }

    fn sort_spec(&self, options: &FindOptions) -> StoreResult<Document> {
        let descriptor = self.descriptor();
        let key = document_key(descriptor, options.sort_key(descriptor)?);
        let direction = options.order.direction();
        let mut sort = Document::new();
        sort.insert(key, direction);
        if key != ID_KEY {
            sort.insert(ID_KEY, direction);
        }
        Ok(sort)
    }

    // ========================================================================
    // Session-aware operations, shared by the store and by transactions
    // ========================================================================

    async fn count_in(&self, session: Option<&mut D::Session>, filter: &Filter) -> StoreResult<u64> {
        let filter = self.compile(filter)?;
        self.driver.count(session, &self.collection, filter).await
    }

    async fn find_by_id_in(&self, session: Option<&mut D::Session>, id: Value) -> StoreResult<E> {
        let found = self
            .driver
            .find(session, &self.collection, Self::id_filter(id.clone()), FindSpec::first())
            .await?;
        match found.into_iter().next() {
            Some(document) => self.decode(document),
            None => Err(self.not_found(format_args!("id {}", id))),
        }
    }

    async fn find_all_in(
        &self,
        session: Option<&mut D::Session>,
        filter: &Filter,
        options: FindOptions,
    ) -> StoreResult<Vec<E>> {
        let options = options.normalized();
        let filter = self.compile(filter)?;
        let spec = FindSpec {
            sort: Some(self.sort_spec(&options)?),
            skip: options.skip().max(0) as u64,
            limit: options.limit,
        };
        self.driver
            .find(session, &self.collection, filter, spec)
            .await?
            .into_iter()
            .map(|document| self.decode(document))
            .collect()
    }

    async fn save_in(&self, session: Option<&mut D::Session>, entity: &mut E) -> StoreResult<Generated> {
        let mut generated = self.prepare_insert(entity)?;
        let document = self.to_document(self.mapper.insert_columns(entity));
        let id = self.driver.insert_one(session, &self.collection, document).await?;
        generated.id = Value::from(id);
        Ok(generated)
    }

    async fn save_batch(&self, entities: &mut [E], order: WriteOrder) -> StoreResult<InsertManyResult> {
        if entities.is_empty() {
            return Ok(InsertManyResult::default());
        }
        let mut documents = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            self.prepare_insert(entity)?;
            documents.push(self.to_document(self.mapper.insert_columns(entity)));
        }
        let ids = self
            .driver
            .insert_many(None, &self.collection, documents, order.is_ordered())
            .await?;
        Ok(InsertManyResult {
            inserted_ids: ids.into_iter().map(Value::from).collect(),
        })
    }

    async fn update_in(&self, mut session: Option<&mut D::Session>, entity: &mut E) -> StoreResult<()> {
        self.mapper.stamp_update(entity, now())?;
        let id = self.mapper.key_value(entity);
        let set = self.to_document(self.mapper.update_columns(entity));
        if set.is_empty() {
            return match self.count_by_id(session, id.clone()).await? {
                0 => Err(self.not_found(format_args!("id {}", id))),
                _ => Ok(()),
            };
        }

        let result = self
            .driver
            .update_one(
                session.as_deref_mut(),
                &self.collection,
                Self::id_filter(id.clone()),
                doc! { "$set": set },
                false,
            )
            .await?;
        if result.matched_count == 0 {
            return Err(self.not_found(format_args!("id {}", id)));
        }
        Ok(())
    }

    async fn count_by_id(&self, session: Option<&mut D::Session>, id: Value) -> StoreResult<u64> {
        self.driver.count(session, &self.collection, Self::id_filter(id)).await
    }

    /// Copy `_id` and the creation timestamp of the stored document back
    /// onto an entity whose upsert matched.
    async fn adopt_existing(
        &self,
        session: Option<&mut D::Session>,
        entity: &mut E,
        generated: &mut Generated,
        filter: Document,
    ) -> StoreResult<()> {
        let found = self
            .driver
            .find(session, &self.collection, filter, FindSpec::first())
            .await?;
        let Some(mut document) = found.into_iter().next() else {
            return Ok(());
        };
        if let Some(id) = document.remove(ID_KEY) {
            self.mapper.apply_key(entity, generated, Value::from(id))?;
        }
        if let Some(created) = self.descriptor().created() {
            if let Some(value) = document.remove(created.key) {
                self.mapper.apply_created(entity, generated, Value::from(value))?;
            }
        }
        Ok(())
    }

    async fn upsert_in(
        &self,
        mut session: Option<&mut D::Session>,
        entity: &mut E,
        spec: &UpsertSpec,
    ) -> StoreResult<UpsertOutcome> {
        let conflict = spec.resolve(self.descriptor())?;
        let mut generated = self.prepare_insert(entity)?;
        let op = self.upsert_op(entity, &conflict);

        let result = self
            .driver
            .update_one(
                session.as_deref_mut(),
                &self.collection,
                op.filter.clone(),
                op.update,
                true,
            )
            .await?;
        if result.upserted_count == 0 {
            self.adopt_existing(session, entity, &mut generated, op.filter)
                .await?;
        }

        tracing::debug!(
            collection = %self.collection,
            matched = result.matched_count,
            upserted = result.upserted_count,
            "Upserted entity"
        );
        Ok(UpsertOutcome { result, generated })
    }

    async fn delete_in(&self, session: Option<&mut D::Session>, id: Value) -> StoreResult<()> {
        let deleted = self
            .driver
            .delete_one(session, &self.collection, Self::id_filter(id.clone()))
            .await?;
        if deleted == 0 {
            return Err(self.not_found(format_args!("id {}", id)));
        }
        Ok(())
    }

    async fn delete_many_in(&self, session: Option<&mut D::Session>, filter: &Filter) -> StoreResult<DeleteResult> {
        if filter.is_empty() {
            return Err(StoreError::validation("delete_many requires a filter"));
        }
        let filter = self.compile(filter)?;
        let deleted_count = self.driver.delete_many(session, &self.collection, filter).await?;
        Ok(DeleteResult { deleted_count })
    }

    // ========================================================================
    // Store extras
    // ========================================================================

    /// Insert every entity, continuing past failures.
    ///
    /// Fails with [`StoreError::BulkWrite`] listing every rejected index when
    /// any insert failed; the others stay written.
    pub async fn save_many_unordered(&self, entities: &mut [E]) -> StoreResult<InsertManyResult> {
        self.save_batch(entities, WriteOrder::Unordered).await
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

    /// Run `work` inside one session transaction.
    ///
    /// Fails with [`StoreError::TransactionUnsupported`] before `work` runs
    /// when the deployment cannot provide transactions. Commit and rollback
    /// follow [`SqlStore::with_transaction`](super::SqlStore::with_transaction).
    pub async fn with_transaction<R, F>(&self, work: F) -> StoreResult<R>
    where
        R: Send,
        F: for<'s> FnOnce(&'s mut DocTx<E, D>) -> BoxFuture<'s, StoreResult<R>> + Send,
    {
        let session = self.driver.start_session().await?;
        let mut tx = DocTx {
            session,
            store: self.clone(),
        };
        let outcome = guarded(work(&mut tx)).await;
        settle(tx, outcome).await
    }
}

#[async_trait]
impl<E: Entity, D: DocumentDriver> Store<E> for DocumentStore<E, D> {
    async fn has<I: Into<Value> + Send>(&self, id: I) -> StoreResult<bool> {
        Ok(self.count_by_id(None, id.into()).await? > 0)
    }

    async fn count(&self, filter: &Filter) -> StoreResult<u64> {
        self.count_in(None, filter).await
    }

    async fn find_by_id<I: Into<Value> + Send>(&self, id: I) -> StoreResult<E> {
        self.find_by_id_in(None, id.into()).await
    }

    async fn find_one(&self, filter: &Filter) -> StoreResult<E> {
        let mut found = self
            .find_all_in(None, filter, FindOptions::new().limit(1))
            .await?;
        if found.is_empty() {
            return Err(self.not_found("matching filter"));
        }
        Ok(found.swap_remove(0))
    }

    async fn find_all(&self, filter: &Filter, options: FindOptions) -> StoreResult<Vec<E>> {
        self.find_all_in(None, filter, options).await
    }

    async fn save(&self, entity: &mut E) -> StoreResult<Generated> {
        self.save_in(None, entity).await
    }

    /// One ordered bulk insert: stops at the first rejected document.
    async fn save_many(&self, entities: &mut [E]) -> StoreResult<InsertManyResult> {
        self.save_batch(entities, WriteOrder::Ordered).await
    }

    async fn update(&self, entity: &mut E) -> StoreResult<()> {
        self.update_in(None, entity).await
    }

    /// Every spec is validated before the first write; the writes
    /// themselves run one after another.
    async fn update_many(&self, specs: &[UpdateSpec]) -> StoreResult<UpdateResult> {
        validate_updates(specs)?;
        let descriptor = self.descriptor();
        let stamp = descriptor.updated().map(|f| (f.key, Bson::from(Value::Timestamp(now()))));

        let mut prepared = Vec::with_capacity(specs.len());
        for spec in specs {
            let filter = self.compile(&spec.filter)?;
            let mut set: Document = update_keys(descriptor, self.field_policy, &spec.fields)?
                .into_iter()
                .map(|(key, value)| (document_key(descriptor, &key).to_string(), Bson::from(value)))
                .collect();
            if let Some((key, value)) = &stamp {
                if !set.contains_key(*key) {
                    set.insert(*key, value.clone());
                }
            }
            prepared.push((filter, doc! { "$set": set }));
        }

        let mut total = UpdateResult::default();
        for (filter, update) in prepared {
            let result = self
                .driver
                .update_many(None, &self.collection, filter, update)
                .await?;
            total.matched_count += result.matched_count;
            total.modified_count += result.modified_count;
        }
        Ok(total)
    }

    async fn upsert(&self, entity: &mut E, spec: &UpsertSpec) -> StoreResult<UpsertOutcome> {
        self.upsert_in(None, entity, spec).await
    }

    /// One bulk upsert honouring `order`. Failures surface as
    /// [`StoreError::BulkWrite`] with the counts of what did succeed.
    async fn upsert_many(
        &self,
        entities: &mut [E],
        spec: &UpsertSpec,
        order: WriteOrder,
    ) -> StoreResult<BulkWriteResult> {
        if entities.is_empty() {
            return Ok(BulkWriteResult::default());
        }
        let conflict = spec.resolve(self.descriptor())?;

        let mut generated = Vec::with_capacity(entities.len());
        let mut ops = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            generated.push(self.prepare_insert(entity)?);
            ops.push(self.upsert_op(entity, &conflict));
        }
        let filters: Vec<Document> = ops.iter().map(|op| op.filter.clone()).collect();

        let result = self
            .driver
            .bulk_upsert(None, &self.collection, ops, order.is_ordered())
            .await?;

        for (index, ((entity, generated), filter)) in
            entities.iter_mut().zip(generated.iter_mut()).zip(filters).enumerate()
        {
            if !result.upserted_ids.contains_key(&index) {
                self.adopt_existing(None, entity, generated, filter).await?;
            }
        }
        Ok(result)
    }

    async fn delete<I: Into<Value> + Send>(&self, id: I) -> StoreResult<()> {
        self.delete_in(None, id.into()).await
    }

    async fn delete_one(&self, filter: &Filter) -> StoreResult<()> {
        if filter.is_empty() {
            return Err(StoreError::validation("delete_one requires a filter"));
        }
        let filter = self.compile(filter)?;
        match self.driver.delete_one(None, &self.collection, filter).await? {
            0 => Err(self.not_found("matching filter")),
            _ => Ok(()),
        }
    }

    async fn delete_many(&self, filter: &Filter) -> StoreResult<DeleteResult> {
        self.delete_many_in(None, filter).await
    }
}

// ============================================================================
// Transaction session
// ============================================================================

/// Store operations bound to an open session transaction.
pub struct DocTx<E, D: DocumentDriver> {
    session: D::Session,
    store: DocumentStore<E, D>,
}

impl<E: Entity, D: DocumentDriver> DocTx<E, D> {
    pub async fn save(&mut self, entity: &mut E) -> StoreResult<Generated> {
        self.store.save_in(Some(&mut self.session), entity).await
    }

    pub async fn update(&mut self, entity: &mut E) -> StoreResult<()> {
        self.store.update_in(Some(&mut self.session), entity).await
    }

    pub async fn upsert(&mut self, entity: &mut E, spec: &UpsertSpec) -> StoreResult<UpsertOutcome> {
        self.store.upsert_in(Some(&mut self.session), entity, spec).await
    }

    pub async fn find_by_id<I: Into<Value>>(&mut self, id: I) -> StoreResult<E> {
        self.store.find_by_id_in(Some(&mut self.session), id.into()).await
    }

    pub async fn find_all(&mut self, filter: &Filter, options: FindOptions) -> StoreResult<Vec<E>> {
        self.store.find_all_in(Some(&mut self.session), filter, options).await
    }

    pub async fn count(&mut self, filter: &Filter) -> StoreResult<u64> {
        self.store.count_in(Some(&mut self.session), filter).await
    }

    pub async fn delete<I: Into<Value>>(&mut self, id: I) -> StoreResult<()> {
        self.store.delete_in(Some(&mut self.session), id.into()).await
    }

    pub async fn delete_many(&mut self, filter: &Filter) -> StoreResult<DeleteResult> {
        self.store.delete_many_in(Some(&mut self.session), filter).await
    }
}

#[async_trait]
impl<E: Entity, D: DocumentDriver> Envelope for DocTx<E, D> {
    async fn commit(self) -> Result<(), BoxError> {
        let DocTx { session, store } = self;
        store.driver.commit(session).await
    }

    async fn rollback(self) -> Result<(), BoxError> {
        let DocTx { session, store } = self;
        store.driver.abort(session).await
    }
}

//! MongoDB driver.
//!
//! Bulk operations are issued one write at a time so that ordered and
//! unordered batches report the same per-index failures as the in-memory
//! engine. Transactions need a replica set or a sharded cluster; a
//! standalone server is detected with `hello` when a session starts.

use async_trait::async_trait;
use bson::{Bson, Document, doc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::{Client, ClientSession, Collection, Database};

use super::{DocumentDriver, FindSpec, UpsertOp};
use crate::error::{BoxError, BulkWriteError, BulkWriteFailure, StoreError, StoreResult};
use crate::store::{BulkWriteResult, UpdateResult};
use crate::value::Value;

const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Clone)]
pub struct MongoDriver {
    client: Client,
    database: Database,
}

impl MongoDriver {
    pub async fn connect(uri: &str, database: &str) -> StoreResult<Self> {
        let client = Client::with_uri_str(uri).await.map_err(classify)?;
        tracing::info!(database = %database, "Connected to MongoDB");
        Ok(Self::new(client, database))
    }

    pub fn new(client: Client, database: &str) -> Self {
        let database = client.database(database);
        Self { client, database }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }

    /// True when the deployment is a replica set member or a mongos.
    async fn supports_transactions(&self) -> StoreResult<bool> {
        let hello = self
            .database
            .run_command(doc! { "hello": 1 })
            .await
            .map_err(classify)?;
        Ok(hello.contains_key("setName") || hello.get_str("msg").is_ok_and(|m| m == "isdbgrid"))
    }

    async fn upsert_each(
        &self,
        mut session: Option<&mut ClientSession>,
        collection: &str,
        ops: Vec<UpsertOp>,
        ordered: bool,
    ) -> StoreResult<BulkWriteResult> {
        let mut partial = BulkWriteResult::default();
        let mut failures = Vec::new();

        for (index, op) in ops.into_iter().enumerate() {
            let outcome = self
                .update_one(session.as_deref_mut(), collection, op.filter, op.update, true)
                .await;
            match outcome {
                Ok(result) => partial.record_upsert(index, &result),
                Err(err) => {
                    failures.push(BulkWriteFailure {
                        index,
                        message: err.to_string(),
                    });
                    if ordered {
                        break;
                    }
                }
            }
        }

        bulk_outcome(partial, failures, ordered)
    }
}

#[async_trait]
impl DocumentDriver for MongoDriver {
    type Session = ClientSession;

    async fn find(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: Document,
        spec: FindSpec,
    ) -> StoreResult<Vec<Document>> {
        tracing::debug!(collection = %collection, filter = %filter, "Executing find");
        let mut find = self.collection(collection).find(filter).skip(spec.skip);
        if let Some(sort) = spec.sort {
            find = find.sort(sort);
        }
        if spec.limit > 0 {
            find = find.limit(spec.limit);
        }

        match session {
            Some(session) => {
                let mut cursor = find.session(&mut *session).await.map_err(classify)?;
                cursor.stream(session).try_collect().await.map_err(classify)
            }
            None => find.await.map_err(classify)?.try_collect().await.map_err(classify),
        }
    }

    async fn count(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64> {
        let count = self.collection(collection).count_documents(filter);
        let result = match session {
            Some(session) => count.session(session).await,
            None => count.await,
        };
        result.map_err(classify)
    }

    async fn insert_one(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        document: Document,
    ) -> StoreResult<Bson> {
        tracing::debug!(collection = %collection, "Executing insert");
        let insert = self.collection(collection).insert_one(document);
        let result = match session {
            Some(session) => insert.session(session).await,
            None => insert.await,
        }
        .map_err(classify)?;
        Ok(result.inserted_id)
    }

    async fn insert_many(
        &self,
        mut session: Option<&mut ClientSession>,
        collection: &str,
        documents: Vec<Document>,
        ordered: bool,
    ) -> StoreResult<Vec<Bson>> {
        let mut ids = Vec::with_capacity(documents.len());
        let mut partial = BulkWriteResult::default();
        let mut failures = Vec::new();

        for (index, document) in documents.into_iter().enumerate() {
            match self.insert_one(session.as_deref_mut(), collection, document).await {
                Ok(id) => {
                    partial.inserted_count += 1;
                    ids.push(id);
                }
                Err(err) => {
                    failures.push(BulkWriteFailure {
                        index,
                        message: err.to_string(),
                    });
                    if ordered {
                        break;
                    }
                }
            }
        }

        bulk_outcome(partial, failures, ordered).map(|_| ids)
    }

    async fn update_one(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult> {
        tracing::debug!(collection = %collection, filter = %filter, upsert, "Executing update");
        let action = self.collection(collection).update_one(filter, update).upsert(upsert);
        let result = match session {
            Some(session) => action.session(session).await,
            None => action.await,
        }
        .map_err(classify)?;
        Ok(convert_update(result))
    }

    async fn update_many(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> StoreResult<UpdateResult> {
        tracing::debug!(collection = %collection, filter = %filter, "Executing update");
        let action = self.collection(collection).update_many(filter, update);
        let result = match session {
            Some(session) => action.session(session).await,
            None => action.await,
        }
        .map_err(classify)?;
        Ok(convert_update(result))
    }

    async fn delete_one(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64> {
        tracing::debug!(collection = %collection, filter = %filter, "Executing delete");
        let action = self.collection(collection).delete_one(filter);
        let result = match session {
            Some(session) => action.session(session).await,
            None => action.await,
        }
        .map_err(classify)?;
        Ok(result.deleted_count)
    }

    async fn delete_many(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64> {
        tracing::debug!(collection = %collection, filter = %filter, "Executing delete");
        let action = self.collection(collection).delete_many(filter);
        let result = match session {
            Some(session) => action.session(session).await,
            None => action.await,
        }
        .map_err(classify)?;
        Ok(result.deleted_count)
    }

    async fn bulk_upsert(
        &self,
        session: Option<&mut ClientSession>,
        collection: &str,
        ops: Vec<UpsertOp>,
        ordered: bool,
    ) -> StoreResult<BulkWriteResult> {
        self.upsert_each(session, collection, ops, ordered).await
    }

    async fn start_session(&self) -> StoreResult<ClientSession> {
        if !self.supports_transactions().await? {
            return Err(StoreError::TransactionUnsupported(
                "MongoDB standalone servers cannot run multi-document transactions".into(),
            ));
        }
        let mut session = self.client.start_session().await.map_err(classify)?;
        session.start_transaction().await.map_err(classify)?;
        Ok(session)
    }

    async fn commit(&self, mut session: ClientSession) -> Result<(), BoxError> {
        session.commit_transaction().await.map_err(|e| Box::new(e) as BoxError)
    }

    async fn abort(&self, mut session: ClientSession) -> Result<(), BoxError> {
        session.abort_transaction().await.map_err(|e| Box::new(e) as BoxError)
    }
}

fn convert_update(result: mongodb::results::UpdateResult) -> UpdateResult {
    UpdateResult {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted_count: u64::from(result.upserted_id.is_some()),
        upserted_id: result.upserted_id.map(Value::from),
    }
}

fn bulk_outcome(
    partial: BulkWriteResult,
    failures: Vec<BulkWriteFailure>,
    ordered: bool,
) -> StoreResult<BulkWriteResult> {
    if failures.is_empty() {
        return Ok(partial);
    }
    Err(StoreError::BulkWrite(Box::new(BulkWriteError {
        partial,
        failures,
        ordered,
    })))
}

fn classify(err: mongodb::error::Error) -> StoreError {
    if let ErrorKind::Write(WriteFailure::WriteError(write)) = err.kind.as_ref() {
        if write.code == DUPLICATE_KEY_CODE {
            return StoreError::DuplicateKey(write.message.clone());
        }
    }
    StoreError::driver(err)
}

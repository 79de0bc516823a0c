//! Document backends.
//!
//! A [`DocumentDriver`] executes already-compiled BSON predicates and update
//! documents against a named collection. Every operation optionally runs
//! inside a session opened with [`DocumentDriver::start_session`]; a session
//! is finished exactly once with `commit` or `abort`.

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongo;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::error::{BoxError, StoreResult};
use crate::store::{BulkWriteResult, UpdateResult};

pub use memory::{MemoryDriver, MemorySession};
#[cfg(feature = "mongodb")]
pub use mongo::MongoDriver;

/// Sort, skip and limit of a find.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindSpec {
    /// `{ key: 1 | -1, … }`, applied in key order.
    pub sort: Option<Document>,
    pub skip: u64,
    /// 0 returns every match.
    pub limit: i64,
}

impl FindSpec {
    pub fn first() -> Self {
        Self {
            limit: 1,
            ..Default::default()
        }
    }
}

/// One entry of a bulk upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOp {
    pub filter: Document,
    pub update: Document,
}

#[async_trait]
pub trait DocumentDriver: Send + Sync + 'static {
    type Session: Send;

    async fn find(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: Document,
        spec: FindSpec,
    ) -> StoreResult<Vec<Document>>;

    async fn count(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64>;

    /// Insert one document, returning its `_id`.
    ///
    /// A document without `_id` gets one generated by the backend. A
    /// duplicate `_id` fails with [`StoreError::DuplicateKey`](crate::StoreError::DuplicateKey).
    async fn insert_one(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        document: Document,
    ) -> StoreResult<Bson>;

    /// Insert several documents, returning their `_id`s in input order.
    ///
    /// Ordered inserts stop at the first failure; unordered ones attempt
    /// every document. Any failure is reported as
    /// [`StoreError::BulkWrite`](crate::StoreError::BulkWrite) with the
    /// partial counts.
    async fn insert_many(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        documents: Vec<Document>,
        ordered: bool,
    ) -> StoreResult<Vec<Bson>>;

    /// Update the first match, inserting one when `upsert` is set and
    /// nothing matched.
    async fn update_one(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreResult<UpdateResult>;

    async fn update_many(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> StoreResult<UpdateResult>;

    /// Delete the first match, returning the number removed.
    async fn delete_one(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64>;

    async fn delete_many(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        filter: Document,
    ) -> StoreResult<u64>;

    /// Run every upsert, honouring `ordered` the way `insert_many` does.
    async fn bulk_upsert(
        &self,
        session: Option<&mut Self::Session>,
        collection: &str,
        ops: Vec<UpsertOp>,
        ordered: bool,
    ) -> StoreResult<BulkWriteResult>;

    /// Open a session with a running transaction.
    ///
    /// Fails with [`StoreError::TransactionUnsupported`](crate::StoreError::TransactionUnsupported)
    /// when the deployment cannot run multi-document transactions.
    async fn start_session(&self) -> StoreResult<Self::Session>;

    async fn commit(&self, session: Self::Session) -> Result<(), BoxError>;

    async fn abort(&self, session: Self::Session) -> Result<(), BoxError>;
}

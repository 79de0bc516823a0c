//! Uniform CRUD and upsert persistence over relational and document backends.
//!
//! One entity type, one filter vocabulary and one option set drive both
//! [`SqlStore`] (SQLite through sqlx, with statement text for PostgreSQL,
//! MySQL, MariaDB and Oracle) and [`DocumentStore`] (any
//! [`DocumentDriver`]: the in-process [`MemoryDriver`] or, with the
//! `mongodb` feature, MongoDB).
//!
//! ```rust,ignore
//! use dbstore::{Entity, FindOptions, SqlStore, Store, filter};
//!
//! #[derive(Entity, Default, Debug, Clone)]
//! struct Person {
//!     #[store(primary_key, auto)]
//!     id: i64,
//!     name: String,
//!     age: i64,
//!     created_at: chrono::DateTime<chrono::Utc>,
//! }
//!
//! let store = SqlStore::<Person>::new(pool, "people");
//! let adults = store
//!     .find_all(&filter! { "age__gte" => 18 }, FindOptions::new())
//!     .await?;
//! ```

extern crate self as dbstore;

pub mod config;
pub mod db;
pub mod dialect;
pub mod driver;
pub mod entity;
pub mod error;
pub mod filter;
pub mod logging;
pub mod mapper;
pub mod page;
pub mod store;
pub mod value;

pub use dbstore_macros::Entity;

pub use config::StoreConfig;
pub use dialect::{DatabaseDriver, Dialect, UpsertStrategy};
pub use driver::{DocumentDriver, MemoryDriver};
#[cfg(feature = "mongodb")]
pub use driver::MongoDriver;
pub use entity::{CoercionError, Entity, EntityDescriptor, FieldDescriptor, FromValue, ToValue};
pub use error::{StoreError, StoreResult, TransactionError};
pub use filter::sql::FieldPolicy;
pub use filter::{Filter, FilterExpression, Operator};
pub use mapper::{CoercionPolicy, EntityMapper, Generated};
pub use page::{Cursor, Page, PageMeta};
pub use store::{
    BulkWriteResult, DbPool, DeleteResult, DocTx, DocumentStore, FindOptions, InsertManyResult,
    SortOrder, SqlStore, SqlTx, Store, UpdateResult, UpdateSpec, UpsertOutcome, UpsertSpec,
    WriteOrder,
};
pub use value::Value;

//! Store error taxonomy.

use std::fmt;

use thiserror::Error;

use crate::store::BulkWriteResult;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Boxed cause carried by driver and transaction errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by every store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup, update or delete target is absent.
    #[error("record not found: {0}")]
    NotFound(String),

    /// Required filter/fields missing, empty conflict list, unknown field.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No upsert strategy exists for the requested dialect.
    #[error("unsupported database driver: {0}")]
    UnsupportedDialect(String),

    /// A filter value cannot be compared with the requested operator.
    #[error("type mismatch on `{field}`: {message}")]
    TypeMismatch { field: String, message: String },

    /// Decoded values could not be converted into the entity's field types.
    #[error("type coercion failed: {}", join_issues(.0))]
    TypeCoercion(Vec<CoercionIssue>),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Unique constraint violation on insert.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// The backend deployment cannot run multi-statement transactions.
    #[error("transactions are not supported by this deployment: {0}")]
    TransactionUnsupported(String),

    /// One or more operations of a document bulk write failed.
    #[error("bulk write failed: {} of the operations reported errors", .0.failures.len())]
    BulkWrite(Box<BulkWriteError>),

    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Error raised by a document driver.
    #[error("driver error: {0}")]
    Driver(#[source] BoxError),
}

impl StoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn type_mismatch(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Driver(Box::new(err))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::DuplicateKey(db.message().to_string())
            }
            _ => StoreError::Database(err),
        }
    }
}

/// Failures of the begin/commit/rollback envelope.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("failed to begin transaction: {0}")]
    Begin(#[source] BoxError),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] BoxError),

    /// Rolling back after `cause` failed as well; both are kept.
    #[error("transaction error: {cause}, rollback error: {source}")]
    Rollback {
        cause: Box<StoreError>,
        #[source]
        source: BoxError,
    },
}

/// A single field that could not be converted while decoding a row or document.
#[derive(Debug, Clone, PartialEq)]
pub struct CoercionIssue {
    pub field: String,
    pub message: String,
}

impl fmt::Display for CoercionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_issues(issues: &[CoercionIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Per-operation failure inside a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteFailure {
    pub index: usize,
    pub message: String,
}

/// Partial outcome of a failed bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteError {
    /// Counts of the operations that did succeed.
    pub partial: BulkWriteResult,
    pub failures: Vec<BulkWriteFailure>,
    /// Whether the batch stopped at the first failure.
    pub ordered: bool,
}

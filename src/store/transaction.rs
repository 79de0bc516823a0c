//! Commit/rollback handling shared by both store families.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

pub(crate) use crate::error::BoxError;
use crate::error::{StoreError, StoreResult, TransactionError};

type Panic = Box<dyn Any + Send>;

/// An open transaction that can be finished exactly once.
#[async_trait]
pub(crate) trait Envelope: Send + Sized {
    async fn commit(self) -> Result<(), BoxError>;
    async fn rollback(self) -> Result<(), BoxError>;
}

/// Run `work`, turning a panic inside it into a value.
pub(crate) async fn guarded<R, Fut>(work: Fut) -> Result<StoreResult<R>, Panic>
where
    Fut: Future<Output = StoreResult<R>>,
{
    AssertUnwindSafe(work).catch_unwind().await
}

/// Finish `envelope` according to the unit of work's outcome.
///
/// `Ok` commits. `Err` rolls back and returns the error untouched; if the
/// rollback fails too, both are returned as [`TransactionError::Rollback`].
/// A panic rolls back and then resumes unwinding.
pub(crate) async fn settle<T, R>(envelope: T, outcome: Result<StoreResult<R>, Panic>) -> StoreResult<R>
where
    T: Envelope,
{
    match outcome {
        Ok(Ok(value)) => {
            envelope.commit().await.map_err(TransactionError::Commit)?;
            tracing::debug!("Transaction committed");
            Ok(value)
        }
        Ok(Err(cause)) => match envelope.rollback().await {
            Ok(()) => {
                tracing::warn!(error = %cause, "Transaction rolled back");
                Err(cause)
            }
            Err(source) => {
                tracing::error!(error = %cause, rollback_error = %source, "Transaction rollback failed");
                Err(StoreError::Transaction(TransactionError::Rollback {
                    cause: Box::new(cause),
                    source,
                }))
            }
        },
        Err(panic) => {
            if let Err(source) = envelope.rollback().await {
                tracing::error!(rollback_error = %source, "Rollback after panic failed");
            } else {
                tracing::warn!("Transaction rolled back after panic");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU8, Ordering};

    const COMMITTED: u8 = 1;
    const ROLLED_BACK: u8 = 2;

    struct Probe {
        state: Arc<AtomicU8>,
        fail_rollback: bool,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("connection reset")]
    struct Reset;

    #[async_trait]
    impl Envelope for Probe {
        async fn commit(self) -> Result<(), BoxError> {
            self.state.store(COMMITTED, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(self) -> Result<(), BoxError> {
            self.state.store(ROLLED_BACK, Ordering::SeqCst);
            if self.fail_rollback {
                return Err(Box::new(Reset));
            }
            Ok(())
        }
    }

    fn probe(fail_rollback: bool) -> (Probe, Arc<AtomicU8>) {
        let state = Arc::new(AtomicU8::new(0));
        (
            Probe {
                state: state.clone(),
                fail_rollback,
            },
            state,
        )
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let (envelope, state) = probe(false);
        let outcome = guarded(async { Ok(5) }).await;
        assert_eq!(settle(envelope, outcome).await.unwrap(), 5);
        assert_eq!(state.load(Ordering::SeqCst), COMMITTED);
    }

    #[tokio::test]
    async fn test_rollback_returns_original_error() {
        let (envelope, state) = probe(false);
        let outcome = guarded(async { Err::<(), _>(StoreError::NotFound("person 1".into())) }).await;
        assert_matches!(settle(envelope, outcome).await, Err(StoreError::NotFound(msg)) if msg == "person 1");
        assert_eq!(state.load(Ordering::SeqCst), ROLLED_BACK);
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_cause() {
        let (envelope, _) = probe(true);
        let outcome = guarded(async { Err::<(), _>(StoreError::validation("bad")) }).await;
        let err = settle(envelope, outcome).await.unwrap_err();
        assert_matches!(
            err,
            StoreError::Transaction(TransactionError::Rollback { ref cause, .. })
                if matches!(**cause, StoreError::Validation(_))
        );
        assert_eq!(
            err.to_string(),
            "transaction error: validation failed: bad, rollback error: connection reset"
        );
    }

    #[tokio::test]
    async fn test_panic_rolls_back_then_resumes() {
        let (envelope, state) = probe(false);
        let outcome = guarded(async {
            if state.load(Ordering::SeqCst) == 0 {
                panic!("unit of work exploded");
            }
            Ok(())
        })
        .await;

        let resumed = AssertUnwindSafe(settle(envelope, outcome)).catch_unwind().await;
        assert!(resumed.is_err());
        assert_eq!(state.load(Ordering::SeqCst), ROLLED_BACK);
    }
}

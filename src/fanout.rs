//! Concurrent fan-out with index-preserving result reassembly.
//!
//! Every operation runs on its own tokio task bounded by the executor's
//! timeout.  Results come back in input order regardless of completion
//! order.  Two policies exist:
//!
//! - [`FanOut::run_all`] never cancels anything (best-effort paths such as
//!   bulk uploads and URL signing).
//! - [`FanOut::run_all_or_abort`] aborts every still-running
//!   [`Policy::Abortable`] operation as soon as any operation fails.
//!   [`Policy::Protected`] operations always run to completion so their
//!   result (for example the previous key returned by a metadata swap) is
//!   never lost.
//!
//! All spawned tasks are settled before either method returns.  If the
//! caller drops the returned future early, abortable tasks are aborted and
//! protected ones are left to finish on their own.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinError};

use crate::errors::MediaError;

/// Boxed unit of work handed to the executor.
pub type BoxOp<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'static>>;

/// What happens to an operation when a sibling fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Abortable,
    Protected,
}

/// An operation together with its cancellation policy.
pub struct Op<T, E> {
    policy: Policy,
    fut: BoxOp<T, E>,
}

impl<T, E> Op<T, E> {
    pub fn abortable<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            policy: Policy::Abortable,
            fut: Box::pin(fut),
        }
    }

    pub fn protected<F>(fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            policy: Policy::Protected,
            fut: Box::pin(fut),
        }
    }
}

/// Why a fanned-out operation produced no value.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    #[error("{0}")]
    Failed(E),
    #[error("cancelled after a sibling operation failed")]
    Cancelled,
    #[error("timed out")]
    TimedOut,
    #[error("panicked: {0}")]
    Panicked(String),
}

impl<E> TaskError<E> {
    /// True when the operation may or may not have taken effect.
    pub fn is_indeterminate(&self) -> bool {
        matches!(
            self,
            TaskError::Cancelled | TaskError::TimedOut | TaskError::Panicked(_)
        )
    }

    fn from_join(err: JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            TaskError::Panicked(message)
        } else {
            TaskError::Cancelled
        }
    }
}

impl TaskError<MediaError> {
    /// Collapse into the error reported to the caller.
    pub fn into_media_error(self, operation: &str) -> MediaError {
        match self {
            TaskError::Failed(e) => e,
            TaskError::TimedOut => MediaError::Timeout {
                operation: operation.to_string(),
            },
            TaskError::Cancelled => {
                MediaError::Internal(anyhow::anyhow!("{operation} was cancelled"))
            }
            TaskError::Panicked(msg) => {
                MediaError::Internal(anyhow::anyhow!("{operation} panicked: {msg}"))
            }
        }
    }
}

/// Aborts whatever abortable tasks are still registered when dropped.
struct AbortGuard(Vec<Option<AbortHandle>>);

impl AbortGuard {
    fn abort_all(&mut self) {
        for handle in self.0.iter_mut().filter_map(Option::take) {
            handle.abort();
        }
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Runs groups of operations concurrently on the tokio runtime.
#[derive(Debug, Clone)]
pub struct FanOut {
    timeout: Duration,
}

impl FanOut {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run every operation to completion, never cancelling siblings.
    pub async fn run_all<T, E, F>(&self, ops: Vec<F>) -> Vec<Result<T, TaskError<E>>>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let ops = ops.into_iter().map(Op::protected).collect();
        self.drive(ops, false).await
    }

    /// Run every operation; the first failure aborts abortable siblings.
    pub async fn run_all_or_abort<T, E>(&self, ops: Vec<Op<T, E>>) -> Vec<Result<T, TaskError<E>>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        self.drive(ops, true).await
    }

    async fn drive<T, E>(
        &self,
        ops: Vec<Op<T, E>>,
        abort_on_failure: bool,
    ) -> Vec<Result<T, TaskError<E>>>
    where
        T: Send + 'static,
        E: Send + 'static,
    {
        let count = ops.len();
        let mut guard = AbortGuard(Vec::with_capacity(count));
        let mut pending = FuturesUnordered::new();

        for (index, op) in ops.into_iter().enumerate() {
            let timeout = self.timeout;
            let fut = op.fut;
            let handle = tokio::spawn(async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(TaskError::Failed(e)),
                    Err(_) => Err(TaskError::TimedOut),
                }
            });
            guard.0.push(match op.policy {
                Policy::Abortable => Some(handle.abort_handle()),
                Policy::Protected => None,
            });
            pending.push(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<Result<T, TaskError<E>>>> =
            std::iter::repeat_with(|| None).take(count).collect();

        while let Some((index, joined)) = pending.next().await {
            guard.0[index] = None;
            let result = joined.unwrap_or_else(|e| Err(TaskError::from_join(e)));
            if abort_on_failure && result.is_err() {
                guard.abort_all();
            }
            slots[index] = Some(result);
        }

        slots
            .into_iter()
            .map(|slot| slot.unwrap_or(Err(TaskError::Cancelled)))
            .collect()
    }
}

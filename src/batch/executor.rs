//! The batch-execution seam.

use async_trait::async_trait;
use std::future::Future;

use crate::error::BatchError;

/// Runs one flushed batch.
///
/// Implementations receive payloads in submission order and must return
/// exactly one result per payload, in the same order. Returning an error
/// fails every request in the batch.
#[async_trait]
pub trait BatchExecutor<P, R>: Send + Sync
where
    P: Send + 'static,
    R: Send + 'static,
{
    async fn execute(&self, payloads: Vec<P>) -> Result<Vec<R>, BatchError>;
}

/// Adapts an async closure into a [`BatchExecutor`].
pub struct FnExecutor<F>(F);

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<P, R, F, Fut> BatchExecutor<P, R> for FnExecutor<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(Vec<P>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<R>, BatchError>> + Send,
{
    async fn execute(&self, payloads: Vec<P>) -> Result<Vec<R>, BatchError> {
        (self.0)(payloads).await
    }
}

//! Single-retry policy for reads on a resumable cursor
//!
//! An operation is run once. If it fails with a network error or a
//! "not primary"/"node is recovering" server error, the target's cursor is
//! closed and the operation is run exactly one more time. Any other error,
//! and any error from the second attempt, is returned unchanged.

use crate::error::{DriverError, DriverResult};
use async_trait::async_trait;
use futures::future::BoxFuture;

/// Something holding a server-side cursor that can be abandoned before a
/// retry.
#[async_trait]
pub trait Resumable: Send {
    /// Drop the current cursor after `error`. Must not fail; cleanup
    /// problems are logged by the implementation.
    async fn close_cursor(&mut self, error: &DriverError);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    pub fn new() -> Self {
        Self
    }

    /// Run `operation` against `target`, retrying once after a resumable
    /// error.
    pub async fn run<R, T, F>(&self, target: &mut R, mut operation: F) -> DriverResult<T>
    where
        R: Resumable + ?Sized,
        F: for<'a> FnMut(&'a mut R) -> BoxFuture<'a, DriverResult<T>>,
    {
        match operation(target).await {
            Ok(value) => Ok(value),
            Err(e) if e.is_resumable() => {
                tracing::debug!("Retrying once after resumable error: {}", e);
                target.close_cursor(&e).await;
                operation(target).await
            }
            Err(e) => Err(e),
        }
    }
}

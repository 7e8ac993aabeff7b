//! Deadline wrapper for asynchronous operations.
//!
//! Exactly one of the operation and the deadline settles the call. When the
//! operation finishes first its timer is dropped with it; when the deadline
//! fires first the operation future is dropped at its current suspension point.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Timeout after {} ms", .elapsed.as_millis())]
pub struct TimeoutError {
    pub elapsed: Duration,
}

/// Runs `operation` with a deadline, failing with [`TimeoutError`] when it fires first.
pub async fn run_with_timeout<F>(deadline: Duration, operation: F) -> Result<F::Output, TimeoutError>
where
    F: Future,
{
    let started = Instant::now();
    tokio::time::timeout(deadline, operation)
        .await
        .map_err(|_| TimeoutError {
            elapsed: started.elapsed(),
        })
}

/// Runs `operation` with a deadline, resolving with `on_timeout` when it fires first.
pub async fn run_with_timeout_or_else<F, G, Fut>(deadline: Duration, operation: F, on_timeout: G) -> F::Output
where
    F: Future,
    G: FnOnce() -> Fut,
    Fut: Future<Output = F::Output>,
{
    match tokio::time::timeout(deadline, operation).await {
        Ok(output) => output,
        Err(_) => on_timeout().await,
    }
}

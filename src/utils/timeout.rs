//! Async timeout helpers.

use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{Result, RpcError};

/// Default timeout for opening a channel.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a pool worker waits for work before considering retirement.
pub const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period for in-flight work when a server stops.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `fut`, failing with [`RpcError::Timeout`] after `duration`.
pub async fn with_timeout_error<F, T>(fut: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout),
    }
}

/// Like [`with_timeout_error`], but `None` waits indefinitely.
pub async fn with_optional_timeout<F, T>(fut: F, duration: Option<Duration>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match duration {
        Some(duration) => with_timeout_error(fut, duration).await,
        None => fut.await,
    }
}

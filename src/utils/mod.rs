//! # Utility Modules
//!
//! Supporting utilities for logging, metrics, and timing.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe observability counters
//! - **Timeout**: Async timeout wrappers

pub mod logging;
pub mod metrics;
pub mod timeout;

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use crate::error::constants;

/// Lock a registry mutex. A panic while holding the lock never leaves the
/// guarded maps half-updated, so a poisoned lock is entered anyway.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("{}, recovering", constants::ERR_LOCK_POISONED);
        poisoned.into_inner()
    })
}

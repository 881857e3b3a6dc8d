//! Single-runner guard shared by the periodic jobs.
//!
//! A job runs only while its process holds the job's `MutexLease` key. The key
//! is released whether the job returns, fails or panics; a process that dies
//! mid-run leaves the key to expire after its TTL.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use chrono::Duration;
use futures::FutureExt;

use crate::db::store::MutexLease;
use crate::error::{AppError, AppResult};

/// Run `job` under `key`. `None` when another runner holds the key.
pub async fn run_exclusive<T, F>(
    mutex: &dyn MutexLease,
    key: &str,
    ttl: Duration,
    job: F,
) -> AppResult<Option<T>>
where
    F: Future<Output = AppResult<T>>,
{
    if !mutex.acquire(key, ttl).await? {
        tracing::info!("{} already running elsewhere", key);
        return Ok(None);
    }

    let outcome = AssertUnwindSafe(job).catch_unwind().await;

    if let Err(e) = mutex.release(key).await {
        tracing::warn!("Failed to release {}: {:?}", key, e);
    }

    match outcome {
        Ok(result) => result.map(Some),
        Err(_) => Err(AppError::Internal(anyhow::anyhow!("{} panicked", key))),
    }
}

/// Push the lease expiry out between pages of a long run.
pub async fn keep_lease(mutex: &dyn MutexLease, key: &str, ttl: Duration) {
    match mutex.extend(key, ttl).await {
        Ok(true) => {}
        Ok(false) => tracing::warn!("Lost {} while sweeping", key),
        Err(e) => tracing::warn!("Failed to extend {}: {:?}", key, e),
    }
}

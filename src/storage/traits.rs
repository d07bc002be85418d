//! Storage trait definitions.
//!
//! These traits define the interface for storage backends, enabling swapping
//! between different implementations without changing business logic.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{StorageError, StorageResult};

/// Raw document storage.
///
/// Lookups return `None` for missing keys. Mutations spanning several calls
/// are not synchronized here; wrap them in [`Storage::lock`].
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read a text document.
    async fn read(&self, path: &str) -> StorageResult<Option<String>>;

    /// Create or replace a text document.
    async fn write(&self, path: &str, data: &str) -> StorageResult<()>;

    /// Append to an existing text document.
    ///
    /// Fails with [`StorageError::NotFound`] if the document does not exist.
    async fn append(&self, path: &str, data: &str) -> StorageResult<()>;

    /// Read a binary document.
    async fn read_bytes(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.read(path).await?.map(String::into_bytes))
    }

    /// Create or replace a binary document.
    async fn write_bytes(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let text = std::str::from_utf8(data).map_err(|e| StorageError::backend(path, e))?;
        self.write(path, text).await
    }

    /// Check whether a document exists.
    async fn exists(&self, path: &str) -> StorageResult<bool>;

    /// Delete a document. Returns `true` iff something was removed.
    async fn delete(&self, path: &str) -> StorageResult<bool>;

    /// List keys starting with `prefix`, excluding reserved and hidden keys.
    async fn list_keys(&self, prefix: &str) -> StorageResult<HashSet<String>>;

    /// Acquire the lock for `resource`, waiting at most `timeout`.
    async fn lock(&self, resource: &str, timeout: Duration) -> StorageResult<LockGuard>;

    /// Check if the storage backend is healthy and reachable.
    async fn health_check(&self) -> StorageResult<()>;

    /// Get the storage backend name.
    fn backend_name(&self) -> &'static str;

    /// Get the lock strategy name.
    fn lock_strategy(&self) -> &'static str;
}

/// Retry settings for lock acquisition loops.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base delay between contention retries.
    pub retry_delay: Duration,
    /// Consecutive transient backend errors tolerated before giving up.
    pub retry_attempts: u32,
}

impl RetryPolicy {
    /// Create a retry policy.
    #[must_use]
    pub const fn new(retry_delay: Duration, retry_attempts: u32) -> Self {
        Self {
            retry_delay,
            retry_attempts,
        }
    }

    /// Retry delay with ±25% jitter.
    ///
    /// Contenders polling the same lock with one fixed interval stay in
    /// lockstep; the jitter spreads them out.
    #[must_use]
    pub fn jittered_delay(&self) -> Duration {
        let factor = rand::rng().random_range(0.75..=1.25);
        Duration::try_from_secs_f64(self.retry_delay.as_secs_f64() * factor)
            .unwrap_or(self.retry_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(100), 3)
    }
}

/// Distributed lock operations.
///
/// Provides mutual exclusion per resource across processes. Implementations
/// only provide a single non-blocking attempt; the waiting loop is shared.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to acquire a lock without waiting.
    ///
    /// Stale locks are reclaimed inside this call. Returns `None` if the lock
    /// is held by a live owner.
    async fn try_acquire(&self, resource: &str) -> StorageResult<Option<LockGuard>>;

    /// Check if a live lock is currently held on `resource`.
    async fn is_locked(&self, resource: &str) -> StorageResult<bool>;

    /// Probe the lock backend.
    async fn is_healthy(&self) -> bool;

    /// Strategy name for logs and metrics.
    fn strategy_name(&self) -> &'static str;

    /// Retry settings.
    fn retry_policy(&self) -> RetryPolicy;

    /// Acquire a lock, retrying until `timeout` elapses.
    ///
    /// On timeout the caller is guaranteed not to hold the lock.
    async fn acquire(&self, resource: &str, timeout: Duration) -> StorageResult<LockGuard> {
        let policy = self.retry_policy();
        // `None` when the timeout is too large to represent: wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        let mut transient_errors = 0u32;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.try_acquire(resource).await {
                Ok(Some(guard)) => {
                    debug!(resource, attempts, strategy = self.strategy_name(), "Lock acquired");
                    return Ok(guard);
                }
                Ok(None) => transient_errors = 0,
                Err(e @ (StorageError::Backend { .. } | StorageError::Unavailable(_))) => {
                    transient_errors += 1;
                    if transient_errors > policy.retry_attempts {
                        return Err(e);
                    }
                    warn!(resource, error = %e, "Transient error while acquiring lock, retrying");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                debug!(resource, attempts, "Lock acquisition timed out");
                return Err(StorageError::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }
            let delay = policy.jittered_delay();
            sleep(deadline.map_or(delay, |deadline| delay.min(deadline - now))).await;
        }
    }
}

type ReleaseFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// RAII guard for distributed locks.
///
/// Call [`LockGuard::release`] on the normal path. If the guard is dropped
/// instead (early return, panic, cancelled task) the release is spawned on
/// the current Tokio runtime; without a runtime the lock lapses with its lease.
pub struct LockGuard {
    resource: String,
    owner_id: String,
    acquired_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    release_fn: Option<ReleaseFn>,
}

impl LockGuard {
    /// Create a new lock guard.
    pub fn new<F, Fut>(
        resource: impl Into<String>,
        owner_id: impl Into<String>,
        lease: Option<Duration>,
        release_fn: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let acquired_at = Utc::now();
        let expires_at = lease
            .and_then(|lease| chrono::Duration::from_std(lease).ok())
            .and_then(|lease| acquired_at.checked_add_signed(lease));
        Self {
            resource: resource.into(),
            owner_id: owner_id.into(),
            acquired_at,
            expires_at,
            release_fn: Some(Box::new(move || Box::pin(release_fn()))),
        }
    }

    /// Get the locked resource.
    #[must_use]
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Get the owner token written by this holder.
    #[must_use]
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// When the lock was acquired.
    #[must_use]
    pub const fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// When peers may start treating the lock as abandoned.
    #[must_use]
    pub const fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Release the lock.
    pub async fn release(mut self) {
        if let Some(release_fn) = self.release_fn.take() {
            release_fn().await;
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("resource", &self.resource)
            .field("owner_id", &self.owner_id)
            .field("acquired_at", &self.acquired_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release_fn) = self.release_fn.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        release_fn().await;
                    });
                }
                Err(_) => {
                    warn!(
                        resource = %self.resource,
                        "Lock guard dropped outside a runtime; lock will lapse with its lease"
                    );
                }
            }
        }
    }
}

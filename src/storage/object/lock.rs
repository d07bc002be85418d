//! Lock objects stored in the bucket.
//!
//! A lock is the object `{prefix}.locks/{encoded resource}` holding
//! `{"owner", "resource", "acquired_at", "expires_at"}`.
//!
//! Two modes:
//! - **Conditional**: creation uses the store's create-if-absent primitive, so
//!   exactly one contender wins. Stale locks are removed with a
//!   generation-conditional delete.
//! - **Verify-after-write**: for stores without conditional create. The
//!   contender writes its record, waits for the propagation delay and reads it
//!   back. Two contenders writing inside that window can both observe their own
//!   record, so mutual exclusion is best-effort only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::client::{CreateOutcome, ObjectClient, StoredObject};
use crate::error::{StorageError, StorageResult};
use crate::storage::key::{LOCKS_NAMESPACE, lock_name};
use crate::storage::traits::{DistributedLock, LockGuard, RetryPolicy};

/// Reclaim attempts per `try_acquire` before reporting the lock as busy.
const MAX_RECLAIMS: usize = 3;

/// Lock object body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockObjectRecord {
    /// Owner token.
    pub owner: Uuid,
    /// Locked resource.
    pub resource: String,
    /// Acquisition time.
    pub acquired_at: DateTime<Utc>,
    /// Lease end, seconds since the Unix epoch.
    pub expires_at: f64,
}

impl LockObjectRecord {
    fn new(resource: &str, lease: Duration) -> Self {
        let acquired_at = Utc::now();
        Self {
            owner: Uuid::new_v4(),
            resource: resource.to_string(),
            acquired_at,
            expires_at: epoch_seconds(acquired_at) + lease.as_secs_f64(),
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        epoch_seconds(now) > self.expires_at
    }
}

fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    // Millisecond precision is plenty for lease arithmetic.
    #[allow(clippy::cast_precision_loss)]
    let millis = time.timestamp_millis() as f64;
    millis / 1000.0
}

/// How lock acquisition is made exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectLockMode {
    /// Atomic create-if-absent.
    Conditional,
    /// Put, wait, read back. Best-effort.
    VerifyAfterWrite {
        /// Wait between the put and the verification read.
        propagation_delay: Duration,
    },
}

/// Outcome of one creation attempt.
enum Attempt {
    /// We hold the lock; carries the object generation when known.
    Won(Option<String>),
    Lost,
}

/// Observed state of an existing lock object.
enum Holder {
    Live,
    Stale(StoredObject),
    Gone,
}

/// Object-store lock manager.
pub struct ObjectLock {
    client: Arc<dyn ObjectClient>,
    prefix: String,
    lease: Duration,
    policy: RetryPolicy,
    mode: ObjectLockMode,
}

impl ObjectLock {
    /// Create a lock manager over `client`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if conditional mode is requested on a
    /// client that cannot create objects atomically.
    pub fn new(
        client: Arc<dyn ObjectClient>,
        prefix: impl Into<String>,
        lease: Duration,
        policy: RetryPolicy,
        mode: ObjectLockMode,
    ) -> StorageResult<Self> {
        if mode == ObjectLockMode::Conditional && !client.supports_conditional_create() {
            return Err(StorageError::Config(format!(
                "{} has no conditional create; object locks on it can only be best-effort",
                client.provider()
            )));
        }
        if let ObjectLockMode::VerifyAfterWrite { propagation_delay } = mode {
            warn!(
                provider = client.provider(),
                propagation_delay_ms = u64::try_from(propagation_delay.as_millis()).unwrap_or(u64::MAX),
                "Object locks use put-then-verify; concurrent contenders inside the propagation window can both acquire. Use the redis lock strategy for strict exclusion"
            );
        }
        Ok(Self {
            client,
            prefix: prefix.into(),
            lease,
            policy,
            mode,
        })
    }

    /// Pick the strongest mode the client supports.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`ObjectLock::new`].
    pub fn for_client(
        client: Arc<dyn ObjectClient>,
        prefix: impl Into<String>,
        lease: Duration,
        policy: RetryPolicy,
        propagation_delay: Duration,
    ) -> StorageResult<Self> {
        let mode = if client.supports_conditional_create() {
            ObjectLockMode::Conditional
        } else {
            ObjectLockMode::VerifyAfterWrite { propagation_delay }
        };
        Self::new(client, prefix, lease, policy, mode)
    }

    /// Acquisition mode.
    #[must_use]
    pub const fn mode(&self) -> ObjectLockMode {
        self.mode
    }

    /// Object key of the lock for `resource`.
    #[must_use]
    pub fn lock_key(&self, resource: &str) -> String {
        format!("{}{LOCKS_NAMESPACE}/{}", self.prefix, lock_name(resource))
    }

    async fn inspect(&self, key: &str) -> StorageResult<Holder> {
        let Some(object) = self.client.get(key).await? else {
            return Ok(Holder::Gone);
        };
        match serde_json::from_slice::<LockObjectRecord>(&object.data) {
            Ok(record) if !record.is_expired(Utc::now()) => Ok(Holder::Live),
            Ok(_) => Ok(Holder::Stale(object)),
            Err(e) => {
                // Object writes are atomic, so an unparseable body is never a
                // holder mid-write.
                warn!(key, error = %e, "Unreadable lock object");
                Ok(Holder::Stale(object))
            }
        }
    }

    /// Delete a stale lock object only if it is still the one judged stale.
    async fn reclaim(&self, key: &str, judged: &StoredObject) -> StorageResult<()> {
        if let Some(generation) = &judged.generation {
            self.client.delete_if_generation(key, generation).await?;
            return Ok(());
        }
        match self.client.get(key).await? {
            Some(current) if current.data == judged.data => {
                self.client.delete(key).await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn try_create(&self, key: &str, content: Vec<u8>) -> StorageResult<Attempt> {
        match self.mode {
            ObjectLockMode::Conditional => match self.client.create_if_absent(key, content).await? {
                CreateOutcome::Created { generation } => Ok(Attempt::Won(generation)),
                CreateOutcome::Exists => Ok(Attempt::Lost),
            },
            ObjectLockMode::VerifyAfterWrite { propagation_delay } => {
                if self.client.exists(key).await? {
                    return Ok(Attempt::Lost);
                }
                self.client.put(key, content.clone()).await?;
                tokio::time::sleep(propagation_delay).await;
                match self.client.get(key).await? {
                    Some(current) if current.data == content => Ok(Attempt::Won(current.generation)),
                    _ => {
                        debug!(key, "Lock write lost to another contender");
                        Ok(Attempt::Lost)
                    }
                }
            }
        }
    }

    fn guard(
        &self,
        key: String,
        record: &LockObjectRecord,
        content: Vec<u8>,
        generation: Option<String>,
    ) -> LockGuard {
        let client = Arc::clone(&self.client);
        let resource = record.resource.clone();
        LockGuard::new(
            record.resource.clone(),
            record.owner.to_string(),
            Some(self.lease),
            move || async move {
                release_lock_object(client.as_ref(), &key, &content, generation.as_deref(), &resource)
                    .await;
            },
        )
    }
}

/// Delete our lock object unless someone else has since taken it over.
async fn release_lock_object(
    client: &dyn ObjectClient,
    key: &str,
    ours: &[u8],
    generation: Option<&str>,
    resource: &str,
) {
    let result = match generation {
        Some(generation) => client.delete_if_generation(key, generation).await,
        None => match client.get(key).await {
            Ok(Some(current)) if current.data == ours => client.delete(key).await,
            Ok(Some(_)) => {
                warn!(resource, "Lock object was reclaimed by another holder before release");
                return;
            }
            Ok(None) => Ok(false),
            Err(e) => Err(e),
        },
    };

    match result {
        Ok(true) => debug!(resource, "Released object lock"),
        Ok(false) => debug!(resource, "Lock object already gone or replaced at release"),
        Err(e) => warn!(resource, error = %e, "Failed to release object lock; it will lapse with its lease"),
    }
}

#[async_trait]
impl DistributedLock for ObjectLock {
    #[instrument(skip(self), level = "debug")]
    async fn try_acquire(&self, resource: &str) -> StorageResult<Option<LockGuard>> {
        let key = self.lock_key(resource);

        for _ in 0..MAX_RECLAIMS {
            let record = LockObjectRecord::new(resource, self.lease);
            let content = serde_json::to_vec(&record).map_err(|e| StorageError::backend(&key, e))?;

            if let Attempt::Won(generation) = self.try_create(&key, content.clone()).await? {
                return Ok(Some(self.guard(key, &record, content, generation)));
            }

            match self.inspect(&key).await? {
                Holder::Live => return Ok(None),
                Holder::Gone => {}
                Holder::Stale(judged) => {
                    warn!(resource, key, "Reclaiming expired object lock");
                    self.reclaim(&key, &judged).await?;
                }
            }
        }

        Ok(None)
    }

    async fn is_locked(&self, resource: &str) -> StorageResult<bool> {
        Ok(matches!(
            self.inspect(&self.lock_key(resource)).await?,
            Holder::Live
        ))
    }

    async fn is_healthy(&self) -> bool {
        self.client.probe().await.is_ok()
    }

    fn strategy_name(&self) -> &'static str {
        match self.mode {
            ObjectLockMode::Conditional => "object",
            ObjectLockMode::VerifyAfterWrite { .. } => "object_verify",
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::object::MemoryObjectClient;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(10), 3)
    }

    fn conditional(client: &Arc<MemoryObjectClient>, lease: Duration) -> ObjectLock {
        ObjectLock::new(
            Arc::clone(client) as Arc<dyn ObjectClient>,
            "app/",
            lease,
            policy(),
            ObjectLockMode::Conditional,
        )
        .unwrap()
    }

    async fn plant(client: &MemoryObjectClient, key: &str, record: &LockObjectRecord) {
        client
            .put(key, serde_json::to_vec(record).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_key_layout() {
        let client = Arc::new(MemoryObjectClient::new());
        let lock = conditional(&client, Duration::from_secs(30));
        assert_eq!(lock.lock_key("users/u1"), "app/.locks/users%2Fu1");
    }

    #[tokio::test]
    async fn test_exclusive_until_released() {
        let client = Arc::new(MemoryObjectClient::new());
        let lock = conditional(&client, Duration::from_secs(30));

        let guard = lock.try_acquire("users/u1").await.unwrap().unwrap();
        assert!(lock.is_locked("users/u1").await.unwrap());
        assert!(lock.try_acquire("users/u1").await.unwrap().is_none());
        assert!(lock.try_acquire("users/u2").await.unwrap().is_some());

        guard.release().await;
        assert!(!lock.is_locked("users/u1").await.unwrap());
        assert!(lock.try_acquire("users/u1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let client = Arc::new(MemoryObjectClient::new());
        let lock = conditional(&client, Duration::from_secs(30));
        let key = lock.lock_key("users/u1");

        let mut abandoned = LockObjectRecord::new("users/u1", Duration::from_secs(30));
        abandoned.expires_at = epoch_seconds(Utc::now()) - 5.0;
        plant(&client, &key, &abandoned).await;

        let guard = lock
            .acquire("users/u1", Duration::from_millis(200))
            .await
            .unwrap();
        let stored: LockObjectRecord =
            serde_json::from_slice(&client.get(&key).await.unwrap().unwrap().data).unwrap();
        assert_ne!(stored.owner, abandoned.owner);
        assert_eq!(guard.owner_id(), stored.owner.to_string());
    }

    #[tokio::test]
    async fn test_live_lock_times_out() {
        let client = Arc::new(MemoryObjectClient::new());
        let lock = conditional(&client, Duration::from_secs(30));
        let _held = lock.try_acquire("r").await.unwrap().unwrap();

        let err = lock.acquire("r", Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_release_after_takeover_keeps_new_holder() {
        let client = Arc::new(MemoryObjectClient::new());
        let lock = conditional(&client, Duration::from_millis(20));

        let first = lock.try_acquire("r").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = lock.try_acquire("r").await.unwrap().unwrap();

        first.release().await;
        let stored: LockObjectRecord = serde_json::from_slice(
            &client.get(&lock.lock_key("r")).await.unwrap().unwrap().data,
        )
        .unwrap();
        assert_eq!(stored.owner.to_string(), second.owner_id());
    }

    #[tokio::test]
    async fn test_conditional_mode_requires_support() {
        let client: Arc<dyn ObjectClient> = Arc::new(MemoryObjectClient::without_conditional_create());
        let result = ObjectLock::new(
            client,
            "",
            Duration::from_secs(1),
            policy(),
            ObjectLockMode::Conditional,
        );
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[tokio::test]
    async fn test_verify_after_write_mode() {
        let client: Arc<dyn ObjectClient> = Arc::new(MemoryObjectClient::without_conditional_create());
        let lock = ObjectLock::for_client(
            client,
            "",
            Duration::from_secs(30),
            policy(),
            Duration::from_millis(5),
        )
        .unwrap();
        assert_eq!(lock.strategy_name(), "object_verify");

        let guard = lock.try_acquire("r").await.unwrap().unwrap();
        assert!(lock.try_acquire("r").await.unwrap().is_none());
        guard.release().await;
        assert!(!lock.is_locked("r").await.unwrap());
    }
}

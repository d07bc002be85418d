//! Redis-backed distributed locking.
//!
//! Acquisition is `SET key token NX PX lease`; release runs a script that
//! deletes the key only while it still holds our token, so a holder whose
//! lease lapsed can never remove its successor's lock.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config as PoolConfig, Connection, Pool, Runtime};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::storage::traits::{DistributedLock, LockGuard, RetryPolicy};

/// Key namespace for lock entries.
pub const LOCK_KEY_PREFIX: &str = "docstore:lock:";

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis lock manager.
pub struct RedisLock {
    pool: Pool,
    lease: Duration,
    policy: RetryPolicy,
}

impl RedisLock {
    /// Create a lock manager connected to `url`.
    ///
    /// Connections are opened lazily; use [`DistributedLock::is_healthy`] to
    /// verify reachability.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Config`] if the URL is malformed.
    pub fn new(url: &str, lease: Duration, policy: RetryPolicy) -> StorageResult<Self> {
        let pool = PoolConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StorageError::Config(format!("redis pool: {e}")))?;
        Ok(Self::with_pool(pool, lease, policy))
    }

    /// Create a lock manager over an existing pool.
    #[must_use]
    pub fn with_pool(pool: Pool, lease: Duration, policy: RetryPolicy) -> Self {
        Self {
            pool,
            lease,
            policy,
        }
    }

    /// Redis key of the lock for `resource`.
    #[must_use]
    pub fn lock_key(resource: &str) -> String {
        format!("{LOCK_KEY_PREFIX}{resource}")
    }

    fn lease_millis(&self) -> u64 {
        u64::try_from(self.lease.as_millis()).unwrap_or(u64::MAX).max(1)
    }

    async fn connection(&self) -> StorageResult<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| StorageError::Unavailable(format!("redis: {e}")))
    }
}

async fn release_redis_lock(pool: &Pool, key: &str, token: &str) {
    let mut conn = match pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(key, error = %e, "Redis unavailable on release; lock will lapse with its lease");
            return;
        }
    };

    let reply = cmd("EVAL")
        .arg(RELEASE_SCRIPT)
        .arg(1)
        .arg(key)
        .arg(token)
        .query_async::<i64>(&mut conn)
        .await;
    match reply {
        Ok(1) => debug!(key, "Released redis lock"),
        Ok(_) => warn!(key, "Redis lock expired or was taken over before release"),
        Err(e) => warn!(key, error = %e, "Failed to release redis lock"),
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    #[instrument(skip(self), level = "debug")]
    async fn try_acquire(&self, resource: &str) -> StorageResult<Option<LockGuard>> {
        let key = Self::lock_key(resource);
        let token = Uuid::new_v4().to_string();
        let mut conn = self.connection().await?;

        let reply: Option<String> = cmd("SET")
            .arg(&key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(self.lease_millis())
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::backend(&key, e))?;

        if reply.is_none() {
            return Ok(None);
        }

        let pool = self.pool.clone();
        let owner_id = token.clone();
        Ok(Some(LockGuard::new(
            resource,
            owner_id,
            Some(self.lease),
            move || async move {
                release_redis_lock(&pool, &key, &token).await;
            },
        )))
    }

    async fn is_locked(&self, resource: &str) -> StorageResult<bool> {
        let key = Self::lock_key(resource);
        let mut conn = self.connection().await?;
        cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::backend(&key, e))
    }

    async fn is_healthy(&self) -> bool {
        let Ok(mut conn) = self.pool.get().await else {
            return false;
        };
        cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok_and(|pong| pong == "PONG")
    }

    fn strategy_name(&self) -> &'static str {
        "redis"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

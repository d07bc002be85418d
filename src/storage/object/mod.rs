//! Object-store storage backend.
//!
//! Documents are objects named `{prefix}{path}` in one bucket. The provider is
//! pluggable through [`ObjectClient`]: GCS (JSON API), S3 (AWS SDK) or an
//! in-memory bucket.
//!
//! Object stores cannot append, so [`Storage::append`] is a read-modify-write
//! of the whole object and is only as safe as the caller's own locking.

mod client;
#[cfg(feature = "gcs")]
mod gcs;
mod lock;
mod memory;
#[cfg(feature = "s3")]
mod s3;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{StorageError, StorageResult};
use crate::storage::key::{is_hidden, validate_path, validate_prefix};
use crate::storage::traits::{DistributedLock, LockGuard, Storage};

pub use client::{CreateOutcome, ObjectClient, StoredObject};
#[cfg(feature = "gcs")]
pub use gcs::GcsObjectClient;
pub use lock::{LockObjectRecord, ObjectLock, ObjectLockMode};
pub use memory::MemoryObjectClient;
#[cfg(feature = "s3")]
pub use s3::S3ObjectClient;

/// Object-store storage implementation.
pub struct ObjectStorage {
    client: Arc<dyn ObjectClient>,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
    lock_manager: Arc<dyn DistributedLock>,
}

impl ObjectStorage {
    /// Create a new object storage over `client`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidPath`] if the prefix is absolute or
    /// contains `..`.
    pub fn new(
        client: Arc<dyn ObjectClient>,
        prefix: &str,
        lock_manager: Arc<dyn DistributedLock>,
    ) -> StorageResult<Self> {
        Ok(Self {
            client,
            prefix: normalize_prefix(prefix)?,
            lock_manager,
        })
    }

    /// Object key prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn object_key(&self, path: &str) -> StorageResult<String> {
        Ok(format!("{}{}", self.prefix, validate_path(path)?))
    }
}

/// Normalize a bucket prefix to be empty or end with `/`.
///
/// # Errors
///
/// Returns [`StorageError::InvalidPath`] if the prefix is absolute or contains `..`.
pub fn normalize_prefix(prefix: &str) -> StorageResult<String> {
    let prefix = validate_prefix(prefix)?;
    if prefix.is_empty() || prefix.ends_with('/') {
        Ok(prefix.to_string())
    } else {
        Ok(format!("{prefix}/"))
    }
}

#[async_trait]
impl Storage for ObjectStorage {
    async fn read(&self, path: &str) -> StorageResult<Option<String>> {
        let Some(bytes) = self.read_bytes(path).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StorageError::backend(path, e))
    }

    async fn write(&self, path: &str, data: &str) -> StorageResult<()> {
        self.write_bytes(path, data.as_bytes()).await
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn append(&self, path: &str, data: &str) -> StorageResult<()> {
        let key = self.object_key(path)?;
        let Some(mut current) = self.client.get(&key).await? else {
            return Err(StorageError::NotFound(path.to_string()));
        };
        current.data.extend_from_slice(data.as_bytes());
        self.client.put(&key, current.data).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_bytes(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let key = self.object_key(path)?;
        Ok(self.client.get(&key).await?.map(|object| object.data))
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_bytes(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let key = self.object_key(path)?;
        self.client.put(&key, data.to_vec()).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let key = self.object_key(path)?;
        self.client.exists(&key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> StorageResult<bool> {
        let key = self.object_key(path)?;
        self.client.delete(&key).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_keys(&self, prefix: &str) -> StorageResult<HashSet<String>> {
        let prefix = validate_prefix(prefix)?;
        let names = self.client.list(&format!("{}{prefix}", self.prefix)).await?;

        let keys: HashSet<String> = names
            .into_iter()
            .filter_map(|name| name.strip_prefix(&self.prefix).map(str::to_string))
            .filter(|key| !key.is_empty() && !is_hidden(key))
            .collect();

        debug!(prefix, count = keys.len(), "Listed keys");
        Ok(keys)
    }

    async fn lock(&self, resource: &str, timeout: Duration) -> StorageResult<LockGuard> {
        self.lock_manager.acquire(resource, timeout).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.client.probe().await?;
        if !self.lock_manager.is_healthy().await {
            return Err(StorageError::Unavailable(format!(
                "{} lock backend is unhealthy",
                self.lock_manager.strategy_name()
            )));
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        self.client.provider()
    }

    fn lock_strategy(&self) -> &'static str {
        self.lock_manager.strategy_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::traits::RetryPolicy;

    fn create_test_storage() -> (ObjectStorage, Arc<MemoryObjectClient>) {
        let client = Arc::new(MemoryObjectClient::new());
        let lock = ObjectLock::for_client(
            Arc::clone(&client) as Arc<dyn ObjectClient>,
            "tenant/",
            Duration::from_secs(30),
            RetryPolicy::new(Duration::from_millis(10), 3),
            Duration::ZERO,
        )
        .unwrap();
        let storage = ObjectStorage::new(
            Arc::clone(&client) as Arc<dyn ObjectClient>,
            "tenant",
            Arc::new(lock),
        )
        .unwrap();
        (storage, client)
    }

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix("").unwrap(), "");
        assert_eq!(normalize_prefix("prod").unwrap(), "prod/");
        assert_eq!(normalize_prefix("prod/").unwrap(), "prod/");
        assert!(normalize_prefix("../prod").is_err());
    }

    #[tokio::test]
    async fn test_objects_live_under_prefix() {
        let (storage, client) = create_test_storage();
        storage.write("users/u1/profile", "x").await.unwrap();

        assert!(client.exists("tenant/users/u1/profile").await.unwrap());
        assert_eq!(storage.read("users/u1/profile").await.unwrap().as_deref(), Some("x"));
        assert_eq!(storage.backend_name(), "memory");
        assert_eq!(storage.lock_strategy(), "object");
    }

    #[tokio::test]
    async fn test_append_is_read_modify_write() {
        let (storage, _client) = create_test_storage();

        assert!(matches!(
            storage.append("log", "a").await.unwrap_err(),
            StorageError::NotFound(_)
        ));
        storage.write("log", "a").await.unwrap();
        storage.append("log", "b").await.unwrap();
        assert_eq!(storage.read("log").await.unwrap().as_deref(), Some("ab"));
    }

    #[tokio::test]
    async fn test_list_keys_hides_lock_objects() {
        let (storage, _client) = create_test_storage();
        storage.write("users/u1/profile", "x").await.unwrap();
        storage.write("users/u2/profile", "x").await.unwrap();
        let _guard = storage.lock("users/u1", Duration::from_secs(1)).await.unwrap();

        let all = storage.list_keys("").await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains("users/u1/profile"));

        let one = storage.list_keys("users/u2").await.unwrap();
        assert_eq!(one.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let (storage, _client) = create_test_storage();
        storage.write_bytes("b", &[1, 2, 3]).await.unwrap();
        assert_eq!(storage.read_bytes("b").await.unwrap(), Some(vec![1, 2, 3]));
        assert!(storage.delete("b").await.unwrap());
        assert!(!storage.delete("b").await.unwrap());
        assert!(!storage.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (storage, _client) = create_test_storage();
        assert!(matches!(
            storage.write("../x", "y").await.unwrap_err(),
            StorageError::InvalidPath(_)
        ));
    }
}

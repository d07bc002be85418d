//! File-based storage backend.
//!
//! Documents are plain files under one storage root; the key is the path
//! relative to that root. Suitable for development and single-host deployments.
//!
//! Directory structure:
//! ```text
//! data/
//! ├── users/
//! │   └── {user_id}/
//! │       ├── profile
//! │       ├── auth_methods/{method_id}
//! │       └── sessions/{session_id}
//! ├── data/
//! │   └── {namespace}/{key}
//! └── .locks/
//!     └── {encoded resource}.lock
//! ```

mod lock;

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

use crate::config::{FileStorageConfig, LockConfig};
use crate::error::{StorageError, StorageResult};
use crate::storage::key::{LOCKS_NAMESPACE, is_hidden, validate_path, validate_prefix};
use crate::storage::traits::{DistributedLock, LockGuard, RetryPolicy, Storage};

pub use lock::{FileLock, LockFileRecord};

/// File-based storage implementation.
pub struct FileStorage {
    /// Storage root.
    base_dir: PathBuf,
    /// Lock manager.
    lock_manager: Arc<dyn DistributedLock>,
}

impl FileStorage {
    /// Create a new file storage instance with file-based locking.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be created.
    pub fn new(config: &FileStorageConfig, lock_config: &LockConfig) -> StorageResult<Self> {
        let lock_manager = Arc::new(FileLock::new(
            config.base_dir.join(LOCKS_NAMESPACE),
            lock_config.lease(),
            RetryPolicy::new(lock_config.retry_delay(), lock_config.retry_attempts),
        ));
        Self::with_lock_manager(config, lock_manager)
    }

    /// Create a new file storage instance with an explicit lock strategy.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage root cannot be created.
    pub fn with_lock_manager(
        config: &FileStorageConfig,
        lock_manager: Arc<dyn DistributedLock>,
    ) -> StorageResult<Self> {
        let base_dir = config.base_dir.clone();

        std::fs::create_dir_all(base_dir.join(LOCKS_NAMESPACE))
            .map_err(|e| StorageError::backend(base_dir.display().to_string(), e))?;

        Ok(Self {
            base_dir,
            lock_manager,
        })
    }

    /// Storage root.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolve a key to a path under the storage root.
    fn resolve(&self, path: &str) -> StorageResult<PathBuf> {
        let path = validate_path(path)?;
        Ok(path.split('/').fold(self.base_dir.clone(), |acc, segment| acc.join(segment)))
    }

    /// Write via a hidden temp file and rename, so readers never see a partial document.
    async fn write_atomic(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::backend(path, e))?;

        let file_name = target
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StorageError::InvalidPath(path.to_string()))?;
        let temp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&temp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&temp).await;
            return Err(StorageError::backend(path, e));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    #[instrument(skip(self), level = "debug")]
    async fn read(&self, path: &str) -> StorageResult<Option<String>> {
        let Some(bytes) = self.read_bytes(path).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| StorageError::backend(path, e))
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write(&self, path: &str, data: &str) -> StorageResult<()> {
        self.write_atomic(path, data.as_bytes()).await
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn append(&self, path: &str, data: &str) -> StorageResult<()> {
        let target = self.resolve(path)?;
        let mut file = match fs::OpenOptions::new().append(true).open(&target).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(path.to_string()));
            }
            Err(e) => return Err(StorageError::backend(path, e)),
        };
        file.write_all(data.as_bytes())
            .await
            .map_err(|e| StorageError::backend(path, e))?;
        file.flush().await.map_err(|e| StorageError::backend(path, e))
    }

    #[instrument(skip(self), level = "debug")]
    async fn read_bytes(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        let target = self.resolve(path)?;
        match fs::read(&target).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::backend(path, e)),
        }
    }

    #[instrument(skip(self, data), level = "debug", fields(data_len = data.len()))]
    async fn write_bytes(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        self.write_atomic(path, data).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        match fs::metadata(&target).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::backend(path, e)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str) -> StorageResult<bool> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::backend(path, e)),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn list_keys(&self, prefix: &str) -> StorageResult<HashSet<String>> {
        let prefix = validate_prefix(prefix)?;

        // Walk only the deepest directory the prefix pins down.
        let start_rel = prefix.rfind('/').map_or("", |idx| &prefix[..idx]);
        let start = start_rel
            .split('/')
            .filter(|segment| !segment.is_empty())
            .fold(self.base_dir.clone(), |acc, segment| acc.join(segment));

        let mut keys = HashSet::new();
        let mut pending = vec![(start, start_rel.to_string())];

        while let Some((dir, rel)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                    continue;
                }
                Err(e) => return Err(StorageError::backend(prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::backend(prefix, e))?
            {
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                if name.starts_with('.') {
                    continue;
                }
                let key = if rel.is_empty() {
                    name
                } else {
                    format!("{rel}/{name}")
                };
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StorageError::backend(&key, e))?;

                if file_type.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) && !is_hidden(&key) {
                    keys.insert(key);
                }
            }
        }

        debug!(prefix, count = keys.len(), "Listed keys");
        Ok(keys)
    }

    async fn lock(&self, resource: &str, timeout: Duration) -> StorageResult<LockGuard> {
        self.lock_manager.acquire(resource, timeout).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        if !self.base_dir.exists() {
            return Err(StorageError::Unavailable(format!(
                "storage root {} is missing",
                self.base_dir.display()
            )));
        }

        let test_file = self.base_dir.join(".health_check");
        fs::write(&test_file, b"ok")
            .await
            .map_err(|e| StorageError::backend(".health_check", e))?;
        fs::remove_file(&test_file)
            .await
            .map_err(|e| StorageError::backend(".health_check", e))?;

        if !self.lock_manager.is_healthy().await {
            return Err(StorageError::Unavailable(format!(
                "{} lock backend is unhealthy",
                self.lock_manager.strategy_name()
            )));
        }

        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }

    fn lock_strategy(&self) -> &'static str {
        self.lock_manager.strategy_name()
    }
}

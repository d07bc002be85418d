//! Storage decorator that reports every call to a [`StorageMonitor`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::storage::monitor::StorageMonitor;
use crate::storage::traits::{LockGuard, Storage};

/// Wraps a backend so all primitives and lock acquisitions are observed.
pub struct MonitoredStorage {
    inner: Arc<dyn Storage>,
    monitor: Arc<StorageMonitor>,
}

impl MonitoredStorage {
    /// Wrap `inner`, reporting to `monitor`.
    #[must_use]
    pub fn new(inner: Arc<dyn Storage>, monitor: Arc<StorageMonitor>) -> Self {
        Self { inner, monitor }
    }

    /// The shared monitor.
    #[must_use]
    pub fn monitor(&self) -> &Arc<StorageMonitor> {
        &self.monitor
    }
}

#[async_trait]
impl Storage for MonitoredStorage {
    async fn read(&self, path: &str) -> StorageResult<Option<String>> {
        self.monitor
            .monitor_storage_operation("read", self.inner.read(path))
            .await
    }

    async fn write(&self, path: &str, data: &str) -> StorageResult<()> {
        self.monitor
            .monitor_storage_operation("write", self.inner.write(path, data))
            .await
    }

    async fn append(&self, path: &str, data: &str) -> StorageResult<()> {
        self.monitor
            .monitor_storage_operation("append", self.inner.append(path, data))
            .await
    }

    async fn read_bytes(&self, path: &str) -> StorageResult<Option<Vec<u8>>> {
        self.monitor
            .monitor_storage_operation("read_bytes", self.inner.read_bytes(path))
            .await
    }

    async fn write_bytes(&self, path: &str, data: &[u8]) -> StorageResult<()> {
        self.monitor
            .monitor_storage_operation("write_bytes", self.inner.write_bytes(path, data))
            .await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.monitor
            .monitor_storage_operation("exists", self.inner.exists(path))
            .await
    }

    async fn delete(&self, path: &str) -> StorageResult<bool> {
        self.monitor
            .monitor_storage_operation("delete", self.inner.delete(path))
            .await
    }

    async fn list_keys(&self, prefix: &str) -> StorageResult<HashSet<String>> {
        self.monitor
            .monitor_storage_operation("list_keys", self.inner.list_keys(prefix))
            .await
    }

    async fn lock(&self, resource: &str, timeout: Duration) -> StorageResult<LockGuard> {
        self.monitor
            .monitor_lock_acquisition(
                resource,
                self.inner.lock_strategy(),
                self.inner.lock(resource, timeout),
            )
            .await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.monitor
            .monitor_storage_operation("health_check", self.inner.health_check())
            .await
    }

    fn backend_name(&self) -> &'static str {
        self.inner.backend_name()
    }

    fn lock_strategy(&self) -> &'static str {
        self.inner.lock_strategy()
    }
}

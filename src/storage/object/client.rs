//! Object-store client abstraction.
//!
//! A thin key/value surface over a bucket. Keys passed here are full object
//! names (bucket prefix already applied).

use async_trait::async_trait;

use crate::error::{StorageError, StorageResult};

/// An object body together with its version marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object body.
    pub data: Vec<u8>,
    /// Server-side version (GCS generation); `None` when the store has no
    /// usable version for conditional deletes.
    pub generation: Option<String>,
}

/// Result of a conditional create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The object did not exist and was created.
    Created {
        /// Version of the new object.
        generation: Option<String>,
    },
    /// An object already exists at the key.
    Exists,
}

/// Minimal object-store operations.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Provider name for logs.
    fn provider(&self) -> &'static str;

    /// Whether [`ObjectClient::create_if_absent`] is atomic on this store.
    fn supports_conditional_create(&self) -> bool {
        false
    }

    /// Fetch an object. Missing objects return `None`.
    async fn get(&self, key: &str) -> StorageResult<Option<StoredObject>>;

    /// Create or replace an object.
    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()>;

    /// Create an object only if nothing exists at `key`.
    async fn create_if_absent(&self, key: &str, _data: Vec<u8>) -> StorageResult<CreateOutcome> {
        Err(StorageError::Config(format!(
            "{} does not support conditional create (key '{key}')",
            self.provider()
        )))
    }

    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Delete an object. Returns `true` iff something was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Delete an object only if it is still at `generation`.
    ///
    /// Returns `false` if the object is gone or has been replaced.
    async fn delete_if_generation(&self, key: &str, _generation: &str) -> StorageResult<bool> {
        Err(StorageError::Config(format!(
            "{} does not support conditional delete (key '{key}')",
            self.provider()
        )))
    }

    /// List object names starting with `prefix`.
    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;

    /// Check that the bucket is reachable.
    async fn probe(&self) -> StorageResult<()>;
}

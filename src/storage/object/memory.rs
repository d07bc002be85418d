//! In-process object store.
//!
//! Behaves like a bucket with generation numbers. Used for tests and local
//! experiments with the object backend; nothing is persisted.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{CreateOutcome, ObjectClient, StoredObject};
use crate::error::{StorageError, StorageResult};

#[derive(Debug, Default)]
struct Bucket {
    objects: BTreeMap<String, (Vec<u8>, u64)>,
    next_generation: u64,
}

impl Bucket {
    fn insert(&mut self, key: &str, data: Vec<u8>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.objects.insert(key.to_string(), (data, generation));
        generation
    }
}

/// In-memory object client.
#[derive(Debug)]
pub struct MemoryObjectClient {
    bucket: Mutex<Bucket>,
    conditional: bool,
}

impl MemoryObjectClient {
    /// Bucket with atomic conditional create (GCS-like).
    #[must_use]
    pub fn new() -> Self {
        Self {
            bucket: Mutex::new(Bucket::default()),
            conditional: true,
        }
    }

    /// Bucket without conditional create (S3-like).
    #[must_use]
    pub fn without_conditional_create() -> Self {
        Self {
            bucket: Mutex::new(Bucket::default()),
            conditional: false,
        }
    }

    /// Number of stored objects, reserved ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bucket.lock().objects.len()
    }

    /// Whether the bucket is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectClient for MemoryObjectClient {
    fn provider(&self) -> &'static str {
        "memory"
    }

    fn supports_conditional_create(&self) -> bool {
        self.conditional
    }

    async fn get(&self, key: &str) -> StorageResult<Option<StoredObject>> {
        let bucket = self.bucket.lock();
        Ok(bucket.objects.get(key).map(|(data, generation)| StoredObject {
            data: data.clone(),
            generation: self.conditional.then(|| generation.to_string()),
        }))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        self.bucket.lock().insert(key, data);
        Ok(())
    }

    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> StorageResult<CreateOutcome> {
        if !self.conditional {
            return Err(StorageError::Config(format!(
                "memory bucket without conditional create (key '{key}')"
            )));
        }
        let mut bucket = self.bucket.lock();
        if bucket.objects.contains_key(key) {
            return Ok(CreateOutcome::Exists);
        }
        let generation = bucket.insert(key, data);
        Ok(CreateOutcome::Created {
            generation: Some(generation.to_string()),
        })
    }

    async fn exists(&self, key: &str) -> StorageResult<bool> {
        Ok(self.bucket.lock().objects.contains_key(key))
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        Ok(self.bucket.lock().objects.remove(key).is_some())
    }

    async fn delete_if_generation(&self, key: &str, generation: &str) -> StorageResult<bool> {
        let mut bucket = self.bucket.lock();
        let matches = bucket
            .objects
            .get(key)
            .is_some_and(|(_, current)| current.to_string() == generation);
        if matches {
            bucket.objects.remove(key);
        }
        Ok(matches)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let bucket = self.bucket.lock();
        Ok(bucket
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn probe(&self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conditional_create() {
        let client = MemoryObjectClient::new();

        let first = client.create_if_absent("k", b"a".to_vec()).await.unwrap();
        assert!(matches!(first, CreateOutcome::Created { generation: Some(_) }));
        let second = client.create_if_absent("k", b"b".to_vec()).await.unwrap();
        assert_eq!(second, CreateOutcome::Exists);
        assert_eq!(client.get("k").await.unwrap().unwrap().data, b"a");
    }

    #[tokio::test]
    async fn test_generation_conditional_delete() {
        let client = MemoryObjectClient::new();
        client.put("k", b"a".to_vec()).await.unwrap();
        let stale = client.get("k").await.unwrap().unwrap().generation.unwrap();

        client.put("k", b"b".to_vec()).await.unwrap();
        assert!(!client.delete_if_generation("k", &stale).await.unwrap());

        let current = client.get("k").await.unwrap().unwrap().generation.unwrap();
        assert!(client.delete_if_generation("k", &current).await.unwrap());
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let client = MemoryObjectClient::new();
        for key in ["p/a", "p/b/c", "q/a"] {
            client.put(key, Vec::new()).await.unwrap();
        }
        assert_eq!(client.list("p/").await.unwrap(), vec!["p/a", "p/b/c"]);
        assert_eq!(client.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_plain_bucket_refuses_conditional_create() {
        let client = MemoryObjectClient::without_conditional_create();
        assert!(!client.supports_conditional_create());
        assert!(client.create_if_absent("k", Vec::new()).await.is_err());
        client.put("k", Vec::new()).await.unwrap();
        assert_eq!(client.get("k").await.unwrap().unwrap().generation, None);
    }
}

//! Integration tests for object-store locking.
//!
//! Each `ObjectStorage` built over one shared in-memory bucket stands in for a
//! separate process talking to the same bucket.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use docstore::error::StorageError;
use docstore::storage::object::{
    LockObjectRecord, MemoryObjectClient, ObjectClient, ObjectLock, ObjectLockMode, ObjectStorage,
};
use docstore::storage::{DistributedLock, RetryPolicy, Storage};

// ============================================================================
// Test Harness
// ============================================================================

const PREFIX: &str = "env/";

fn policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(5), 3)
}

fn open(bucket: &Arc<MemoryObjectClient>, lease: Duration) -> (Arc<ObjectStorage>, Arc<ObjectLock>) {
    let client: Arc<dyn ObjectClient> = Arc::clone(bucket) as Arc<dyn ObjectClient>;
    let lock = Arc::new(ObjectLock::for_client(Arc::clone(&client), PREFIX, lease, policy(), Duration::ZERO).unwrap());
    let storage = ObjectStorage::new(client, PREFIX, Arc::clone(&lock) as Arc<dyn DistributedLock>).unwrap();
    (Arc::new(storage), lock)
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_expired_lock_object_is_deleted_and_reacquired() {
    let bucket = Arc::new(MemoryObjectClient::new());
    let (storage, lock) = open(&bucket, Duration::from_secs(30));
    let key = lock.lock_key("users/u1");

    let abandoned = LockObjectRecord {
        owner: Uuid::new_v4(),
        resource: "users/u1".to_string(),
        acquired_at: Utc::now() - chrono::Duration::seconds(60),
        expires_at: (Utc::now() - chrono::Duration::seconds(30)).timestamp() as f64,
    };
    bucket
        .put(&key, serde_json::to_vec(&abandoned).unwrap())
        .await
        .unwrap();
    assert!(!lock.is_locked("users/u1").await.unwrap());

    let guard = storage
        .lock("users/u1", Duration::from_millis(500))
        .await
        .unwrap();

    let stored: LockObjectRecord =
        serde_json::from_slice(&bucket.get(&key).await.unwrap().unwrap().data).unwrap();
    assert_ne!(stored.owner, abandoned.owner);
    assert_eq!(guard.owner_id(), stored.owner.to_string());

    guard.release().await;
    assert!(!bucket.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_live_lock_object_blocks_until_timeout() {
    let bucket = Arc::new(MemoryObjectClient::new());
    let (first, _) = open(&bucket, Duration::from_secs(30));
    let (second, _) = open(&bucket, Duration::from_secs(30));

    let _held = first.lock("r", Duration::from_secs(1)).await.unwrap();
    let err = second.lock("r", Duration::from_millis(60)).await.unwrap_err();
    assert!(matches!(err, StorageError::LockTimeout { ref resource, .. } if resource == "r"));
}

#[tokio::test]
async fn test_conditional_locks_admit_one_holder() {
    let bucket = Arc::new(MemoryObjectClient::new());
    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let (storage, lock) = open(&bucket, Duration::from_secs(30));
        assert_eq!(lock.mode(), ObjectLockMode::Conditional);
        let inside = Arc::clone(&inside);
        let peak = Arc::clone(&peak);
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let guard = storage.lock("counter", Duration::from_secs(10)).await.unwrap();
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                inside.fetch_sub(1, Ordering::SeqCst);
                guard.release().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_lock_objects_never_listed() {
    let bucket = Arc::new(MemoryObjectClient::new());
    let (storage, _) = open(&bucket, Duration::from_secs(30));

    storage.write("users/u1/profile", "{}").await.unwrap();
    let _guard = storage.lock("users/u1/profile", Duration::from_secs(1)).await.unwrap();

    assert_eq!(bucket.len(), 2);
    let keys = storage.list_keys("").await.unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys.contains("users/u1/profile"));
}

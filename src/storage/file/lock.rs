//! File-based distributed locking.
//!
//! A lock is a file created with `O_CREAT | O_EXCL` semantics at
//! `{base_dir}/.locks/{encoded resource}.lock`, containing
//! `{"pid": .., "timestamp": .., "resource": ..}`.
//!
//! A conflicting lock file is stale when it is older than the lease or when
//! its PID no longer exists on this host. The PID probe is only meaningful
//! when every contender shares one process namespace; across hosts only the
//! age check applies.
//!
//! Every removal of a lock file (stale reclaim or release) holds an exclusive
//! `flock` on `.locks/.removal.flock` across its re-read, compare and unlink.
//! A path only becomes free through a removal, so a removal can never unlink
//! a lock file created after the one it inspected.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::error::{StorageError, StorageResult};
use crate::storage::key::lock_name;
use crate::storage::traits::{DistributedLock, LockGuard, RetryPolicy};

/// Reclaim attempts per `try_acquire` before reporting the lock as busy.
const MAX_RECLAIMS: usize = 3;

/// Gate serializing lock-file removals. Never matches a `{name}.lock` file.
const REMOVAL_GATE: &str = ".removal.flock";

/// On-disk lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFileRecord {
    /// Owning process.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Acquisition time, seconds since the Unix epoch.
    pub timestamp: f64,
    /// Locked resource.
    pub resource: String,
}

impl LockFileRecord {
    fn for_current_process(resource: &str) -> Self {
        Self {
            pid: Some(std::process::id()),
            timestamp: epoch_seconds(SystemTime::now()),
            resource: resource.to_string(),
        }
    }
}

/// Why a lock file was judged stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Staleness {
    Expired,
    DeadOwner,
    Unreadable,
}

/// Observed state of an existing lock file.
enum Holder {
    Live,
    /// Stale, with the exact bytes that were judged and the holder's PID.
    Stale(Staleness, Vec<u8>, Option<u32>),
    Gone,
}

/// Result of a gated removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Removed,
    /// The file no longer holds the expected bytes; left in place.
    Replaced,
    Missing,
}

/// File-based lock manager.
#[derive(Debug, Clone)]
pub struct FileLock {
    /// Directory for lock files.
    locks_dir: PathBuf,
    lease: Duration,
    policy: RetryPolicy,
}

impl FileLock {
    /// Create a new file lock manager.
    pub fn new(locks_dir: impl Into<PathBuf>, lease: Duration, policy: RetryPolicy) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            lease,
            policy,
        }
    }

    /// Get the lock file path for a resource.
    fn lock_path(&self, resource: &str) -> PathBuf {
        self.locks_dir.join(format!("{}.lock", lock_name(resource)))
    }

    /// Create the lock file exclusively. Returns `false` if it already exists.
    async fn create_lock_file(&self, path: &Path, content: &[u8]) -> StorageResult<bool> {
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StorageError::backend(path.display().to_string(), e)),
        };

        let written = async {
            file.write_all(content).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            // Never leave a half-written lock behind.
            let partial = content.to_vec();
            let _ = remove_if(self.locks_dir.clone(), path.to_path_buf(), move |current| {
                partial.starts_with(current)
            })
            .await;
            return Err(StorageError::backend(path.display().to_string(), e));
        }
        Ok(true)
    }

    /// Inspect an existing lock file.
    async fn inspect(&self, path: &Path) -> StorageResult<Holder> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Holder::Gone),
            Err(e) => return Err(StorageError::backend(path.display().to_string(), e)),
        };

        let Ok(record) = serde_json::from_slice::<LockFileRecord>(&content) else {
            // A holder may be between create and write; only its age can tell.
            return match fs::metadata(path).await {
                Ok(meta) => {
                    let age = meta
                        .modified()
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                        .unwrap_or_default();
                    if age > self.lease {
                        Ok(Holder::Stale(Staleness::Unreadable, content, None))
                    } else {
                        Ok(Holder::Live)
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(Holder::Gone),
                Err(e) => Err(StorageError::backend(path.display().to_string(), e)),
            };
        };

        Ok(match self.staleness(&record) {
            Some(reason) => Holder::Stale(reason, content, record.pid),
            None => Holder::Live,
        })
    }

    /// Decide staleness: age first, then PID liveness.
    fn staleness(&self, record: &LockFileRecord) -> Option<Staleness> {
        let age = epoch_seconds(SystemTime::now()) - record.timestamp;
        if age > self.lease.as_secs_f64() {
            return Some(Staleness::Expired);
        }
        match record.pid {
            Some(pid) if !process_exists(pid) => Some(Staleness::DeadOwner),
            _ => None,
        }
    }

    /// Remove a stale lock file if it still holds the bytes we judged stale.
    async fn reclaim(&self, path: &Path, judged: Vec<u8>) -> StorageResult<Removal> {
        remove_if_unchanged(self.locks_dir.clone(), path.to_path_buf(), judged)
            .await
            .map_err(|e| StorageError::backend(path.display().to_string(), e))
    }

    fn guard(&self, path: PathBuf, record: &LockFileRecord, content: Vec<u8>) -> LockGuard {
        let owner_id = format!(
            "pid:{}@{}",
            record.pid.unwrap_or_default(),
            record.timestamp
        );
        let resource = record.resource.clone();
        let release_resource = resource.clone();
        let locks_dir = self.locks_dir.clone();
        LockGuard::new(resource, owner_id, Some(self.lease), move || async move {
            release_lock_file(locks_dir, path, content, &release_resource).await;
        })
    }
}

/// Remove `path` only while it still holds `expected`, under the removal gate.
async fn remove_if_unchanged(
    locks_dir: PathBuf,
    path: PathBuf,
    expected: Vec<u8>,
) -> std::io::Result<Removal> {
    remove_if(locks_dir, path, move |current| current == expected.as_slice()).await
}

/// Remove `path` under the removal gate if its current bytes satisfy `owned`.
async fn remove_if<F>(locks_dir: PathBuf, path: PathBuf, owned: F) -> std::io::Result<Removal>
where
    F: FnOnce(&[u8]) -> bool + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let gate = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(locks_dir.join(REMOVAL_GATE))?;
        FileExt::lock_exclusive(&gate)?;

        let removal = match std::fs::read(&path) {
            Ok(current) if owned(&current) => match std::fs::remove_file(&path) {
                Ok(()) => Ok(Removal::Removed),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(Removal::Missing),
                Err(e) => Err(e),
            },
            Ok(_) => Ok(Removal::Replaced),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Removal::Missing),
            Err(e) => Err(e),
        };

        // Closing the handle drops the flock as well.
        let _ = FileExt::unlock(&gate);
        removal
    })
    .await
    .map_err(std::io::Error::other)?
}

/// Delete the lock file unless it has since been reclaimed by someone else.
async fn release_lock_file(locks_dir: PathBuf, path: PathBuf, ours: Vec<u8>, resource: &str) {
    match remove_if_unchanged(locks_dir, path, ours).await {
        Ok(Removal::Removed) => debug!(resource, "Released file lock"),
        Ok(Removal::Replaced) => {
            warn!(resource, "Lock file was reclaimed by another holder before release");
        }
        Ok(Removal::Missing) => {}
        Err(e) => warn!(resource, error = %e, "Failed to remove lock file"),
    }
}

#[async_trait]
impl DistributedLock for FileLock {
    #[instrument(skip(self), level = "debug")]
    async fn try_acquire(&self, resource: &str) -> StorageResult<Option<LockGuard>> {
        fs::create_dir_all(&self.locks_dir)
            .await
            .map_err(|e| StorageError::backend(self.locks_dir.display().to_string(), e))?;

        let path = self.lock_path(resource);

        for _ in 0..MAX_RECLAIMS {
            let record = LockFileRecord::for_current_process(resource);
            let content =
                serde_json::to_vec(&record).map_err(|e| StorageError::backend(resource, e))?;
            if self.create_lock_file(&path, &content).await? {
                return Ok(Some(self.guard(path, &record, content)));
            }

            match self.inspect(&path).await? {
                Holder::Live => return Ok(None),
                Holder::Gone => {}
                Holder::Stale(reason, judged, holder_pid) => {
                    if self.reclaim(&path, judged).await? == Removal::Removed {
                        warn!(resource, ?reason, ?holder_pid, "Reclaimed stale file lock");
                    }
                }
            }
        }

        Ok(None)
    }

    async fn is_locked(&self, resource: &str) -> StorageResult<bool> {
        Ok(matches!(
            self.inspect(&self.lock_path(resource)).await?,
            Holder::Live
        ))
    }

    async fn is_healthy(&self) -> bool {
        fs::create_dir_all(&self.locks_dir).await.is_ok()
    }

    fn strategy_name(&self) -> &'static str {
        "file"
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.policy
    }
}

fn epoch_seconds(time: SystemTime) -> f64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Probe whether `pid` exists without signalling it.
///
/// A process that exists but cannot be signalled (`EPERM`) counts as alive.
#[cfg(unix)]
#[allow(unsafe_code)]
fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return true;
    };
    if pid <= 0 {
        return true;
    }
    // SAFETY: signal 0 performs only the existence and permission checks; nothing is delivered.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
const fn process_exists(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_lock_manager(lease: Duration) -> (FileLock, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let lock_manager = FileLock::new(
            temp_dir.path().join(".locks"),
            lease,
            RetryPolicy::new(Duration::from_millis(10), 3),
        );
        (lock_manager, temp_dir)
    }

    async fn plant_lock_file(lock: &FileLock, resource: &str, record: &LockFileRecord) {
        fs::create_dir_all(&lock.locks_dir).await.unwrap();
        fs::write(lock.lock_path(resource), serde_json::to_vec(record).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (lock_manager, _temp) = create_test_lock_manager(Duration::from_secs(30));

        let guard = lock_manager
            .acquire("users/u1", Duration::from_secs(1))
            .await
            .unwrap();

        assert!(lock_manager.is_locked("users/u1").await.unwrap());
        let on_disk: LockFileRecord =
            serde_json::from_slice(&fs::read(lock_manager.lock_path("users/u1")).await.unwrap())
                .unwrap();
        assert_eq!(on_disk.pid, Some(std::process::id()));
        assert_eq!(on_disk.resource, "users/u1");

        guard.release().await;

        assert!(!lock_manager.is_locked("users/u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_try_acquire_fails_when_locked() {
        let (lock_manager, _temp) = create_test_lock_manager(Duration::from_secs(30));

        let _guard = lock_manager.try_acquire("r").await.unwrap().unwrap();

        assert!(lock_manager.try_acquire("r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let (lock_manager, _temp) = create_test_lock_manager(Duration::from_secs(30));

        let _guard = lock_manager.try_acquire("r").await.unwrap().unwrap();

        let err = lock_manager
            .acquire("r", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_expired_lock_is_reclaimed() {
        let (lock_manager, _temp) = create_test_lock_manager(Duration::from_secs(5));
        let record = LockFileRecord {
            pid: Some(std::process::id()),
            timestamp: epoch_seconds(SystemTime::now()) - 60.0,
            resource: "r".to_string(),
        };
        plant_lock_file(&lock_manager, "r", &record).await;

        assert!(!lock_manager.is_locked("r").await.unwrap());
        assert!(lock_manager.try_acquire("r").await.unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dead_owner_is_reclaimed_before_lease() {
        let (lock_manager, _temp) = create_test_lock_manager(Duration::from_secs(3600));

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let record = LockFileRecord {
            pid: Some(dead_pid),
            timestamp: epoch_seconds(SystemTime::now()),
            resource: "r".to_string(),
        };
        plant_lock_file(&lock_manager, "r", &record).await;

        assert!(lock_manager.try_acquire("r").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fresh_unreadable_lock_is_respected() {
        let (lock_manager, _temp) = create_test_lock_manager(Duration::from_secs(30));
        fs::create_dir_all(&lock_manager.locks_dir).await.unwrap();
        fs::write(lock_manager.lock_path("r"), b"").await.unwrap();

        assert!(lock_manager.try_acquire("r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_skips_reclaimed_lock() {
        let (lock_manager, _temp) = create_test_lock_manager(Duration::from_secs(30));
        let guard = lock_manager.try_acquire("r").await.unwrap().unwrap();

        let usurper = LockFileRecord {
            pid: Some(std::process::id()),
            timestamp: epoch_seconds(SystemTime::now()) + 1.0,
            resource: "r".to_string(),
        };
        plant_lock_file(&lock_manager, "r", &usurper).await;

        guard.release().await;
        assert!(fs::try_exists(lock_manager.lock_path("r")).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_contenders_racing_a_stale_lock_admit_one_holder() {
        let temp_dir = TempDir::new().unwrap();
        let locks_dir = temp_dir.path().join(".locks");
        let contenders: Vec<Arc<FileLock>> = (0..16)
            .map(|_| {
                Arc::new(FileLock::new(
                    locks_dir.clone(),
                    Duration::from_secs(30),
                    RetryPolicy::new(Duration::from_millis(1), 3),
                ))
            })
            .collect();
        let stale = LockFileRecord {
            pid: None,
            timestamp: 1.0,
            resource: "shared".to_string(),
        };

        for round in 0..100 {
            plant_lock_file(&contenders[0], "shared", &stale).await;

            let barrier = Arc::new(tokio::sync::Barrier::new(contenders.len()));
            let attempts: Vec<_> = contenders
                .iter()
                .map(|lock| {
                    let lock = Arc::clone(lock);
                    let barrier = Arc::clone(&barrier);
                    tokio::spawn(async move {
                        barrier.wait().await;
                        lock.try_acquire("shared").await.unwrap()
                    })
                })
                .collect();

            let mut holders = Vec::new();
            for attempt in attempts {
                if let Some(guard) = attempt.await.unwrap() {
                    holders.push(guard);
                }
            }
            assert_eq!(holders.len(), 1, "round {round}");
            assert!(contenders[0].is_locked("shared").await.unwrap());

            for guard in holders {
                guard.release().await;
            }
            assert!(!contenders[0].is_locked("shared").await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_release_after_lease_keeps_successor_lock() {
        let temp_dir = TempDir::new().unwrap();
        let locks_dir = temp_dir.path().join(".locks");
        let policy = RetryPolicy::new(Duration::from_millis(5), 3);
        let slow = FileLock::new(locks_dir.clone(), Duration::from_millis(300), policy);
        let successor = FileLock::new(locks_dir, Duration::from_millis(300), policy);

        let lapsed = slow.try_acquire("r").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let current = successor
            .acquire("r", Duration::from_secs(1))
            .await
            .unwrap();
        lapsed.release().await;

        assert!(successor.is_locked("r").await.unwrap());
        current.release().await;
        assert!(!successor.is_locked("r").await.unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_current_process_exists() {
        assert!(process_exists(std::process::id()));
    }
}

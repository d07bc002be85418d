//! Storage backend factory.
//!
//! Validates configuration against the deployment environment, then builds
//! the configured backend with its lock strategy.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{
    BackendConfig, BackendKind, Environment, FileStorageConfig, LockConfig, LockStrategy,
    StorageConfig,
};
use crate::error::{StorageError, StorageResult};
use crate::storage::file::FileStorage;
#[cfg(any(feature = "gcs", feature = "s3"))]
use crate::storage::object::{ObjectClient, ObjectLock, ObjectStorage};
#[cfg(feature = "redis")]
use crate::storage::redis_lock::RedisLock;
use crate::storage::traits::{DistributedLock, RetryPolicy, Storage};

/// Check backend/strategy compatibility and environment policy.
///
/// # Errors
///
/// Returns [`StorageError::Config`] if:
/// - file storage is requested outside `dev`
/// - file locking is paired with an object-store backend, or object locking
///   with file storage
/// - a lease or retry delay is out of range
/// - the redis strategy has no host
/// - the requested backend or strategy was not compiled in
pub fn validate_storage_config(config: &StorageConfig, environment: Environment) -> StorageResult<()> {
    config.lock.check_ranges().map_err(StorageError::Config)?;

    let kind = config.kind();
    let strategy = config.lock_strategy();

    if kind == BackendKind::File && !environment.allows_local_storage() {
        return Err(StorageError::Config(format!(
            "file storage is not allowed in {environment}; configure gcs or s3"
        )));
    }

    match (kind, strategy) {
        (BackendKind::Gcs | BackendKind::S3, LockStrategy::File) => {
            return Err(StorageError::Config(format!(
                "file locking cannot coordinate {kind} storage; use object or redis"
            )));
        }
        (BackendKind::File, LockStrategy::Object) => {
            return Err(StorageError::Config(
                "object locking requires an object-store backend".to_string(),
            ));
        }
        _ => {}
    }

    if strategy == LockStrategy::Redis && config.lock.redis_host.as_deref().is_none_or(str::is_empty) {
        return Err(StorageError::Config(
            "redis lock strategy requires storage.lock.redis_host".to_string(),
        ));
    }

    ensure_compiled(kind, strategy)
}

fn ensure_compiled(kind: BackendKind, strategy: LockStrategy) -> StorageResult<()> {
    let backend_missing = match kind {
        BackendKind::File => false,
        BackendKind::Gcs => !cfg!(feature = "gcs"),
        BackendKind::S3 => !cfg!(feature = "s3"),
    };
    if backend_missing {
        return Err(StorageError::Config(format!(
            "{kind} storage support was not compiled in (enable the `{kind}` feature)"
        )));
    }
    if strategy == LockStrategy::Redis && !cfg!(feature = "redis") {
        return Err(StorageError::Config(
            "redis lock support was not compiled in (enable the `redis` feature)".to_string(),
        ));
    }
    Ok(())
}

fn retry_policy(lock: &LockConfig) -> RetryPolicy {
    RetryPolicy::new(lock.retry_delay(), lock.retry_attempts)
}

#[cfg(feature = "redis")]
fn redis_lock(lock: &LockConfig) -> StorageResult<Arc<dyn DistributedLock>> {
    let url = lock.redis_url().ok_or_else(|| {
        StorageError::Config("redis lock strategy requires storage.lock.redis_host".to_string())
    })?;
    Ok(Arc::new(RedisLock::new(&url, lock.lease(), retry_policy(lock))?))
}

#[cfg(not(feature = "redis"))]
fn redis_lock(_lock: &LockConfig) -> StorageResult<Arc<dyn DistributedLock>> {
    Err(StorageError::Config(
        "redis lock support was not compiled in (enable the `redis` feature)".to_string(),
    ))
}

fn create_file_storage(
    file: &FileStorageConfig,
    lock: &LockConfig,
    strategy: LockStrategy,
) -> StorageResult<FileStorage> {
    match strategy {
        LockStrategy::Redis => FileStorage::with_lock_manager(file, redis_lock(lock)?),
        LockStrategy::File | LockStrategy::Object => FileStorage::new(file, lock),
    }
}

#[cfg(any(feature = "gcs", feature = "s3"))]
fn create_object_storage(
    client: Arc<dyn ObjectClient>,
    prefix: &str,
    lock: &LockConfig,
    strategy: LockStrategy,
    propagation_delay: Duration,
) -> StorageResult<ObjectStorage> {
    let lock_manager: Arc<dyn DistributedLock> = match strategy {
        LockStrategy::Redis => redis_lock(lock)?,
        LockStrategy::Object | LockStrategy::File => Arc::new(ObjectLock::for_client(
            Arc::clone(&client),
            crate::storage::object::normalize_prefix(prefix)?,
            lock.lease(),
            retry_policy(lock),
            propagation_delay,
        )?),
    };
    ObjectStorage::new(client, prefix, lock_manager)
}

/// Create a storage backend based on configuration.
///
/// The backend is health-checked before it is returned.
///
/// # Errors
///
/// Returns [`StorageError::Config`] for invalid or disallowed configuration,
/// or the backend's error if it cannot be initialized or fails its health check.
pub async fn create_storage(
    config: &StorageConfig,
    environment: Environment,
) -> StorageResult<Arc<dyn Storage>> {
    validate_storage_config(config, environment)?;
    let strategy = config.lock_strategy();

    let storage: Arc<dyn Storage> = match &config.backend {
        BackendConfig::File(file) => Arc::new(create_file_storage(file, &config.lock, strategy)?),

        #[cfg(feature = "gcs")]
        BackendConfig::Gcs(gcs) => {
            let client: Arc<dyn ObjectClient> =
                Arc::new(crate::storage::object::GcsObjectClient::new(gcs)?);
            Arc::new(create_object_storage(
                client,
                &gcs.prefix,
                &config.lock,
                strategy,
                Duration::ZERO,
            )?)
        }

        #[cfg(feature = "s3")]
        BackendConfig::S3(s3) => {
            if strategy == LockStrategy::Object && environment != Environment::Dev {
                tracing::warn!(
                    %environment,
                    "S3 object locks are best-effort; prefer the redis lock strategy outside dev"
                );
            }
            let client: Arc<dyn ObjectClient> =
                Arc::new(crate::storage::object::S3ObjectClient::new(s3).await);
            Arc::new(create_object_storage(
                client,
                &s3.prefix,
                &config.lock,
                strategy,
                Duration::from_millis(s3.propagation_delay_ms),
            )?)
        }

        #[allow(unreachable_patterns)]
        _ => {
            return Err(StorageError::Config(format!(
                "{} storage support was not compiled in",
                config.kind()
            )));
        }
    };

    storage.health_check().await?;

    info!(
        backend = storage.backend_name(),
        lock_strategy = storage.lock_strategy(),
        %environment,
        "Storage initialized"
    );
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_config(dir: &TempDir) -> StorageConfig {
        StorageConfig {
            lock: LockConfig::default(),
            backend: BackendConfig::File(FileStorageConfig {
                base_dir: dir.path().to_path_buf(),
            }),
        }
    }

    fn object_config(strategy: Option<LockStrategy>) -> StorageConfig {
        serde_json::from_value(serde_json::json!({
            "type": "gcs",
            "bucket": "docs",
            "project_id": "proj",
            "lock": { "strategy": strategy.map(|s| s.to_string()) }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_file_storage() {
        let temp_dir = TempDir::new().unwrap();
        let storage = create_storage(&file_config(&temp_dir), Environment::Dev)
            .await
            .unwrap();
        assert_eq!(storage.backend_name(), "file");
        assert_eq!(storage.lock_strategy(), "file");
    }

    #[tokio::test]
    async fn test_file_storage_rejected_outside_dev() {
        let temp_dir = TempDir::new().unwrap();
        for environment in [Environment::Beta, Environment::Prod] {
            let result = create_storage(&file_config(&temp_dir), environment).await;
            assert!(matches!(result, Err(StorageError::Config(_))));
        }
    }

    #[tokio::test]
    async fn test_zero_lease_rejected_at_construction() {
        let dir = TempDir::new().unwrap();
        for lease in [0.0, 1e20] {
            let mut config = file_config(&dir);
            config.lock.lease_duration_seconds = lease;
            let err = create_storage(&config, Environment::Dev).await.err().unwrap();
            assert!(matches!(err, StorageError::Config(_)), "lease {lease}");
        }
    }

    #[test]
    fn test_strategy_compatibility() {
        let err = validate_storage_config(&object_config(Some(LockStrategy::File)), Environment::Prod)
            .unwrap_err();
        assert!(matches!(err, StorageError::Config(_)));

        let temp_dir = TempDir::new().unwrap();
        let mut config = file_config(&temp_dir);
        config.lock.strategy = Some(LockStrategy::Object);
        assert!(validate_storage_config(&config, Environment::Dev).is_err());
    }

    #[cfg(feature = "gcs")]
    #[test]
    fn test_object_backend_allowed_in_prod() {
        assert!(validate_storage_config(&object_config(None), Environment::Prod).is_ok());
        assert!(
            validate_storage_config(&object_config(Some(LockStrategy::Object)), Environment::Beta)
                .is_ok()
        );
    }

    #[test]
    fn test_redis_strategy_requires_host() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = file_config(&temp_dir);
        config.lock.strategy = Some(LockStrategy::Redis);

        let err = validate_storage_config(&config, Environment::Dev).unwrap_err();
        assert!(err.to_string().contains("redis_host"));

        config.lock.redis_host = Some(String::new());
        assert!(validate_storage_config(&config, Environment::Dev).is_err());
    }
}

//! Storage configuration.
//!
//! The storage section is a discriminated union keyed by `type`:
//!
//! ```toml
//! [storage]
//! type = "gcs"
//! bucket = "my-bucket"
//! prefix = "prod/"
//! project_id = "my-project"
//!
//! [storage.lock]
//! strategy = "redis"
//! redis_host = "10.0.0.5"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Backend type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Local filesystem.
    File,
    /// Google Cloud Storage.
    Gcs,
    /// S3-compatible object storage.
    S3,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Gcs => write!(f, "gcs"),
            Self::S3 => write!(f, "s3"),
        }
    }
}

/// Lock strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStrategy {
    /// Exclusive lock-file creation on local disk.
    File,
    /// Lock objects in the bucket (conditional create or put-then-verify).
    Object,
    /// Redis `SET NX PX`.
    Redis,
}

impl std::fmt::Display for LockStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Object => write!(f, "object"),
            Self::Redis => write!(f, "redis"),
        }
    }
}

/// Lock configuration shared by every strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    /// Strategy; when absent the backend's native strategy is used.
    #[serde(default)]
    pub strategy: Option<LockStrategy>,

    /// Lease after which an unreleased lock may be reclaimed.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_seconds: f64,

    /// Consecutive transient backend errors tolerated while acquiring.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Base delay between contention retries.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: f64,

    /// Redis host (required for the redis strategy).
    #[serde(default)]
    pub redis_host: Option<String>,

    /// Redis port.
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis password.
    #[serde(default)]
    pub redis_password: Option<String>,

    /// Redis logical database.
    #[serde(default)]
    pub redis_db: i64,
}

const fn default_lease_duration() -> f64 {
    30.0
}

const fn default_retry_attempts() -> u32 {
    3
}

const fn default_retry_delay() -> f64 {
    0.1
}

const fn default_redis_port() -> u16 {
    6379
}

/// Longest accepted lock lease (one year).
pub const MAX_LEASE_SECONDS: f64 = 31_536_000.0;

/// Longest accepted retry delay.
pub const MAX_RETRY_DELAY_SECONDS: f64 = 3_600.0;

/// Convert configured seconds to a `Duration`, clamped to `[0, max]`.
///
/// Never panics: NaN and negative values map to zero.
pub(crate) fn bounded_seconds(seconds: f64, max: f64) -> Duration {
    if seconds.is_nan() || seconds <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(seconds.min(max)).unwrap_or(Duration::ZERO)
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            lease_duration_seconds: default_lease_duration(),
            retry_attempts: default_retry_attempts(),
            retry_delay_seconds: default_retry_delay(),
            redis_host: None,
            redis_port: default_redis_port(),
            redis_password: None,
            redis_db: 0,
        }
    }
}

impl LockConfig {
    /// Lease as a `Duration`.
    #[must_use]
    pub fn lease(&self) -> Duration {
        bounded_seconds(self.lease_duration_seconds, MAX_LEASE_SECONDS)
    }

    /// Retry delay as a `Duration`.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        bounded_seconds(self.retry_delay_seconds, MAX_RETRY_DELAY_SECONDS)
    }

    /// Check the numeric ranges of the lock settings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first out-of-range setting.
    pub fn check_ranges(&self) -> Result<(), String> {
        let lease = self.lease_duration_seconds;
        if !lease.is_finite() || lease <= 0.0 || lease > MAX_LEASE_SECONDS {
            return Err(format!(
                "storage.lock.lease_duration_seconds must be in (0, {MAX_LEASE_SECONDS}], got {lease}"
            ));
        }
        let delay = self.retry_delay_seconds;
        if !delay.is_finite() || !(0.0..=MAX_RETRY_DELAY_SECONDS).contains(&delay) {
            return Err(format!(
                "storage.lock.retry_delay_seconds must be in [0, {MAX_RETRY_DELAY_SECONDS}], got {delay}"
            ));
        }
        Ok(())
    }

    /// Build the Redis connection URL.
    ///
    /// Returns `None` when no host is configured.
    #[must_use]
    pub fn redis_url(&self) -> Option<String> {
        let host = self.redis_host.as_deref()?;
        let auth = self
            .redis_password
            .as_deref()
            .map(|password| format!(":{}@", urlencoding::encode(password)))
            .unwrap_or_default();
        Some(format!(
            "redis://{auth}{host}:{}/{}",
            self.redis_port, self.redis_db
        ))
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Lock configuration.
    #[serde(default)]
    pub lock: LockConfig,

    /// Backend-specific settings, discriminated by `type`.
    #[serde(flatten)]
    pub backend: BackendConfig,
}

impl StorageConfig {
    /// Backend discriminant.
    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self.backend {
            BackendConfig::File(_) => BackendKind::File,
            BackendConfig::Gcs(_) => BackendKind::Gcs,
            BackendConfig::S3(_) => BackendKind::S3,
        }
    }

    /// Effective lock strategy for this backend.
    #[must_use]
    pub fn lock_strategy(&self) -> LockStrategy {
        self.lock.strategy.unwrap_or(match self.kind() {
            BackendKind::File => LockStrategy::File,
            BackendKind::Gcs | BackendKind::S3 => LockStrategy::Object,
        })
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            lock: LockConfig::default(),
            backend: BackendConfig::File(FileStorageConfig::default()),
        }
    }
}

/// Backend-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local filesystem.
    File(FileStorageConfig),
    /// Google Cloud Storage.
    Gcs(GcsStorageConfig),
    /// S3-compatible object storage.
    S3(S3StorageConfig),
}

/// File storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FileStorageConfig {
    /// Storage root.
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,
}

fn default_base_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
        }
    }
}

/// Google Cloud Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GcsStorageConfig {
    /// Bucket name.
    pub bucket: String,

    /// Key prefix inside the bucket.
    #[serde(default)]
    pub prefix: String,

    /// Project billed for requests.
    pub project_id: String,

    /// Service-account key file, or a file holding an OAuth2 access token
    /// (raw or `{"access_token": ...}`). When absent the metadata server is
    /// queried.
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// API endpoint override (emulators).
    #[serde(default)]
    pub endpoint_url: Option<String>,
}

/// Static S3 credentials.
#[derive(Debug, Clone, Deserialize)]
pub struct S3Credentials {
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
    /// Session token for temporary credentials.
    #[serde(default)]
    pub session_token: Option<String>,
}

/// S3 storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct S3StorageConfig {
    /// Bucket name.
    pub bucket: String,

    /// Key prefix inside the bucket.
    #[serde(default)]
    pub prefix: String,

    /// Region; defaults to the SDK's provider chain.
    #[serde(default)]
    pub region_name: Option<String>,

    /// Static credentials; defaults to the SDK's provider chain.
    #[serde(default)]
    pub credentials: Option<S3Credentials>,

    /// Endpoint override for S3-compatible services.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// Wait between the lock put and its verification read.
    #[serde(default = "default_propagation_delay_ms")]
    pub propagation_delay_ms: u64,
}

const fn default_propagation_delay_ms() -> u64 {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_file_backend_with_file_locks() {
        let config = StorageConfig::default();
        assert_eq!(config.kind(), BackendKind::File);
        assert_eq!(config.lock_strategy(), LockStrategy::File);
        assert!((config.lock.lease_duration_seconds - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_deserialize_tagged_gcs() {
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "type": "gcs",
            "bucket": "docs",
            "prefix": "beta/",
            "project_id": "proj",
            "lock": { "strategy": "redis", "redis_host": "cache" }
        }))
        .unwrap();

        assert_eq!(config.kind(), BackendKind::Gcs);
        assert_eq!(config.lock_strategy(), LockStrategy::Redis);
        assert_eq!(config.lock.redis_port, 6379);
        match config.backend {
            BackendConfig::Gcs(gcs) => {
                assert_eq!(gcs.bucket, "docs");
                assert_eq!(gcs.prefix, "beta/");
            }
            other => panic!("unexpected backend: {other:?}"),
        }
    }

    #[test]
    fn test_object_backends_default_to_object_locks() {
        let config: StorageConfig = serde_json::from_value(serde_json::json!({
            "type": "s3",
            "bucket": "docs"
        }))
        .unwrap();
        assert_eq!(config.lock_strategy(), LockStrategy::Object);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let result: Result<StorageConfig, _> =
            serde_json::from_value(serde_json::json!({ "type": "ftp" }));
        assert!(result.is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected_without_panicking() {
        for lease in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e20] {
            let lock = LockConfig {
                lease_duration_seconds: lease,
                ..LockConfig::default()
            };
            assert!(lock.check_ranges().is_err(), "lease {lease}");
            assert!(lock.lease() <= Duration::from_secs_f64(MAX_LEASE_SECONDS));
        }

        let lock = LockConfig {
            retry_delay_seconds: 1e20,
            ..LockConfig::default()
        };
        assert!(lock.check_ranges().is_err());
        assert_eq!(lock.retry_delay(), Duration::from_secs(3_600));
        assert!(LockConfig::default().check_ranges().is_ok());
    }

    #[test]
    fn test_redis_url() {
        let mut lock = LockConfig::default();
        assert!(lock.redis_url().is_none());

        lock.redis_host = Some("localhost".to_string());
        lock.redis_db = 2;
        assert_eq!(lock.redis_url().unwrap(), "redis://localhost:6379/2");

        lock.redis_password = Some("p@ss".to_string());
        assert_eq!(lock.redis_url().unwrap(), "redis://:p%40ss@localhost:6379/2");
    }
}

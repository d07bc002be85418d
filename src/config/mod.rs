//! Configuration management module.
//!
//! Supports loading configuration from:
//! - A `.env` file in the working directory
//! - TOML files (config/default.toml, config/{profile}.toml)
//! - Environment variables with `DOCSTORE__<SECTION>__<KEY>` pattern

mod storage;

use std::time::Duration;

use config::{Config, ConfigError, Environment as EnvSource, File};
use serde::Deserialize;

pub use storage::{
    BackendConfig, BackendKind, FileStorageConfig, GcsStorageConfig, LockConfig, LockStrategy,
    S3Credentials, S3StorageConfig, StorageConfig,
};

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Local development.
    #[default]
    Dev,
    /// Pre-production.
    Beta,
    /// Production.
    Prod,
}

impl Environment {
    /// Whether local/ephemeral storage is acceptable.
    #[must_use]
    pub const fn allows_local_storage(self) -> bool {
        matches!(self, Self::Dev)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dev => write!(f, "dev"),
            Self::Beta => write!(f, "beta"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Deployment environment.
    #[serde(default)]
    pub environment: Environment,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Document helper configuration.
    #[serde(default)]
    pub documents: DocumentConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from files and environment.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. `config/default.toml`
    /// 2. `config/{DOCSTORE_PROFILE}.toml` (if `DOCSTORE_PROFILE` is set)
    /// 3. Environment variables with `DOCSTORE__` prefix
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded or is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let profile = std::env::var("DOCSTORE_PROFILE").unwrap_or_else(|_| "dev".to_string());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{profile}")).required(false))
            // DOCSTORE__STORAGE__LOCK__STRATEGY=redis -> storage.lock.strategy = "redis"
            .add_source(
                EnvSource::with_prefix("DOCSTORE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app_config: Self = config.try_deserialize()?;
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate value ranges.
    ///
    /// Backend/strategy compatibility and environment policy are enforced by
    /// the storage factory at construction time.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric setting is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.lock.check_ranges().map_err(ConfigError::Message)?;

        let timeout = self.documents.lock_timeout_seconds;
        if !timeout.is_finite() || timeout <= 0.0 || timeout > MAX_LOCK_TIMEOUT_SECONDS {
            return Err(ConfigError::Message(format!(
                "documents.lock_timeout_seconds must be in (0, {MAX_LOCK_TIMEOUT_SECONDS}], got {timeout}"
            )));
        }

        Ok(())
    }
}

/// Longest accepted document lock timeout.
pub const MAX_LOCK_TIMEOUT_SECONDS: f64 = 3_600.0;

/// Document helper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DocumentConfig {
    /// Lock budget for each create/update/delete.
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: f64,
}

const fn default_lock_timeout() -> f64 {
    10.0
}

impl DocumentConfig {
    /// Lock budget as a `Duration`.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        storage::bounded_seconds(self.lock_timeout_seconds, MAX_LOCK_TIMEOUT_SECONDS)
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            lock_timeout_seconds: default_lock_timeout(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Number of contended resources reported in monitor snapshots.
    #[serde(default = "default_top_contended")]
    pub top_contended: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

const fn default_top_contended() -> usize {
    10
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            top_contended: default_top_contended(),
        }
    }
}

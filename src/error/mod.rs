//! Error handling module.
//!
//! One error type crosses the storage boundary. "Not found" on a lookup is never
//! an error here; lookups return `Option` and only operations that require an
//! existing record surface [`StorageError::NotFound`].

pub mod codes;

use std::time::Duration;

pub use codes::ErrorCode;

/// Storage-layer error type.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Generic storage failure: I/O, network, or malformed data on read.
    #[error("Storage operation failed on '{path}': {message}")]
    Backend {
        /// Path or object key the operation targeted.
        path: String,
        /// Underlying cause.
        message: String,
    },

    /// Path rejected before touching the backend.
    #[error("Invalid storage path '{0}'")]
    InvalidPath(String),

    /// Lock could not be acquired before the caller's timeout elapsed.
    #[error("Failed to acquire lock on '{resource}' within {timeout:?}")]
    LockTimeout {
        /// Logical resource the lock protects.
        resource: String,
        /// Budget the caller granted.
        timeout: Duration,
    },

    /// Record creation collided with an existing key.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// Operation requires an existing record and none was found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid configuration or environment policy violation.
    #[error("Invalid storage configuration: {0}")]
    Config(String),

    /// Backend not reachable.
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Wrap an underlying failure with the path it occurred on.
    pub fn backend(path: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Backend {
            path: path.into(),
            message: cause.to_string(),
        }
    }

    /// Whether the caller may reasonably retry the same operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. } | Self::Unavailable(_))
    }

    /// Get the error code for this error.
    #[must_use]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::Config(_) => ErrorCode::INVALID_CONFIG,
            Self::InvalidPath(_) => ErrorCode::INVALID_PATH,
            Self::AlreadyExists(_) => ErrorCode::ALREADY_EXISTS,
            Self::NotFound(_) => ErrorCode::NOT_FOUND,
            Self::Backend { .. } => ErrorCode::STORAGE_ERROR,
            Self::Unavailable(_) => ErrorCode::SERVICE_UNAVAILABLE,
            Self::LockTimeout { .. } => ErrorCode::LOCK_TIMEOUT,
        }
    }
}

/// Result type alias using `StorageError`.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

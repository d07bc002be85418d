//! Error code constants.
//!
//! Error codes are organized by category:
//! - 1xxx: Configuration errors
//! - 3xxx: Validation errors
//! - 4xxx: Record errors
//! - 5xxx: Storage/backend errors
//! - 6xxx: Lock errors

/// Error code type with semantic categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(i32);

impl ErrorCode {
    // ===== Configuration Errors (1xxx) =====

    /// Invalid storage configuration or environment policy violation.
    pub const INVALID_CONFIG: Self = Self(1001);

    // ===== Validation Errors (3xxx) =====

    /// Path escapes the storage root or is otherwise malformed.
    pub const INVALID_PATH: Self = Self(3001);

    // ===== Record Errors (4xxx) =====

    /// Record not found.
    pub const NOT_FOUND: Self = Self(4001);

    /// Record already exists.
    pub const ALREADY_EXISTS: Self = Self(4002);

    // ===== Storage Errors (5xxx) =====

    /// Storage backend error.
    pub const STORAGE_ERROR: Self = Self(5001);

    /// Backend unavailable.
    pub const SERVICE_UNAVAILABLE: Self = Self(5003);

    // ===== Lock Errors (6xxx) =====

    /// Lock acquisition timed out.
    pub const LOCK_TIMEOUT: Self = Self(6001);

    /// Get the error code as an i32.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Get the category of this error code.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.0 {
            1000..=1999 => ErrorCategory::Configuration,
            3000..=3999 => ErrorCategory::Validation,
            4000..=4999 => ErrorCategory::Record,
            5000..=5999 => ErrorCategory::Storage,
            6000..=6999 => ErrorCategory::Lock,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

/// Error category based on error code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration-related errors (1xxx).
    Configuration,
    /// Validation errors (3xxx).
    Validation,
    /// Record errors (4xxx).
    Record,
    /// Storage/backend errors (5xxx).
    Storage,
    /// Lock errors (6xxx).
    Lock,
    /// Unknown category.
    Unknown,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Validation => write!(f, "validation"),
            Self::Record => write!(f, "record"),
            Self::Storage => write!(f, "storage"),
            Self::Lock => write!(f, "lock"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

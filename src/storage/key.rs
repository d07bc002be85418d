//! Storage key validation.
//!
//! Keys are `/`-separated relative paths. A key may never contain `..`, and
//! any segment starting with `.` is reserved: `.locks/` holds lock records and
//! other dot-prefixed names are backend scratch space. Reserved keys never
//! appear in listings.

use crate::error::{StorageError, StorageResult};

/// Namespace holding lock records.
pub const LOCKS_NAMESPACE: &str = ".locks";

/// Validate a key addressing a document.
///
/// # Errors
///
/// Returns [`StorageError::InvalidPath`] if the key is empty, absolute,
/// contains `..`, a backslash, a NUL byte, or an empty segment.
pub fn validate_path(path: &str) -> StorageResult<&str> {
    if path.is_empty()
        || path.starts_with('/')
        || path.contains("..")
        || path.contains('\\')
        || path.contains('\0')
        || path.split('/').any(str::is_empty)
    {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(path)
}

/// Validate a listing prefix. The empty prefix lists everything.
///
/// # Errors
///
/// Returns [`StorageError::InvalidPath`] if the prefix is absolute or contains `..`.
pub fn validate_prefix(prefix: &str) -> StorageResult<&str> {
    if prefix.starts_with('/') || prefix.contains("..") || prefix.contains('\\') {
        return Err(StorageError::InvalidPath(prefix.to_string()));
    }
    Ok(prefix)
}

/// Validate a single identity segment used to build a record key.
///
/// # Errors
///
/// Returns [`StorageError::InvalidPath`] if the segment is empty, contains `/`,
/// or starts with `.`.
pub fn validate_segment(segment: &str) -> StorageResult<&str> {
    if segment.is_empty() || segment.contains('/') || segment.starts_with('.') {
        return Err(StorageError::InvalidPath(segment.to_string()));
    }
    validate_path(segment)
}

/// Whether a key lives in reserved or hidden space.
#[must_use]
pub fn is_hidden(key: &str) -> bool {
    key.split('/').any(|segment| segment.starts_with('.'))
}

/// Flat, collision-free file/object name for a lock on `resource`.
#[must_use]
pub fn lock_name(resource: &str) -> String {
    urlencoding::encode(resource).into_owned()
}

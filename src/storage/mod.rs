//! Storage layer module.
//!
//! This module provides trait-based storage abstraction allowing different backends
//! to be used without changing business logic, and cross-process locking with
//! strategies matched to each backend's consistency primitives.

pub mod documents;
pub mod factory;
pub mod file;
pub mod key;
pub mod monitor;
pub mod monitored;
pub mod object;
#[cfg(feature = "redis")]
pub mod redis_lock;
pub mod traits;

pub use documents::DocumentStore;
pub use factory::{create_storage, validate_storage_config};
pub use monitor::{MonitorSnapshot, StorageMonitor};
pub use monitored::MonitoredStorage;
pub use traits::{DistributedLock, LockGuard, RetryPolicy, Storage};

//! # Docstore
//!
//! Pluggable document storage with cross-process locking:
//!
//! - **File**: local disk, locks via exclusive lock-file creation with
//!   PID and age based staleness detection
//! - **GCS**: bucket objects, locks via generation-conditional creates
//! - **S3**: bucket objects, best-effort put-then-verify locks
//! - **Redis**: `SET NX PX` locks usable with any backend
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              Docstore                              │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌──────────────┐  ┌─────────────┐  ┌──────────┐  │
//! │  │  Documents  │→ │  Monitored   │→ │   Backend   │→ │   Lock   │  │
//! │  │   (CRUD)    │  │   Storage    │  │ file/gcs/s3 │  │ strategy │  │
//! │  └─────────────┘  └──────────────┘  └─────────────┘  └──────────┘  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![deny(unsafe_code)]

pub mod config;
pub mod domain;
pub mod error;
pub mod storage;

use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::storage::{DocumentStore, MonitoredStorage, StorageMonitor, create_storage};

/// Run the docstore health probe.
///
/// This function:
/// 1. Loads configuration from files and environment
/// 2. Initializes logging
/// 3. Builds and health-checks the configured backend
/// 4. Exercises one lock round-trip through the document layer
/// 5. Logs a monitor snapshot
///
/// # Errors
///
/// Returns an error if:
/// - Configuration cannot be loaded
/// - The backend is disallowed in this environment or fails to initialize
/// - The probe lock cannot be acquired
pub async fn run() -> anyhow::Result<()> {
    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        backend = %config.storage.kind(),
        "Starting docstore"
    );

    let monitor = Arc::new(StorageMonitor::new());
    let backend = create_storage(&config.storage, config.environment).await?;
    let storage = Arc::new(MonitoredStorage::new(backend, Arc::clone(&monitor)));
    let documents = DocumentStore::new(storage, config.documents.lock_timeout());

    let guard = documents
        .storage()
        .lock("docstore/probe", config.documents.lock_timeout())
        .await?;
    guard.release().await;

    let snapshot = monitor.snapshot(config.observability.top_contended);
    info!(snapshot = %serde_json::to_string(&snapshot)?, "Storage probe complete");
    Ok(())
}

/// Initialize logging based on configuration.
fn init_logging(config: &AppConfig) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.observability.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }
}

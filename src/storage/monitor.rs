//! Lock and I/O instrumentation.
//!
//! One [`StorageMonitor`] is built per process and shared by reference. It
//! keeps in-process counters for snapshots and mirrors them to the `metrics`
//! facade. Recording never fails and never alters the observed result.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{StorageError, StorageResult};

/// Duration samples kept per window.
pub const SAMPLE_WINDOW: usize = 1000;

/// Resources tracked for contention ranking.
pub const MAX_TRACKED_RESOURCES: usize = 10_000;

/// Size the resource table is trimmed back to once it overflows.
const TRIMMED_RESOURCES: usize = MAX_TRACKED_RESOURCES * 9 / 10;

/// Bounded window of recent durations.
#[derive(Debug, Default)]
struct Samples(VecDeque<Duration>);

impl Samples {
    fn push(&mut self, duration: Duration) {
        if self.0.len() == SAMPLE_WINDOW {
            self.0.pop_front();
        }
        self.0.push_back(duration);
    }

    fn average_ms(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        let total: f64 = self.0.iter().map(Duration::as_secs_f64).sum();
        #[allow(clippy::cast_precision_loss)]
        let count = self.0.len() as f64;
        total / count * 1000.0
    }

    fn p95_ms(&self) -> f64 {
        if self.0.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<Duration> = self.0.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (sorted.len() * 95).div_ceil(100).saturating_sub(1);
        sorted[rank.min(sorted.len() - 1)].as_secs_f64() * 1000.0
    }
}

#[derive(Debug, Default)]
struct ResourceStats {
    attempts: u64,
    failures: u64,
    total_wait: Duration,
}

#[derive(Debug, Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    durations: Samples,
}

/// Lock acquisition counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LockSnapshot {
    /// Acquisition attempts.
    pub attempts: u64,
    /// Successful acquisitions.
    pub successes: u64,
    /// Failed acquisitions, timeouts included.
    pub failures: u64,
    /// Acquisitions that ran out of time.
    pub timeouts: u64,
    /// Mean acquisition time over the sample window.
    pub avg_ms: f64,
    /// 95th percentile acquisition time over the sample window.
    pub p95_ms: f64,
}

/// Per-operation counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OperationSnapshot {
    /// Calls observed.
    pub count: u64,
    /// Calls that returned an error.
    pub errors: u64,
    /// Mean duration over the sample window.
    pub avg_ms: f64,
    /// 95th percentile duration over the sample window.
    pub p95_ms: f64,
}

/// A resource ranked by lock contention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContendedResource {
    /// Resource path.
    pub resource: String,
    /// Acquisition attempts.
    pub attempts: u64,
    /// Failed acquisitions.
    pub failures: u64,
    /// Total time spent acquiring.
    pub total_wait_ms: f64,
}

/// Point-in-time view of the monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    /// Lock counters.
    pub lock: LockSnapshot,
    /// Storage operation counters by operation name.
    pub operations: BTreeMap<String, OperationSnapshot>,
    /// Most contended resources, worst first.
    pub top_contended: Vec<ContendedResource>,
}

/// Storage monitor.
#[derive(Debug, Default)]
pub struct StorageMonitor {
    lock_attempts: AtomicU64,
    lock_successes: AtomicU64,
    lock_failures: AtomicU64,
    lock_timeouts: AtomicU64,
    lock_durations: Mutex<Samples>,
    resources: DashMap<String, ResourceStats>,
    operations: DashMap<&'static str, OperationStats>,
}

impl StorageMonitor {
    /// Create an empty monitor.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe one lock acquisition.
    pub async fn monitor_lock_acquisition<F, T>(
        &self,
        resource: &str,
        strategy: &'static str,
        acquire: F,
    ) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let started = Instant::now();
        let result = acquire.await;
        self.record_lock(resource, strategy, started.elapsed(), result.as_ref().err());
        result
    }

    /// Observe one storage primitive.
    pub async fn monitor_storage_operation<F, T>(&self, op: &'static str, operation: F) -> StorageResult<T>
    where
        F: Future<Output = StorageResult<T>>,
    {
        let started = Instant::now();
        let result = operation.await;
        self.record_operation(op, started.elapsed(), result.is_err());
        result
    }

    /// Record a finished lock acquisition.
    pub fn record_lock(
        &self,
        resource: &str,
        strategy: &'static str,
        elapsed: Duration,
        error: Option<&StorageError>,
    ) {
        self.lock_attempts.fetch_add(1, Ordering::Relaxed);
        let outcome = match error {
            None => {
                self.lock_successes.fetch_add(1, Ordering::Relaxed);
                "acquired"
            }
            Some(StorageError::LockTimeout { .. }) => {
                self.lock_failures.fetch_add(1, Ordering::Relaxed);
                self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
                "timeout"
            }
            Some(_) => {
                self.lock_failures.fetch_add(1, Ordering::Relaxed);
                "error"
            }
        };
        self.lock_durations.lock().push(elapsed);

        {
            let mut stats = self.resources.entry(resource.to_string()).or_default();
            stats.attempts += 1;
            stats.total_wait += elapsed;
            if error.is_some() {
                stats.failures += 1;
            }
        }
        if self.resources.len() > MAX_TRACKED_RESOURCES {
            self.evict_least_contended();
        }

        metrics::counter!("docstore_lock_acquisitions_total", "strategy" => strategy, "outcome" => outcome)
            .increment(1);
        metrics::histogram!("docstore_lock_wait_seconds", "strategy" => strategy)
            .record(elapsed.as_secs_f64());
    }

    /// Drop the least contended resources until the table is back under its trim size.
    fn evict_least_contended(&self) {
        let mut ranked: Vec<(String, u64, Duration)> = self
            .resources
            .iter()
            .map(|entry| (entry.key().clone(), entry.failures, entry.total_wait))
            .collect();
        if ranked.len() <= MAX_TRACKED_RESOURCES {
            return;
        }
        ranked.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.2.cmp(&b.2)));
        let excess = ranked.len() - TRIMMED_RESOURCES;
        for (resource, ..) in ranked.into_iter().take(excess) {
            self.resources.remove(&resource);
        }
    }

    /// Record a finished storage primitive.
    pub fn record_operation(&self, op: &'static str, elapsed: Duration, failed: bool) {
        {
            let mut stats = self.operations.entry(op).or_default();
            stats.count += 1;
            if failed {
                stats.errors += 1;
            }
            stats.durations.push(elapsed);
        }

        metrics::counter!("docstore_storage_operations_total", "op" => op).increment(1);
        if failed {
            metrics::counter!("docstore_storage_errors_total", "op" => op).increment(1);
        }
        metrics::histogram!("docstore_storage_operation_seconds", "op" => op)
            .record(elapsed.as_secs_f64());
    }

    /// Current counters with the `top_n` most contended resources.
    #[must_use]
    pub fn snapshot(&self, top_n: usize) -> MonitorSnapshot {
        let (avg_ms, p95_ms) = {
            let durations = self.lock_durations.lock();
            (durations.average_ms(), durations.p95_ms())
        };
        let lock = LockSnapshot {
            attempts: self.lock_attempts.load(Ordering::Relaxed),
            successes: self.lock_successes.load(Ordering::Relaxed),
            failures: self.lock_failures.load(Ordering::Relaxed),
            timeouts: self.lock_timeouts.load(Ordering::Relaxed),
            avg_ms,
            p95_ms,
        };

        let operations = self
            .operations
            .iter()
            .map(|entry| {
                let stats = entry.value();
                (
                    (*entry.key()).to_string(),
                    OperationSnapshot {
                        count: stats.count,
                        errors: stats.errors,
                        avg_ms: stats.durations.average_ms(),
                        p95_ms: stats.durations.p95_ms(),
                    },
                )
            })
            .collect();

        let mut contended: Vec<ContendedResource> = self
            .resources
            .iter()
            .map(|entry| ContendedResource {
                resource: entry.key().clone(),
                attempts: entry.attempts,
                failures: entry.failures,
                total_wait_ms: entry.total_wait.as_secs_f64() * 1000.0,
            })
            .collect();
        contended.sort_by(|a, b| {
            b.failures
                .cmp(&a.failures)
                .then_with(|| b.total_wait_ms.total_cmp(&a.total_wait_ms))
                .then_with(|| a.resource.cmp(&b.resource))
        });
        contended.truncate(top_n);

        MonitorSnapshot {
            lock,
            operations,
            top_contended: contended,
        }
    }

    /// Clear every counter.
    pub fn reset(&self) {
        self.lock_attempts.store(0, Ordering::Relaxed);
        self.lock_successes.store(0, Ordering::Relaxed);
        self.lock_failures.store(0, Ordering::Relaxed);
        self.lock_timeouts.store(0, Ordering::Relaxed);
        *self.lock_durations.lock() = Samples::default();
        self.resources.clear();
        self.operations.clear();
    }
}

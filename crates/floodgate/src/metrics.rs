//! Pool observability and metrics
//!
//! Lock-free atomic counters for in-process stats, mirrored to the
//! `metrics` crate facade (Prometheus, Statsd, and other exporters attach
//! there). The optional [`DistributedMetrics`] collector additionally
//! accumulates the same counters through the shared [`StateStore`] so
//! several pool instances produce one aggregate view. Metrics are consumed
//! for observability only, never for correctness.

use crate::store::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Snapshot of the in-process pool counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Connections opened over the pool's lifetime
    pub connections_created: u64,
    /// Connections closed over the pool's lifetime
    pub connections_closed: u64,
    /// Connection-creation attempts that failed
    pub connection_failures: u64,
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Acquisitions that timed out waiting
    pub exhaustions: u64,
    /// Acquisitions rejected by the circuit breaker
    pub circuit_rejections: u64,
    /// Statements executed
    pub queries: u64,
    /// Statements that failed
    pub query_errors: u64,
    /// Statements slower than the configured threshold
    pub slow_queries: u64,
    /// Requests rejected by the DoS guard
    pub validation_failures: u64,
    /// Liveness probes that failed
    pub ping_failures: u64,
    /// Total time callers spent waiting to acquire, in milliseconds
    pub total_wait_ms: u64,
    /// Total statement execution time, in milliseconds
    pub total_query_ms: u64,
}

impl MetricsSnapshot {
    /// Average acquisition wait in milliseconds
    pub fn avg_wait_ms(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.total_wait_ms as f64 / self.acquisitions as f64
        }
    }

    /// Average statement time in milliseconds
    pub fn avg_query_ms(&self) -> f64 {
        if self.queries == 0 {
            0.0
        } else {
            self.total_query_ms as f64 / self.queries as f64
        }
    }
}

/// Pool metrics collector with atomic counters for lock-free updates
#[derive(Debug)]
pub struct PoolMetrics {
    /// Driver label for the metrics facade
    driver: String,
    /// Database label for the metrics facade
    database: String,

    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    connection_failures: AtomicU64,
    acquisitions: AtomicU64,
    exhaustions: AtomicU64,
    circuit_rejections: AtomicU64,
    queries: AtomicU64,
    query_errors: AtomicU64,
    slow_queries: AtomicU64,
    validation_failures: AtomicU64,
    ping_failures: AtomicU64,
    total_wait_ms: AtomicU64,
    total_query_ms: AtomicU64,
}

impl PoolMetrics {
    /// Create a collector labeled with the driver and database names
    pub fn new(driver: &str, database: &str) -> Self {
        Self {
            driver: driver.to_string(),
            database: database.to_string(),
            connections_created: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            query_errors: AtomicU64::new(0),
            slow_queries: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            ping_failures: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
            total_query_ms: AtomicU64::new(0),
        }
    }

    fn counter(&self, name: &'static str) -> metrics::Counter {
        metrics::counter!(
            name,
            "driver" => self.driver.clone(),
            "database" => self.database.clone()
        )
    }

    /// Record a connection successfully opened
    #[inline]
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_connections_created_total").increment(1);
    }

    /// Record a connection closed
    #[inline]
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_connections_closed_total").increment(1);
    }

    /// Record a failed connection attempt
    #[inline]
    pub fn record_connection_failure(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_connection_failures_total").increment(1);
    }

    /// Record a successful acquisition and its wait time
    pub fn record_acquisition(&self, waited: Duration) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_ms
            .fetch_add(waited.as_millis() as u64, Ordering::Relaxed);
        self.counter("floodgate_acquisitions_total").increment(1);
        metrics::histogram!(
            "floodgate_acquire_wait_seconds",
            "driver" => self.driver.clone(),
            "database" => self.database.clone()
        )
        .record(waited.as_secs_f64());
    }

    /// Record an acquisition that timed out
    #[inline]
    pub fn record_exhausted(&self) {
        self.exhaustions.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_pool_exhausted_total").increment(1);
    }

    /// Record an acquisition refused by the breaker
    #[inline]
    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_circuit_rejections_total").increment(1);
    }

    /// Record a completed statement and its duration
    pub fn record_query(&self, elapsed: Duration, slow: bool) {
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.total_query_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        if slow {
            self.slow_queries.fetch_add(1, Ordering::Relaxed);
            self.counter("floodgate_slow_queries_total").increment(1);
        }
        self.counter("floodgate_queries_total").increment(1);
        metrics::histogram!(
            "floodgate_query_seconds",
            "driver" => self.driver.clone(),
            "database" => self.database.clone()
        )
        .record(elapsed.as_secs_f64());
    }

    /// Record a failed statement
    #[inline]
    pub fn record_query_error(&self) {
        self.query_errors.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_query_errors_total").increment(1);
    }

    /// Record a request rejected by the DoS guard
    #[inline]
    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_validation_failures_total").increment(1);
    }

    /// Record a failed liveness probe
    #[inline]
    pub fn record_ping_failure(&self) {
        self.ping_failures.fetch_add(1, Ordering::Relaxed);
        self.counter("floodgate_ping_failures_total").increment(1);
    }

    /// Report current pool occupancy to the gauge exporters
    pub fn record_pool_size(&self, size: usize, in_use: usize) {
        metrics::gauge!(
            "floodgate_pool_size",
            "driver" => self.driver.clone(),
            "database" => self.database.clone()
        )
        .set(size as f64);
        metrics::gauge!(
            "floodgate_pool_in_use",
            "driver" => self.driver.clone(),
            "database" => self.database.clone()
        )
        .set(in_use as f64);
    }

    /// Snapshot current counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            connection_failures: self.connection_failures.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            query_errors: self.query_errors.load(Ordering::Relaxed),
            slow_queries: self.slow_queries.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            ping_failures: self.ping_failures.load(Ordering::Relaxed),
            total_wait_ms: self.total_wait_ms.load(Ordering::Relaxed),
            total_query_ms: self.total_query_ms.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Distributed metrics
// ============================================================================

/// Counter fields mirrored into the shared store
const DISTRIBUTED_FIELDS: &[&str] = &[
    "connections_created",
    "connections_closed",
    "connection_failures",
    "acquisitions",
    "exhaustions",
    "circuit_rejections",
    "queries",
    "query_errors",
    "slow_queries",
];

/// Aggregates counters from multiple pool instances through the shared
/// store. Store failures are logged and dropped; a lossy aggregate beats a
/// stalled pool.
pub struct DistributedMetrics {
    store: Arc<dyn StateStore>,
    namespace: String,
}

impl DistributedMetrics {
    /// Create a collector writing under `namespace` in `store`
    pub fn new(store: Arc<dyn StateStore>, namespace: String) -> Self {
        Self { store, namespace }
    }

    fn key(&self, field: &str) -> String {
        format!("{}:metrics:{}", self.namespace, field)
    }

    /// Add to one of the shared counters
    pub async fn incr(&self, field: &str, delta: u64) {
        if let Err(e) = self.store.incr(&self.key(field), delta as i64).await {
            warn!(field, error = %e, "distributed metrics update failed");
        }
    }

    /// Read the aggregate view across all pool instances
    pub async fn aggregate(&self) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot::default();
        for field in DISTRIBUTED_FIELDS {
            let value = match self.store.get(&self.key(field)).await {
                Ok(Some(v)) => v.parse().unwrap_or(0),
                Ok(None) => 0,
                Err(e) => {
                    warn!(field, error = %e, "distributed metrics read failed");
                    0
                }
            };
            match *field {
                "connections_created" => snapshot.connections_created = value,
                "connections_closed" => snapshot.connections_closed = value,
                "connection_failures" => snapshot.connection_failures = value,
                "acquisitions" => snapshot.acquisitions = value,
                "exhaustions" => snapshot.exhaustions = value,
                "circuit_rejections" => snapshot.circuit_rejections = value,
                "queries" => snapshot.queries = value,
                "query_errors" => snapshot.query_errors = value,
                "slow_queries" => snapshot.slow_queries = value,
                _ => {}
            }
        }
        snapshot
    }
}

//! Pooled connection lifecycle wrapper
//!
//! Wraps one live driver session with identity, timestamps, health flags,
//! and usage counters. State transitions follow
//! `NEW -> IDLE <-> IN_USE -> ... -> CLOSED` (terminal, idempotent).
//!
//! Exclusivity is enforced with a compare-and-swap on the `in_use` flag:
//! two concurrent acquisitions can race on the same entry, but only one
//! wins the CAS; the loser's scan moves on to the next candidate.

use crate::driver::DriverConnection;
use crate::error::{PoolError, Result};
use crate::statements::StatementCache;
use crate::types::{Row, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

/// Sentinel for "no idle timestamp" (connection is in use)
const NOT_IDLE: u64 = u64::MAX;

/// Retire connections at 90% of `max_lifetime` rather than waiting for a
/// mid-request failure at the exact boundary.
const LIFETIME_REFRESH_FRACTION: f64 = 0.9;

/// Point-in-time view of one connection, for health reporting
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionSummary {
    /// Connection identity
    pub id: Uuid,
    /// Seconds since the connection was created
    pub age_secs: u64,
    /// Currently handed out to a caller
    pub in_use: bool,
    /// Has an open transaction
    pub in_transaction: bool,
    /// Passed its last liveness probe
    pub healthy: bool,
    /// Times this connection has been acquired
    pub acquisition_count: u64,
    /// Statements run on this connection
    pub query_count: u64,
    /// Most recent error observed on this connection
    pub last_error: Option<String>,
}

/// One pooled database connection
pub struct PooledConnection {
    id: Uuid,
    created_at: Instant,

    in_use: AtomicBool,
    in_transaction: AtomicBool,
    healthy: AtomicBool,
    closed: AtomicBool,

    /// Micros since `created_at`; `NOT_IDLE` while the connection is in use
    idle_since_micros: AtomicU64,
    /// Micros since `created_at` of the last acquire/use
    last_used_micros: AtomicU64,
    /// Micros since `created_at` of the last successful ping
    last_validated_micros: AtomicU64,

    acquisition_count: AtomicU64,
    query_count: AtomicU64,
    total_query_micros: AtomicU64,

    last_error: RwLock<Option<String>>,

    inner: Mutex<Box<dyn DriverConnection>>,
    statements: Mutex<StatementCache>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("age", &self.age())
            .field("in_use", &self.is_in_use())
            .field("in_transaction", &self.is_in_transaction())
            .field("healthy", &self.is_healthy())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Wrap a freshly opened driver session. The connection starts idle.
    pub fn new(inner: Box<dyn DriverConnection>, statement_cache_capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Instant::now(),
            in_use: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            idle_since_micros: AtomicU64::new(0),
            last_used_micros: AtomicU64::new(0),
            last_validated_micros: AtomicU64::new(0),
            acquisition_count: AtomicU64::new(0),
            query_count: AtomicU64::new(0),
            total_query_micros: AtomicU64::new(0),
            last_error: RwLock::new(None),
            inner: Mutex::new(inner),
            statements: Mutex::new(StatementCache::new(statement_cache_capacity)),
        }
    }

    fn now_micros(&self) -> u64 {
        self.created_at.elapsed().as_micros() as u64
    }

    /// Connection identity
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Time since creation
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Whether the connection is currently handed out
    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Whether a transaction is open
    pub fn is_in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::SeqCst)
    }

    /// Whether the last liveness probe passed
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Whether the connection has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Idle and eligible for acquisition
    pub fn is_available(&self) -> bool {
        !self.is_in_use() && self.is_healthy() && !self.is_closed()
    }

    /// How long the connection has been idle; `None` while in use
    pub fn idle_time(&self) -> Option<Duration> {
        let idle_since = self.idle_since_micros.load(Ordering::SeqCst);
        if idle_since == NOT_IDLE {
            return None;
        }
        Some(Duration::from_micros(
            self.now_micros().saturating_sub(idle_since),
        ))
    }

    /// Time since the last successful liveness probe
    pub fn validation_age(&self) -> Duration {
        let validated = self.last_validated_micros.load(Ordering::SeqCst);
        Duration::from_micros(self.now_micros().saturating_sub(validated))
    }

    /// Times this connection has been acquired
    pub fn acquisition_count(&self) -> u64 {
        self.acquisition_count.load(Ordering::SeqCst)
    }

    /// Statements run on this connection
    pub fn query_count(&self) -> u64 {
        self.query_count.load(Ordering::SeqCst)
    }

    /// Cumulative statement execution time
    pub fn total_query_time(&self) -> Duration {
        Duration::from_micros(self.total_query_micros.load(Ordering::SeqCst))
    }

    /// Most recent error observed on this connection
    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Attempt to take exclusive ownership of an idle connection.
    ///
    /// Returns false if another acquisition won the race or the connection
    /// is not in a reusable state.
    pub fn try_acquire(&self) -> bool {
        if !self.is_healthy() || self.is_closed() {
            return false;
        }
        if self
            .in_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let now = self.now_micros();
        self.idle_since_micros.store(NOT_IDLE, Ordering::SeqCst);
        self.last_used_micros.store(now, Ordering::SeqCst);
        self.acquisition_count.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Return the connection to the idle state.
    ///
    /// An open transaction is rolled back first. If the rollback fails the
    /// connection is marked unhealthy and the error propagates so the
    /// orchestrator evicts it: a session with possibly-corrupted
    /// transactional state must never be reused.
    pub async fn release(&self) -> Result<()> {
        if self.is_in_transaction() {
            let result = {
                let mut inner = self.inner.lock().await;
                inner.rollback().await
            };
            match result {
                Ok(()) => {
                    self.in_transaction.store(false, Ordering::SeqCst);
                    debug!(connection = %self.id, "rolled back abandoned transaction on release");
                }
                Err(e) => {
                    self.mark_unhealthy(&e.to_string()).await;
                    self.in_use.store(false, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }

        let now = self.now_micros();
        self.last_used_micros.store(now, Ordering::SeqCst);
        self.in_use.store(false, Ordering::SeqCst);
        self.idle_since_micros.store(now, Ordering::SeqCst);
        Ok(())
    }

    /// Minimal liveness round-trip. Never errors: a failed probe marks the
    /// connection unhealthy and returns false.
    pub async fn ping(&self) -> bool {
        let result = {
            let mut inner = self.inner.lock().await;
            inner.ping().await
        };
        match result {
            Ok(()) => {
                self.last_validated_micros
                    .store(self.now_micros(), Ordering::SeqCst);
                self.healthy.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                self.mark_unhealthy(&e.to_string()).await;
                false
            }
        }
    }

    /// Close the connection. Idempotent; rolls back a dangling transaction
    /// best-effort and clears the statement cache.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut inner = self.inner.lock().await;
        if self.in_transaction.swap(false, Ordering::SeqCst) {
            if let Err(e) = inner.rollback().await {
                warn!(connection = %self.id, error = %e, "rollback during close failed");
            }
        }
        if let Err(e) = inner.close().await {
            debug!(connection = %self.id, error = %e, "error closing driver connection");
        }
        drop(inner);

        self.statements.lock().await.clear();
        self.healthy.store(false, Ordering::SeqCst);
        self.in_use.store(false, Ordering::SeqCst);
    }

    /// Whether the cleanup pass should retire this connection pre-emptively
    pub fn should_refresh(&self, max_lifetime: Duration) -> bool {
        if !self.is_healthy() {
            return true;
        }
        self.age().as_secs_f64() > max_lifetime.as_secs_f64() * LIFETIME_REFRESH_FRACTION
    }

    /// Record a completed statement against the usage counters
    pub fn record_query(&self, elapsed: Duration) {
        self.query_count.fetch_add(1, Ordering::SeqCst);
        self.total_query_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::SeqCst);
    }

    /// Mark the connection unhealthy, recording the error
    pub async fn mark_unhealthy(&self, error: &str) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.last_error.write().await = Some(error.to_string());
    }

    /// Run a statement returning rows, using the per-connection statement
    /// cache (prepare once per SQL text).
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let statement = self.cached_statement(sql).await?;
        let mut inner = self.inner.lock().await;
        inner.query(&statement, params).await
    }

    /// Run a statement returning an affected-row count, using the cache
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let statement = self.cached_statement(sql).await?;
        let mut inner = self.inner.lock().await;
        inner.execute(&statement, params).await
    }

    async fn cached_statement(&self, sql: &str) -> Result<crate::driver::StatementHandle> {
        let mut cache = self.statements.lock().await;
        if let Some(handle) = cache.get(sql) {
            return Ok(handle);
        }

        let mut inner = self.inner.lock().await;
        let handle = inner.prepare(sql).await?;
        if let Some(evicted) = cache.insert(handle.clone()) {
            let _ = inner.deallocate(&evicted).await;
        }
        Ok(handle)
    }

    /// Begin a transaction on this connection
    pub async fn begin(&self) -> Result<()> {
        if self.is_in_transaction() {
            return Err(PoolError::transaction("transaction already open"));
        }
        let mut inner = self.inner.lock().await;
        inner.begin().await?;
        self.in_transaction.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Commit the open transaction
    pub async fn commit(&self) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(PoolError::transaction("no open transaction"));
        }
        let mut inner = self.inner.lock().await;
        inner.commit().await?;
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Roll back the open transaction
    pub async fn rollback(&self) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(PoolError::transaction("no open transaction"));
        }
        let mut inner = self.inner.lock().await;
        inner.rollback().await?;
        self.in_transaction.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Resize the statement cache to this connection's share of the pool
    /// budget, deallocating evicted statements.
    pub async fn set_statement_capacity(&self, capacity: usize) {
        let evicted = {
            let mut cache = self.statements.lock().await;
            if cache.capacity() == capacity.max(1) {
                return;
            }
            cache.set_capacity(capacity)
        };
        if !evicted.is_empty() {
            let mut inner = self.inner.lock().await;
            for handle in evicted {
                let _ = inner.deallocate(&handle).await;
            }
        }
    }

    /// Number of statements currently cached
    pub async fn cached_statements(&self) -> usize {
        self.statements.lock().await.len()
    }

    /// Point-in-time summary for health reporting
    pub async fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id,
            age_secs: self.age().as_secs(),
            in_use: self.is_in_use(),
            in_transaction: self.is_in_transaction(),
            healthy: self.is_healthy(),
            acquisition_count: self.acquisition_count(),
            query_count: self.query_count(),
            last_error: self.last_error().await,
        }
    }
}

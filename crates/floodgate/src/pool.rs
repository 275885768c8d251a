//! Database connection pool orchestrator
//!
//! Ties the configuration, the pooled-connection wrapper, and the circuit
//! breaker together: acquisition and release, creation retry with backoff,
//! per-connection statement caching, DoS-guarding validation, idle cleanup,
//! and graceful drain.
//!
//! # Concurrency model
//!
//! The pool array sits behind one `tokio::sync::Mutex` guarding only the
//! brief scan/grow decision; connection I/O (pings, creation, statements)
//! happens outside the lock so a slow query never blocks other
//! acquisitions. Waiters park on a `Notify` that release signals, with a
//! 10 ms tick as fallback, all bounded by `wait_timeout`. Reuse is LIFO:
//! the scan starts from the end of the array, favoring warm connections.
//!
//! # Example
//!
//! ```rust,ignore
//! use floodgate::prelude::*;
//!
//! let config = PoolConfig::builder()
//!     .database("appdb")
//!     .username("app")
//!     .max_connections(10)
//!     .build()?;
//!
//! let pool = DatabasePool::new(config, Arc::new(PgDriver::new())).await?;
//! let rows = pool.query("SELECT * FROM users WHERE id = $1", &[Value::Int64(1)]).await?;
//! pool.drain(Duration::from_secs(30)).await?;
//! ```

use crate::breaker::{
    BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState, CoordinatedCircuitBreaker,
    LocalCircuitBreaker,
};
use crate::config::PoolConfig;
use crate::connection::{ConnectionSummary, PooledConnection};
use crate::driver::Driver;
use crate::error::{PoolError, Result};
use crate::metrics::{DistributedMetrics, MetricsSnapshot, PoolMetrics};
use crate::store::{FileStateStore, StateStore};
use crate::types::{Row, Value};
use crate::validation::QueryGuard;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

/// How often a parked waiter rechecks the pool when no release arrives
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How often drain rechecks for in-flight work
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Pool lifecycle states, monotonic and one-directional
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Serving acquisitions
    Active,
    /// Rejecting new acquisitions, waiting for in-flight work
    Draining,
    /// All connections closed
    Closed,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

const STATE_ACTIVE: u8 = 0;
const STATE_DRAINING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Point-in-time pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Lifecycle state
    pub state: PoolState,
    /// Connections currently in the pool
    pub size: usize,
    /// Idle connections
    pub idle: usize,
    /// Connections handed out
    pub in_use: usize,
    /// Connections with an open transaction
    pub in_transaction: usize,
    /// Configured maximum
    pub max_connections: usize,
    /// Configured minimum
    pub min_connections: usize,
    /// Prepared statements cached across all connections
    pub cached_statements: usize,
    /// Circuit breaker state and counters
    pub breaker: BreakerSnapshot,
    /// Cumulative pool counters
    pub metrics: MetricsSnapshot,
}

/// Health view consumed by liveness endpoints and ops tooling
#[derive(Debug, Clone)]
pub struct HealthSummary {
    /// Pool is active and the breaker is not open
    pub healthy: bool,
    /// Lifecycle state
    pub state: PoolState,
    /// Circuit breaker state
    pub breaker_state: CircuitState,
    /// Connections currently in the pool
    pub size: usize,
    /// Idle connections
    pub idle: usize,
    /// Connections handed out
    pub in_use: usize,
    /// Per-connection summaries
    pub connections: Vec<ConnectionSummary>,
}

impl HealthSummary {
    /// Render as JSON for health endpoints
    pub fn to_json(&self) -> String {
        serde_json::json!({
            "status": if self.healthy { "healthy" } else { "unhealthy" },
            "state": self.state.to_string(),
            "breaker": self.breaker_state.to_string(),
            "size": self.size,
            "idle": self.idle,
            "in_use": self.in_use,
            "connections": self.connections,
        })
        .to_string()
    }
}

/// Mutable pool state guarded by the pool mutex
struct PoolInner {
    /// Ordered connection array; the idle scan walks it back-to-front
    connections: Vec<Arc<PooledConnection>>,
    /// Creations reserved but not yet pushed, so concurrent growers never
    /// overshoot `max_connections`
    pending_creates: usize,
}

enum Checkout {
    Idle(Arc<PooledConnection>),
    Create,
    Wait,
}

/// Database connection pool with integrated circuit breaking
pub struct DatabasePool {
    config: PoolConfig,
    driver: Arc<dyn Driver>,
    breaker: Arc<dyn CircuitBreaker>,
    guard: QueryGuard,
    metrics: Arc<PoolMetrics>,
    distributed: Option<DistributedMetrics>,
    inner: Mutex<PoolInner>,
    state: AtomicU8,
    /// Signaled on release and eviction to wake parked waiters
    released: Notify,
}

impl DatabasePool {
    /// Create a pool, selecting the breaker implementation from the config:
    /// local when no shared store is configured, store-coordinated
    /// otherwise. Pre-populates `min_connections` eagerly; startup creation
    /// failures are logged, not fatal.
    pub async fn new(config: PoolConfig, driver: Arc<dyn Driver>) -> Result<Arc<Self>> {
        config.validate()?;

        let settings = BreakerSettings {
            failure_threshold: config.failure_threshold,
            recovery_time: config.recovery_time,
            half_open_success_threshold: config.half_open_success_threshold,
        };

        let (breaker, store): (Arc<dyn CircuitBreaker>, Option<Arc<dyn StateStore>>) =
            match &config.store {
                Some(store_config) => {
                    let store: Arc<dyn StateStore> =
                        Arc::new(FileStateStore::new(&store_config.directory).await?);
                    let breaker = CoordinatedCircuitBreaker::new(
                        settings,
                        Arc::clone(&store),
                        store_config.namespace(),
                    );
                    (Arc::new(breaker), Some(store))
                }
                None => (Arc::new(LocalCircuitBreaker::new(settings)), None),
            };

        Self::with_breaker_and_store(config, driver, breaker, store).await
    }

    /// Create a pool with an explicit breaker (and optional store for the
    /// distributed metrics collector). This is the construction-time seam
    /// the two breaker implementations share.
    pub async fn with_breaker_and_store(
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        breaker: Arc<dyn CircuitBreaker>,
        store: Option<Arc<dyn StateStore>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let distributed = match (&config.store, store) {
            (Some(store_config), Some(store)) => {
                Some(DistributedMetrics::new(store, store_config.namespace()))
            }
            _ => None,
        };

        let guard = QueryGuard::new(config.max_query_bytes, config.max_query_params);
        let metrics = Arc::new(PoolMetrics::new(
            &config.driver.to_string(),
            &config.database,
        ));

        let pool = Arc::new(Self {
            guard,
            metrics,
            distributed,
            breaker,
            driver,
            inner: Mutex::new(PoolInner {
                connections: Vec::with_capacity(config.max_connections),
                pending_creates: 0,
            }),
            state: AtomicU8::new(STATE_ACTIVE),
            released: Notify::new(),
            config,
        });

        let warmed = pool.warm().await;
        debug!(
            database = %pool.config.database,
            connections = warmed,
            "pool initialized"
        );
        Ok(pool)
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The active circuit breaker
    pub fn breaker(&self) -> &Arc<dyn CircuitBreaker> {
        &self.breaker
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        match self.state.load(Ordering::SeqCst) {
            STATE_DRAINING => PoolState::Draining,
            STATE_CLOSED => PoolState::Closed,
            _ => PoolState::Active,
        }
    }

    fn check_active(&self) -> Result<()> {
        match self.state() {
            PoolState::Active => Ok(()),
            PoolState::Draining => Err(PoolError::Draining),
            PoolState::Closed => Err(PoolError::Closed),
        }
    }

    /// Connection's share of the pool-wide statement budget
    fn statement_budget(&self, pool_size: usize) -> usize {
        let size = pool_size.max(1);
        self.config.statement_cache_size.div_ceil(size)
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    /// Acquire a connection.
    ///
    /// Fails fast with [`PoolError::Draining`]/[`PoolError::Closed`] when
    /// the pool is going away, [`PoolError::CircuitOpen`] when the breaker
    /// refuses, and [`PoolError::PoolExhausted`] when `wait_timeout`
    /// elapses without a connection becoming available.
    pub async fn acquire(&self) -> Result<Arc<PooledConnection>> {
        self.check_active()?;

        if !self.breaker.allow_request().await {
            let snapshot = self.breaker.snapshot().await;
            self.metrics.record_circuit_rejection();
            if let Some(distributed) = &self.distributed {
                distributed.incr("circuit_rejections", 1).await;
            }
            return Err(PoolError::CircuitOpen {
                failure_count: snapshot.failure_count,
                retry_after: snapshot.retry_after,
            });
        }

        let start = Instant::now();
        loop {
            self.check_active()?;

            if let Some(conn) = self.try_checkout().await? {
                let waited = start.elapsed();
                self.metrics.record_acquisition(waited);
                if let Some(distributed) = &self.distributed {
                    distributed.incr("acquisitions", 1).await;
                }
                return Ok(conn);
            }

            let waited = start.elapsed();
            if waited >= self.config.wait_timeout {
                self.metrics.record_exhausted();
                if let Some(distributed) = &self.distributed {
                    distributed.incr("exhaustions", 1).await;
                }
                return Err(PoolError::PoolExhausted {
                    max_connections: self.config.max_connections,
                    waited,
                });
            }

            // Park until a release signals or the tick fires, whichever
            // comes first; the loop re-checks the deadline either way.
            let tick = ACQUIRE_POLL_INTERVAL.min(self.config.wait_timeout - waited);
            tokio::select! {
                _ = self.released.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    /// One pass over the pool: reuse an idle connection, grow, or report
    /// that the caller has to wait.
    async fn try_checkout(&self) -> Result<Option<Arc<PooledConnection>>> {
        loop {
            let decision = {
                let mut inner = self.inner.lock().await;

                // LIFO: most recently added first, for warm-cache locality
                let found = inner
                    .connections
                    .iter()
                    .rev()
                    .find(|conn| conn.is_available() && conn.try_acquire())
                    .cloned();

                match found {
                    Some(conn) => Checkout::Idle(conn),
                    None if inner.connections.len() + inner.pending_creates
                        < self.config.max_connections =>
                    {
                        inner.pending_creates += 1;
                        Checkout::Create
                    }
                    None => Checkout::Wait,
                }
            };

            match decision {
                Checkout::Idle(conn) => {
                    if self.needs_validation(&conn) && !conn.ping().await {
                        self.metrics.record_ping_failure();
                        warn!(connection = %conn.id(), "validation failed, evicting");
                        self.evict(&conn).await;
                        // Keep scanning for another candidate
                        continue;
                    }
                    return Ok(Some(conn));
                }
                Checkout::Create => {
                    let created = self.create_connection_with_retry().await;
                    let mut inner = self.inner.lock().await;
                    inner.pending_creates -= 1;
                    match created {
                        Ok(conn) => {
                            // Mark in-use before publishing: the new
                            // connection goes to this caller, not back into
                            // the idle set for another waiter to steal.
                            conn.try_acquire();
                            inner.connections.push(Arc::clone(&conn));
                            let size = inner.connections.len();
                            drop(inner);
                            self.metrics.record_pool_size(size, 0);
                            self.rebalance_statement_caches().await;
                            return Ok(Some(conn));
                        }
                        Err(e) => return Err(e),
                    }
                }
                Checkout::Wait => return Ok(None),
            }
        }
    }

    fn needs_validation(&self, conn: &PooledConnection) -> bool {
        if self.config.validate_on_acquire {
            return true;
        }
        conn.validation_age() > self.config.validation_interval
    }

    /// Open a new connection, retrying transient failures with exponential
    /// backoff. Every failed attempt is recorded against the breaker;
    /// non-retriable kinds (authentication, configuration) skip the retry
    /// loop entirely.
    async fn create_connection_with_retry(&self) -> Result<Arc<PooledConnection>> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.driver.connect(&self.config).await {
                Ok(raw) => {
                    self.metrics.record_created();
                    if let Some(distributed) = &self.distributed {
                        distributed.incr("connections_created", 1).await;
                    }
                    let budget = {
                        let inner = self.inner.lock().await;
                        self.statement_budget(inner.connections.len() + 1)
                    };
                    debug!(attempt, "opened new connection");
                    return Ok(Arc::new(PooledConnection::new(raw, budget)));
                }
                Err(e) => {
                    self.breaker.record_failure().await;
                    self.metrics.record_connection_failure();
                    if let Some(distributed) = &self.distributed {
                        distributed.incr("connection_failures", 1).await;
                    }

                    if !e.is_retriable() || attempt > self.config.retry_attempts {
                        warn!(attempt, error = %e, "connection attempt failed, giving up");
                        return Err(e);
                    }

                    let delay = backoff_delay(
                        self.config.retry_base_delay,
                        self.config.retry_max_delay,
                        attempt,
                    );
                    debug!(attempt, ?delay, error = %e, "connection attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // ========================================================================
    // Release and eviction
    // ========================================================================

    /// Return a connection to the pool.
    ///
    /// A connection whose abandoned transaction cannot be rolled back is
    /// evicted entirely rather than returned, and the error propagates.
    pub async fn release(&self, conn: &Arc<PooledConnection>) -> Result<()> {
        match conn.release().await {
            Ok(()) => {
                self.released.notify_one();
                Ok(())
            }
            Err(e) => {
                warn!(connection = %conn.id(), error = %e, "rollback on release failed, evicting");
                self.evict(conn).await;
                Err(e)
            }
        }
    }

    /// Remove a connection from the pool and close it
    async fn evict(&self, conn: &Arc<PooledConnection>) {
        let size = {
            let mut inner = self.inner.lock().await;
            inner.connections.retain(|c| c.id() != conn.id());
            inner.connections.len()
        };
        conn.close().await;
        self.metrics.record_closed();
        if let Some(distributed) = &self.distributed {
            distributed.incr("connections_closed", 1).await;
        }
        self.metrics.record_pool_size(size, 0);
        // Capacity freed: a parked waiter may now grow the pool
        self.released.notify_one();
    }

    /// Recompute every connection's share of the statement budget
    async fn rebalance_statement_caches(&self) {
        let (connections, budget) = {
            let inner = self.inner.lock().await;
            (
                inner.connections.clone(),
                self.statement_budget(inner.connections.len()),
            )
        };
        for conn in connections {
            conn.set_statement_capacity(budget).await;
        }
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Run a statement that returns rows.
    ///
    /// The DoS guard runs before the breaker, the pool lock, or the
    /// network is touched. Breaker success is recorded only after the
    /// statement itself succeeds; acquiring a healthy connection and then
    /// failing the query still counts as a failure.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.validate_request(sql, params)?;

        let conn = self.acquire().await?;
        let start = Instant::now();
        let result = conn.query(sql, params).await;
        let outcome = self.finish_statement(&conn, sql, start.elapsed(), result).await;

        if let Err(e) = self.release(&conn).await {
            warn!(connection = %conn.id(), error = %e, "release after query failed");
        }
        outcome
    }

    /// Run a statement that modifies data, returning the affected-row count
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.validate_request(sql, params)?;

        let conn = self.acquire().await?;
        let start = Instant::now();
        let result = conn.execute(sql, params).await;
        let outcome = self.finish_statement(&conn, sql, start.elapsed(), result).await;

        if let Err(e) = self.release(&conn).await {
            warn!(connection = %conn.id(), error = %e, "release after execute failed");
        }
        outcome
    }

    fn validate_request(&self, sql: &str, params: &[Value]) -> Result<()> {
        self.guard.validate(sql, params).map_err(|e| {
            self.metrics.record_validation_failure();
            e
        })
    }

    /// Record timing, slow classification, metrics, and the breaker verdict
    /// for one finished statement.
    async fn finish_statement<T>(
        &self,
        conn: &PooledConnection,
        sql: &str,
        elapsed: Duration,
        result: Result<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                conn.record_query(elapsed);
                let slow = elapsed > self.config.slow_query_threshold;
                if slow {
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        sql = sql_preview(sql),
                        "slow query"
                    );
                }
                self.metrics.record_query(elapsed, slow);
                if let Some(distributed) = &self.distributed {
                    distributed.incr("queries", 1).await;
                    if slow {
                        distributed.incr("slow_queries", 1).await;
                    }
                }
                self.breaker.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.metrics.record_query_error();
                if let Some(distributed) = &self.distributed {
                    distributed.incr("query_errors", 1).await;
                }
                self.breaker.record_failure().await;
                if matches!(e, PoolError::Connection { .. }) {
                    conn.mark_unhealthy(&e.to_string()).await;
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Run `f` inside a transaction on a dedicated connection: commit and
    /// release on success, roll back, release, and rethrow on error.
    pub async fn transaction<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<PooledConnection>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let conn = self.begin_transaction().await?;
        match f(Arc::clone(&conn)).await {
            Ok(value) => {
                self.commit(&conn).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(&conn).await {
                    warn!(
                        connection = %conn.id(),
                        error = %rollback_err,
                        "rollback after failed transaction also failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Acquire a dedicated connection with a transaction already open.
    /// Pair with [`DatabasePool::commit`] or [`DatabasePool::rollback`].
    pub async fn begin_transaction(&self) -> Result<Arc<PooledConnection>> {
        let conn = self.acquire().await?;
        if let Err(e) = conn.begin().await {
            let _ = self.release(&conn).await;
            return Err(e);
        }
        Ok(conn)
    }

    /// Commit the transaction on a connection from
    /// [`DatabasePool::begin_transaction`] and return it to the pool. A
    /// failed commit leaves the transactional state unknown, so the
    /// connection is evicted.
    pub async fn commit(&self, conn: &Arc<PooledConnection>) -> Result<()> {
        match conn.commit().await {
            Ok(()) => self.release(conn).await,
            Err(e) => {
                conn.mark_unhealthy(&e.to_string()).await;
                self.evict(conn).await;
                Err(e)
            }
        }
    }

    /// Roll back the transaction and return the connection to the pool.
    /// Rollback failures evict the connection and propagate, since a session
    /// with possibly-corrupted transactional state is never reused.
    pub async fn rollback(&self, conn: &Arc<PooledConnection>) -> Result<()> {
        match conn.rollback().await {
            Ok(()) => self.release(conn).await,
            Err(e) => {
                conn.mark_unhealthy(&e.to_string()).await;
                self.evict(conn).await;
                Err(e)
            }
        }
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Pre-populate the pool up to `min_connections`. Creation failures are
    /// logged and stop the warm-up; the pool still serves on-demand growth.
    pub async fn warm(&self) -> usize {
        let mut created = 0;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.connections.len() + inner.pending_creates
                    >= self.config.min_connections
                {
                    break;
                }
                inner.pending_creates += 1;
            }

            let result = self.create_connection_with_retry().await;
            let mut inner = self.inner.lock().await;
            inner.pending_creates -= 1;
            match result {
                Ok(conn) => {
                    inner.connections.push(conn);
                    created += 1;
                }
                Err(e) => {
                    warn!(error = %e, "warm-up connection failed");
                    break;
                }
            }
        }
        created
    }

    /// Evict idle connections past `idle_timeout` and connections flagged
    /// for refresh, never dropping the pool below `min_connections`.
    /// Returns the number evicted. Intended for a periodic scheduler.
    pub async fn cleanup_idle_connections(&self) -> usize {
        let victims = {
            let mut inner = self.inner.lock().await;
            let mut remaining = inner.connections.len() + inner.pending_creates;
            let mut victims = Vec::new();

            for conn in inner.connections.iter() {
                if remaining <= self.config.min_connections {
                    break;
                }
                if conn.is_in_use() {
                    continue;
                }

                let idle_expired = conn
                    .idle_time()
                    .is_some_and(|idle| idle > self.config.idle_timeout);
                if !idle_expired && !conn.should_refresh(self.config.max_lifetime) {
                    continue;
                }

                // Claim healthy candidates through the normal CAS so a
                // racing acquire cannot end up with a closing connection;
                // unhealthy ones are unacquirable and safe to take as-is.
                if conn.try_acquire() || !conn.is_healthy() {
                    victims.push(Arc::clone(conn));
                    remaining -= 1;
                }
            }

            inner
                .connections
                .retain(|c| !victims.iter().any(|v| v.id() == c.id()));
            victims
        };

        for conn in &victims {
            debug!(connection = %conn.id(), age_secs = conn.age().as_secs(), "evicting idle connection");
            conn.close().await;
            self.metrics.record_closed();
            if let Some(distributed) = &self.distributed {
                distributed.incr("connections_closed", 1).await;
            }
        }

        if !victims.is_empty() {
            self.rebalance_statement_caches().await;
            self.released.notify_one();
        }
        victims.len()
    }

    // ========================================================================
    // Drain and shutdown
    // ========================================================================

    /// Graceful shutdown: stop admitting new work (the breaker is forced
    /// open, acquisitions fail fast), wait for in-flight connections to be
    /// released and transactions to finish, then close everything.
    ///
    /// On timeout the pool force-closes anyway, logging every connection
    /// that still had an uncommitted transaction, and returns
    /// [`PoolError::DrainTimeout`].
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let _ = self.state.compare_exchange(
            STATE_ACTIVE,
            STATE_DRAINING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.breaker.force_open().await;
        info!(database = %self.config.database, "draining pool");

        let deadline = Instant::now() + timeout;
        loop {
            let busy = {
                let inner = self.inner.lock().await;
                inner
                    .connections
                    .iter()
                    .filter(|c| c.is_in_use() || c.is_in_transaction())
                    .count()
            };

            if busy == 0 {
                self.shutdown().await;
                info!(database = %self.config.database, "drain complete");
                return Ok(());
            }

            if Instant::now() >= deadline {
                let still_in_transaction = {
                    let inner = self.inner.lock().await;
                    inner
                        .connections
                        .iter()
                        .filter(|c| c.is_in_transaction())
                        .map(|c| {
                            warn!(
                                connection = %c.id(),
                                "force-closing connection with an uncommitted transaction; possible data loss"
                            );
                        })
                        .count()
                };
                self.shutdown().await;
                return Err(PoolError::DrainTimeout {
                    still_in_transaction,
                });
            }

            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Close every connection and clear all statement caches. Idempotent.
    pub async fn shutdown(&self) {
        if self.state.swap(STATE_CLOSED, Ordering::SeqCst) == STATE_CLOSED {
            return;
        }

        let connections = {
            let mut inner = self.inner.lock().await;
            std::mem::take(&mut inner.connections)
        };
        for conn in &connections {
            conn.close().await;
            self.metrics.record_closed();
        }
        self.metrics.record_pool_size(0, 0);
        // Wake every parked waiter so they observe the closed state
        self.released.notify_waiters();
        info!(database = %self.config.database, closed = connections.len(), "pool shut down");
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Point-in-time pool statistics
    pub async fn stats(&self) -> PoolStats {
        let (connections, size) = {
            let inner = self.inner.lock().await;
            (inner.connections.clone(), inner.connections.len())
        };

        let in_use = connections.iter().filter(|c| c.is_in_use()).count();
        let in_transaction = connections.iter().filter(|c| c.is_in_transaction()).count();
        let mut cached_statements = 0;
        for conn in &connections {
            cached_statements += conn.cached_statements().await;
        }

        self.metrics.record_pool_size(size, in_use);

        PoolStats {
            state: self.state(),
            size,
            idle: size - in_use,
            in_use,
            in_transaction,
            max_connections: self.config.max_connections,
            min_connections: self.config.min_connections,
            cached_statements,
            breaker: self.breaker.snapshot().await,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Health view: pool state, breaker state, per-connection summaries
    pub async fn health_summary(&self) -> HealthSummary {
        let connections = {
            let inner = self.inner.lock().await;
            inner.connections.clone()
        };

        let mut summaries = Vec::with_capacity(connections.len());
        for conn in &connections {
            summaries.push(conn.summary().await);
        }

        let breaker_state = self.breaker.snapshot().await.state;
        let in_use = summaries.iter().filter(|s| s.in_use).count();

        HealthSummary {
            healthy: self.state() == PoolState::Active && breaker_state != CircuitState::Open,
            state: self.state(),
            breaker_state,
            size: summaries.len(),
            idle: summaries.len() - in_use,
            in_use,
            connections: summaries,
        }
    }

    /// Aggregate metrics across all pool instances sharing the store;
    /// `None` when no store is configured
    pub async fn distributed_metrics(&self) -> Option<MetricsSnapshot> {
        match &self.distributed {
            Some(distributed) => Some(distributed.aggregate().await),
            None => None,
        }
    }

    /// Administrative override: close the breaker and clear its counters
    pub async fn reset_circuit_breaker(&self) {
        self.breaker.reset().await;
        info!(database = %self.config.database, "circuit breaker reset");
    }
}

/// Exponential backoff with a deterministic jitter of up to 10%
fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let backoff = base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
        .min(max);
    // Golden-ratio jitter: spread without an RNG, reproducible in tests
    let fraction = (f64::from(attempt) * 0.618_033_988_749_895) % 1.0;
    let jitter = backoff.as_secs_f64() * 0.10 * fraction;
    backoff + Duration::from_secs_f64(jitter)
}

/// First 120 chars of the SQL, for slow-query logs
fn sql_preview(sql: &str) -> &str {
    match sql.char_indices().nth(120) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverKind, PoolConfig};
    use crate::driver::{StubDriver, StubState};
    use std::sync::atomic::Ordering as AtomicOrdering;

    fn test_config() -> crate::config::PoolConfigBuilder {
        PoolConfig::builder()
            .driver(DriverKind::Postgres)
            .database("testdb")
            .username("tester")
            .min_connections(0)
            .max_connections(4)
            .wait_timeout(Duration::from_millis(200))
            .retry_attempts(0)
            .retry_base_delay(Duration::from_millis(1))
            .validation_interval(Duration::from_secs(60))
            .idle_timeout(Duration::from_secs(60))
            .max_lifetime(Duration::from_secs(120))
    }

    async fn stub_pool(
        builder: crate::config::PoolConfigBuilder,
    ) -> (Arc<DatabasePool>, Arc<StubState>) {
        let driver = Arc::new(StubDriver::new());
        let state = driver.state();
        let pool = DatabasePool::new(builder.build().unwrap(), driver)
            .await
            .unwrap();
        (pool, state)
    }

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let (pool, state) = stub_pool(test_config()).await;

        let conn = pool.acquire().await.unwrap();
        let first_id = conn.id();
        pool.release(&conn).await.unwrap();

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.id(), first_id);
        assert_eq!(state.connects.load(AtomicOrdering::SeqCst), 1);
        pool.release(&conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_lifo_reuse_prefers_most_recent() {
        let (pool, _) = stub_pool(test_config().min_connections(2)).await;

        let stats = pool.stats().await;
        assert_eq!(stats.size, 2);

        // The scan starts from the end of the array, so the first
        // acquisition takes the most recently added connection
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        pool.release(&second).await.unwrap();
        pool.release(&first).await.unwrap();

        let next = pool.acquire().await.unwrap();
        assert_eq!(next.id(), first.id());
        pool.release(&next).await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_max() {
        let (pool, state) = stub_pool(test_config().max_connections(2)).await;

        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        assert_ne!(a.id(), b.id());

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { max_connections: 2, .. }));
        assert_eq!(state.connects.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(pool.stats().await.size, 2);

        pool.release(&a).await.unwrap();
        pool.release(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_woken_by_release() {
        let (pool, _) = stub_pool(test_config().max_connections(1).wait_timeout(Duration::from_secs(2))).await;

        let conn = pool.acquire().await.unwrap();
        let waiter_pool = Arc::clone(&pool);
        let waiter = tokio::spawn(async move {
            let started = Instant::now();
            let conn = waiter_pool.acquire().await.unwrap();
            waiter_pool.release(&conn).await.unwrap();
            started.elapsed()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(&conn).await.unwrap();

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(1), "waited {waited:?}");
    }

    #[tokio::test]
    async fn test_creation_retries_with_backoff() {
        let (pool, state) = stub_pool(test_config().retry_attempts(3)).await;
        state.fail_connects.store(2, AtomicOrdering::SeqCst);

        let conn = pool.acquire().await.unwrap();
        assert_eq!(state.connect_attempts.load(AtomicOrdering::SeqCst), 3);

        // Both failed attempts were held against the breaker
        let snap = pool.breaker().snapshot().await;
        assert_eq!(snap.total_failures, 2);
        assert_eq!(snap.state, CircuitState::Closed);
        pool.release(&conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_skips_retry() {
        let (pool, state) = stub_pool(test_config().retry_attempts(5)).await;
        state.auth_fail.store(true, AtomicOrdering::SeqCst);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Authentication { .. }));
        // One attempt, no retries for fatal kinds
        assert_eq!(state.connect_attempts.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_creation_failures() {
        let (pool, state) = stub_pool(test_config().failure_threshold(2)).await;
        state.fail_connects.store(10, AtomicOrdering::SeqCst);

        assert!(pool.acquire().await.is_err());
        assert!(pool.acquire().await.is_err());

        // Breaker is now open: rejected before any connect attempt
        let attempts_before = state.connect_attempts.load(AtomicOrdering::SeqCst);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen { .. }));
        assert_eq!(
            state.connect_attempts.load(AtomicOrdering::SeqCst),
            attempts_before
        );
    }

    #[tokio::test]
    async fn test_query_validation_never_touches_pool() {
        let (pool, state) = stub_pool(test_config().max_query_bytes(16)).await;

        let err = pool
            .query("SELECT 'this text is far past sixteen bytes'", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::QueryValidation { .. }));
        assert_eq!(state.connect_attempts.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(pool.stats().await.metrics.validation_failures, 1);
    }

    #[tokio::test]
    async fn test_query_success_records_breaker_success() {
        let (pool, _) = stub_pool(test_config()).await;

        let rows = pool.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);

        let snap = pool.breaker().snapshot().await;
        assert_eq!(snap.total_successes, 1);
        assert_eq!(pool.stats().await.metrics.queries, 1);
    }

    #[tokio::test]
    async fn test_query_failure_counts_against_breaker() {
        let (pool, state) = stub_pool(test_config()).await;
        state.fail_next_query.store(true, AtomicOrdering::SeqCst);

        let err = pool.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, PoolError::Query { .. }));

        let snap = pool.breaker().snapshot().await;
        assert_eq!(snap.total_failures, 1);
        assert_eq!(snap.total_successes, 0);
        assert_eq!(pool.stats().await.metrics.query_errors, 1);

        // The connection went back to the pool
        assert_eq!(pool.stats().await.idle, 1);
    }

    #[tokio::test]
    async fn test_statement_cache_reuse_through_pool() {
        let (pool, state) = stub_pool(test_config().max_connections(1)).await;

        pool.query("SELECT 1", &[]).await.unwrap();
        pool.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(state.prepares.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(state.executions.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_returns_affected_rows() {
        let (pool, _) = stub_pool(test_config()).await;
        let affected = pool
            .execute("UPDATE users SET active = $1", &[Value::Bool(true)])
            .await
            .unwrap();
        assert_eq!(affected, 1);
    }

    #[tokio::test]
    async fn test_transaction_commits_and_releases() {
        let (pool, state) = stub_pool(test_config()).await;

        let value = pool
            .transaction(|conn| async move {
                conn.execute("INSERT INTO t VALUES (1)", &[]).await?;
                Ok(42)
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(state.commits.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(state.rollbacks.load(AtomicOrdering::SeqCst), 0);
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.in_transaction, 0);
    }

    #[tokio::test]
    async fn test_transaction_error_rolls_back_and_rethrows() {
        let (pool, state) = stub_pool(test_config()).await;

        let err = pool
            .transaction(|_conn| async move {
                Err::<(), _>(PoolError::query("constraint violated"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Query { .. }));
        assert_eq!(state.rollbacks.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(state.commits.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(pool.stats().await.in_use, 0);
    }

    #[tokio::test]
    async fn test_release_rollback_failure_evicts() {
        let (pool, state) = stub_pool(test_config()).await;

        let conn = pool.begin_transaction().await.unwrap();
        state.fail_rollback.store(true, AtomicOrdering::SeqCst);

        let err = pool.release(&conn).await.unwrap_err();
        assert!(matches!(err, PoolError::Transaction { .. }));
        assert_eq!(pool.stats().await.size, 0);
        assert_eq!(state.closes.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_ping_evicts_and_creates_fresh() {
        let (pool, state) = stub_pool(test_config().validate_on_acquire(true)).await;

        let conn = pool.acquire().await.unwrap();
        let stale_id = conn.id();
        pool.release(&conn).await.unwrap();

        // The stale connection fails its probe; a freshly created one
        // replaces it (new connections are not re-pinged at creation)
        state.fail_pings.store(true, AtomicOrdering::SeqCst);
        let result = pool.acquire().await;
        state.fail_pings.store(false, AtomicOrdering::SeqCst);

        let conn = result.unwrap();
        assert_ne!(conn.id(), stale_id);
        assert_eq!(pool.stats().await.metrics.ping_failures, 1);
        pool.release(&conn).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_respects_min_connections() {
        let (pool, _) = stub_pool(
            test_config()
                .min_connections(1)
                .max_connections(4)
                .idle_timeout(Duration::from_millis(1))
                .validation_interval(Duration::from_millis(1))
                .max_lifetime(Duration::from_secs(120)),
        )
        .await;

        // Grow to 3 connections
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        pool.release(&a).await.unwrap();
        pool.release(&b).await.unwrap();
        pool.release(&c).await.unwrap();
        assert_eq!(pool.stats().await.size, 3);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let evicted = pool.cleanup_idle_connections().await;
        assert_eq!(evicted, 2);
        assert_eq!(pool.stats().await.size, 1);
    }

    #[tokio::test]
    async fn test_cleanup_skips_in_use_connections() {
        let (pool, _) = stub_pool(
            test_config()
                .min_connections(0)
                .idle_timeout(Duration::from_millis(1))
                .validation_interval(Duration::from_millis(1)),
        )
        .await;

        let held = pool.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(pool.cleanup_idle_connections().await, 0);
        assert_eq!(pool.stats().await.size, 1);
        pool.release(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_waits_for_inflight_work() {
        let (pool, _) = stub_pool(test_config()).await;

        let conn = pool.begin_transaction().await.unwrap();
        let worker_pool = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            worker_pool.commit(&conn).await.unwrap();
        });

        pool.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(pool.state(), PoolState::Closed);
        assert_eq!(pool.stats().await.size, 0);
    }

    #[tokio::test]
    async fn test_drain_rejects_new_acquires() {
        let (pool, _) = stub_pool(test_config()).await;

        let held = pool.acquire().await.unwrap();
        let drain_pool = Arc::clone(&pool);
        let drain = tokio::spawn(async move { drain_pool.drain(Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = pool.acquire().await.unwrap_err();
        assert!(
            matches!(err, PoolError::Draining | PoolError::CircuitOpen { .. }),
            "unexpected error: {err}"
        );

        pool.release(&held).await.unwrap();
        drain.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_drain_timeout_reports_open_transactions() {
        let (pool, _) = stub_pool(test_config()).await;

        let _conn = pool.begin_transaction().await.unwrap();
        let err = pool.drain(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(
            err,
            PoolError::DrainTimeout {
                still_in_transaction: 1
            }
        ));
        assert_eq!(pool.state(), PoolState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (pool, state) = stub_pool(test_config().min_connections(2)).await;

        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Closed);
        assert_eq!(state.closes.load(AtomicOrdering::SeqCst), 2);
        assert!(matches!(pool.acquire().await.unwrap_err(), PoolError::Closed));
    }

    #[tokio::test]
    async fn test_stats_and_health_summary() {
        let (pool, _) = stub_pool(test_config().min_connections(2)).await;

        let held = pool.acquire().await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.size, 2);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.max_connections, 4);
        assert_eq!(stats.breaker.state, CircuitState::Closed);

        let health = pool.health_summary().await;
        assert!(health.healthy);
        assert_eq!(health.connections.len(), 2);
        let json = health.to_json();
        assert!(json.contains("\"status\":\"healthy\""));
        assert!(json.contains("\"breaker\":\"closed\""));

        pool.release(&held).await.unwrap();
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_breaker_open() {
        let (pool, _) = stub_pool(test_config()).await;

        pool.breaker().force_open().await;
        let health = pool.health_summary().await;
        assert!(!health.healthy);
        assert_eq!(health.breaker_state, CircuitState::Open);

        pool.reset_circuit_breaker().await;
        assert!(pool.health_summary().await.healthy);
    }

    #[test]
    fn test_backoff_delay_shape() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);

        // Doubling with a bounded jitter of at most 10%
        for attempt in 1..=6u32 {
            let expected = base
                .saturating_mul(2u32.saturating_pow(attempt - 1))
                .min(max);
            let delay = backoff_delay(base, max, attempt);
            assert!(delay >= expected, "attempt {attempt}: {delay:?} < {expected:?}");
            assert!(
                delay <= expected.mul_f64(1.10) + Duration::from_millis(1),
                "attempt {attempt}: {delay:?} too large"
            );
        }

        // Capped at max (plus jitter)
        assert!(backoff_delay(base, max, 20) <= max.mul_f64(1.10) + Duration::from_millis(1));
    }

    #[test]
    fn test_sql_preview_truncates() {
        let long = "SELECT ".repeat(60);
        assert_eq!(sql_preview(&long).len(), 120);
        assert_eq!(sql_preview("SELECT 1"), "SELECT 1");
    }
}

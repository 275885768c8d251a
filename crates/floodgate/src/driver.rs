//! Driver abstraction for floodgate
//!
//! The pool is driver-agnostic: everything that touches the wire lives
//! behind [`Driver`] (connection factory) and [`DriverConnection`] (one live
//! session). Production deployments plug in a real driver; the in-memory
//! [`StubDriver`] ships in-tree for tests and examples, with injectable
//! failures for every path the pool has to survive.

use crate::config::{DriverKind, PoolConfig};
use crate::error::{PoolError, Result};
use crate::types::{Row, Value};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Handle to a statement prepared on one specific connection.
///
/// Handles are only meaningful on the connection that prepared them; the
/// statement cache enforces that by living inside the connection wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementHandle {
    /// Driver-assigned statement id
    pub id: u64,
    /// The SQL text the statement was prepared from
    pub sql: String,
}

/// Factory for driver connections
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a new connection using the rendered connection target
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn DriverConnection>>;

    /// Which database this driver speaks to
    fn kind(&self) -> DriverKind;
}

/// One live database session
#[async_trait]
pub trait DriverConnection: Send {
    /// Prepare a statement for repeated execution
    async fn prepare(&mut self, sql: &str) -> Result<StatementHandle>;

    /// Run a prepared statement that returns rows
    async fn query(&mut self, statement: &StatementHandle, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a prepared statement that modifies data, returning affected rows
    async fn execute(&mut self, statement: &StatementHandle, params: &[Value]) -> Result<u64>;

    /// Discard a prepared statement (cache eviction)
    async fn deallocate(&mut self, statement: &StatementHandle) -> Result<()>;

    /// Begin a transaction
    async fn begin(&mut self) -> Result<()>;

    /// Commit the open transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction
    async fn rollback(&mut self) -> Result<()>;

    /// Minimal liveness round-trip
    async fn ping(&mut self) -> Result<()>;

    /// Close the session; must be safe to call more than once
    async fn close(&mut self) -> Result<()>;
}

// ============================================================================
// Stub driver (tests and examples)
// ============================================================================

/// Shared, injectable behavior for [`StubDriver`] connections.
///
/// Counters are plain atomics so tests can assert on them without locking.
#[derive(Debug, Default)]
pub struct StubState {
    /// Fail the next N connect attempts with a retriable connection error
    pub fail_connects: AtomicU32,
    /// Fail all connect attempts with an authentication error (fatal)
    pub auth_fail: AtomicBool,
    /// Make every ping fail until cleared
    pub fail_pings: AtomicBool,
    /// Fail the next query/execute with a query error
    pub fail_next_query: AtomicBool,
    /// Make rollback fail (exercises the eviction path)
    pub fail_rollback: AtomicBool,

    /// Total connect attempts (successful or not)
    pub connect_attempts: AtomicU64,
    /// Connections successfully opened
    pub connects: AtomicU64,
    /// Statements prepared across all connections
    pub prepares: AtomicU64,
    /// Statements executed across all connections
    pub executions: AtomicU64,
    /// Pings issued across all connections
    pub pings: AtomicU64,
    /// Rollbacks issued across all connections
    pub rollbacks: AtomicU64,
    /// Commits issued across all connections
    pub commits: AtomicU64,
    /// Connections closed
    pub closes: AtomicU64,
}

/// In-memory driver for tests: no I/O, injectable failures
#[derive(Debug, Default)]
pub struct StubDriver {
    state: Arc<StubState>,
}

impl StubDriver {
    /// Create a stub driver
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared state handle for failure injection and counters
    pub fn state(&self) -> Arc<StubState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Driver for StubDriver {
    async fn connect(&self, config: &PoolConfig) -> Result<Box<dyn DriverConnection>> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.state.auth_fail.load(Ordering::SeqCst) {
            return Err(PoolError::authentication(format!(
                "password authentication failed for user \"{}\"",
                config.username
            )));
        }

        let remaining = self.state.fail_connects.load(Ordering::SeqCst);
        if remaining > 0 {
            self.state.fail_connects.store(remaining - 1, Ordering::SeqCst);
            return Err(PoolError::connection(format!(
                "connection refused: {}:{}",
                config.host, config.port
            )));
        }

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubConnection {
            state: Arc::clone(&self.state),
            next_statement_id: 1,
            in_transaction: false,
            closed: false,
        }))
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Postgres
    }
}

/// A stub session: records activity, returns a single canned row
pub struct StubConnection {
    state: Arc<StubState>,
    next_statement_id: u64,
    in_transaction: bool,
    closed: bool,
}

impl StubConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(PoolError::connection("connection is closed"));
        }
        Ok(())
    }

    fn check_query_failure(&self) -> Result<()> {
        if self
            .state
            .fail_next_query
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return Err(PoolError::query("simulated backend failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for StubConnection {
    async fn prepare(&mut self, sql: &str) -> Result<StatementHandle> {
        self.check_open()?;
        self.state.prepares.fetch_add(1, Ordering::SeqCst);
        let id = self.next_statement_id;
        self.next_statement_id += 1;
        Ok(StatementHandle {
            id,
            sql: sql.to_string(),
        })
    }

    async fn query(&mut self, statement: &StatementHandle, params: &[Value]) -> Result<Vec<Row>> {
        self.check_open()?;
        self.check_query_failure()?;
        self.state.executions.fetch_add(1, Ordering::SeqCst);

        let mut row = Row::new();
        row.push("statement_id", Value::Int64(statement.id as i64));
        row.push("param_count", Value::Int64(params.len() as i64));
        Ok(vec![row])
    }

    async fn execute(&mut self, _statement: &StatementHandle, _params: &[Value]) -> Result<u64> {
        self.check_open()?;
        self.check_query_failure()?;
        self.state.executions.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn deallocate(&mut self, _statement: &StatementHandle) -> Result<()> {
        self.check_open()
    }

    async fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if self.in_transaction {
            return Err(PoolError::transaction("transaction already open"));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.in_transaction {
            return Err(PoolError::transaction("no open transaction"));
        }
        self.in_transaction = false;
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        if self.state.fail_rollback.load(Ordering::SeqCst) {
            return Err(PoolError::transaction("rollback failed: connection lost"));
        }
        self.in_transaction = false;
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_open()?;
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_pings.load(Ordering::SeqCst) {
            return Err(PoolError::connection("ping failed"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

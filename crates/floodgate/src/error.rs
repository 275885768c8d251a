//! Error types for floodgate
//!
//! Provides granular error classification for proper retry handling:
//! - Retriable errors (connection, timeout, deadlock)
//! - Non-retriable errors (authentication, validation, query execution)
//!
//! Retry decisions are driven by the error *kind*, never by matching on
//! message text, so the retry loop in the pool is exhaustive and testable.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for floodgate operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Error categories for classification and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection establishment or loss (retriable)
    Connection,
    /// Query execution errors (not retriable: statements may not be idempotent)
    Query,
    /// Transaction begin/commit/rollback errors
    Transaction,
    /// Operation timed out (retriable)
    Timeout,
    /// Database deadlock (retriable)
    Deadlock,
    /// Authentication failure (never retried)
    Authentication,
    /// Invalid configuration, fatal at construction
    Configuration,
    /// Request rejected by the DoS guard before touching the pool
    Validation,
    /// Circuit breaker refused the request
    CircuitOpen,
    /// Waited past `wait_timeout` for a free connection
    PoolExhausted,
    /// Pool is draining or closed
    Unavailable,
    /// Shared state store failure
    Store,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Deadlock)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Transaction => "transaction",
            Self::Timeout => "timeout",
            Self::Deadlock => "deadlock",
            Self::Authentication => "authentication",
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::PoolExhausted => "pool_exhausted",
            Self::Unavailable => "unavailable",
            Self::Store => "store",
            Self::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Main error type for floodgate
#[derive(Error, Debug)]
pub enum PoolError {
    /// Invalid pool configuration; reports every violated rule at once
    #[error("configuration error: {}", violations.join("; "))]
    Configuration {
        /// Every violated validation rule
        violations: Vec<String>,
    },

    /// Circuit breaker is open; the backend is considered unavailable
    #[error("circuit open: {failure_count} consecutive failures, next probe in {retry_after:?}")]
    CircuitOpen {
        /// Failure count that tripped (or is currently held against) the breaker
        failure_count: u64,
        /// Time until the breaker will admit a probe request
        retry_after: Duration,
    },

    /// Waited past `wait_timeout` without a connection becoming available
    #[error("pool exhausted: all {max_connections} connections busy after waiting {waited:?}")]
    PoolExhausted {
        /// Configured maximum pool size
        max_connections: usize,
        /// How long the caller waited
        waited: Duration,
    },

    /// Request rejected by the DoS guard before any connection was touched
    #[error("query validation failed: {reason}")]
    QueryValidation {
        /// Which limit was violated
        reason: String,
    },

    /// Connection establishment or loss
    #[error("connection error: {message}")]
    Connection {
        /// Driver-reported detail
        message: String,
    },

    /// Authentication rejected by the backend
    #[error("authentication failed: {message}")]
    Authentication {
        /// Backend-reported detail
        message: String,
    },

    /// Query execution failed
    #[error("query error: {message}")]
    Query {
        /// Driver-reported detail
        message: String,
        /// The SQL text, when known
        sql: Option<String>,
    },

    /// Transaction begin/commit/rollback failed
    #[error("transaction error: {message}")]
    Transaction {
        /// Driver-reported detail
        message: String,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout {
        /// What timed out
        message: String,
    },

    /// Deadlock detected by the backend
    #[error("deadlock detected")]
    Deadlock,

    /// Pool is draining; new acquisitions are rejected
    #[error("pool is draining, new acquisitions rejected")]
    Draining,

    /// Pool has been shut down
    #[error("pool is closed")]
    Closed,

    /// Drain did not complete within the allotted timeout
    #[error("drain timed out with {still_in_transaction} connection(s) still in transaction")]
    DrainTimeout {
        /// Connections force-closed with an uncommitted transaction
        still_in_transaction: usize,
    },

    /// Shared state store failure (coordinated breaker / distributed metrics)
    #[error("store error: {message}")]
    Store {
        /// Store-reported detail
        message: String,
    },

    /// Invariant violation inside the pool itself
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong
        message: String,
    },
}

impl PoolError {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::QueryValidation { .. } => ErrorCategory::Validation,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Authentication { .. } => ErrorCategory::Authentication,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Deadlock => ErrorCategory::Deadlock,
            Self::Draining | Self::Closed | Self::DrainTimeout { .. } => ErrorCategory::Unavailable,
            Self::Store { .. } => ErrorCategory::Store,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable by the connection-creation retry loop
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Metric-safe error code
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "config_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::QueryValidation { .. } => "query_validation",
            Self::Connection { .. } => "connection_error",
            Self::Authentication { .. } => "auth_failed",
            Self::Query { .. } => "query_error",
            Self::Transaction { .. } => "transaction_error",
            Self::Timeout { .. } => "timeout",
            Self::Deadlock => "deadlock",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::DrainTimeout { .. } => "drain_timeout",
            Self::Store { .. } => "store_error",
            Self::Internal { .. } => "internal",
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
        }
    }

    /// Create a query error carrying the offending SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::QueryValidation {
            reason: reason.into(),
        }
    }

    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

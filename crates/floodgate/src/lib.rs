//! # floodgate
//!
//! Database connection pooling with integrated circuit breaking.
//!
//! Floodgate owns the hard parts of talking to a relational database from a
//! long-running service: bounded connection reuse, failure isolation, and
//! resource lifecycle. Everything above it (HTTP handlers, session stores,
//! schedulers) consumes the pool's contract; everything below it (the wire
//! protocol) lives behind the driver seam.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DatabasePool                          │
//! │  acquire/release · query/execute/transaction · drain        │
//! ├───────────────┬──────────────────┬──────────────────────────┤
//! │ PooledConnection │ CircuitBreaker │ PoolMetrics             │
//! │ lifecycle +      │ local or       │ atomic counters +       │
//! │ statement cache  │ coordinated    │ metrics facade          │
//! ├───────────────┴──────────┬───────┴──────────────────────────┤
//! │    Driver trait          │        StateStore                │
//! │    (wire protocol)       │  (shared breaker/metrics state)  │
//! └──────────────────────────┴──────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use floodgate::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let config = PoolConfig::builder()
//!     .database("appdb")
//!     .username("app")
//!     .password("secret")
//!     .max_connections(10)
//!     .failure_threshold(5)
//!     .recovery_time(Duration::from_secs(30))
//!     .build()?;
//!
//! let pool = DatabasePool::new(config, Arc::new(MyDriver::new())).await?;
//!
//! let rows = pool
//!     .query("SELECT * FROM users WHERE id = $1", &[Value::Int64(1)])
//!     .await?;
//!
//! pool.transaction(|conn| async move {
//!     conn.execute("UPDATE accounts SET balance = balance - 10 WHERE id = $1", &[Value::Int64(1)]).await?;
//!     conn.execute("UPDATE accounts SET balance = balance + 10 WHERE id = $1", &[Value::Int64(2)]).await?;
//!     Ok(())
//! })
//! .await?;
//!
//! // Graceful redeploy
//! pool.drain(Duration::from_secs(30)).await?;
//! ```
//!
//! ## Coordinated mode
//!
//! With a [`config::StoreConfig`], the circuit breaker state and the
//! metrics counters live in a shared keyed store, so every pool process
//! against the same backend converges on one judgment about its health.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod breaker;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod statements;
pub mod store;
pub mod tls;
pub mod types;
pub mod validation;

// =============================================================================
// Tier 1: core types, re-exported at the crate root
// =============================================================================

pub use config::{DriverKind, PoolConfig, PoolConfigBuilder, StoreConfig};
pub use connection::PooledConnection;
pub use error::{ErrorCategory, PoolError, Result};
pub use pool::{DatabasePool, HealthSummary, PoolState, PoolStats};
pub use types::{Row, Value};

// =============================================================================
// Tier 2: extension seams: breaker, driver, and store implementations
// =============================================================================

pub use breaker::{
    BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState, CoordinatedCircuitBreaker,
    LocalCircuitBreaker,
};
pub use driver::{Driver, DriverConnection, StatementHandle};
pub use store::{FileStateStore, MemoryStateStore, StateStore};

// =============================================================================
// Tier 3: advanced types, available via their modules
// =============================================================================
// - connection::ConnectionSummary
// - driver::{StubDriver, StubState} (test double)
// - metrics::{PoolMetrics, DistributedMetrics, MetricsSnapshot}
// - statements::StatementCache
// - tls::{SslMode, TlsConfig}
// - validation::QueryGuard

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::breaker::{
        BreakerSettings, BreakerSnapshot, CircuitBreaker, CircuitState, CoordinatedCircuitBreaker,
        LocalCircuitBreaker,
    };
    pub use crate::config::{DriverKind, PoolConfig, PoolConfigBuilder, StoreConfig};
    pub use crate::connection::{ConnectionSummary, PooledConnection};
    pub use crate::driver::{Driver, DriverConnection, StatementHandle};
    pub use crate::error::{ErrorCategory, PoolError, Result};
    pub use crate::metrics::MetricsSnapshot;
    pub use crate::pool::{DatabasePool, HealthSummary, PoolState, PoolStats};
    pub use crate::store::{FileStateStore, MemoryStateStore, StateStore};
    pub use crate::tls::{SslMode, TlsConfig};
    pub use crate::types::{Row, Value};
}

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int64(42);
        let _state = CircuitState::Closed;
        let _mode = SslMode::Require;
        let _builder = PoolConfig::builder().database("db").username("user");
    }

    #[test]
    fn test_error_classification_at_root() {
        let err = PoolError::connection("refused");
        assert!(err.is_retriable());
        assert_eq!(err.category(), ErrorCategory::Connection);
    }
}

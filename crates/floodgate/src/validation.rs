//! Request validation for the pool
//!
//! Protects against:
//! - Resource exhaustion from oversized SQL text or parameter lists,
//!   rejected before any connection or lock is touched
//! - SQL injection via identifier validation of configured names

use crate::error::{PoolError, Result};
use crate::types::Value;
use regex::Regex;
use std::sync::LazyLock;

/// Maximum allowed identifier length
const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Default cap on SQL text size (1 MB)
pub const DEFAULT_MAX_QUERY_BYTES: usize = 1024 * 1024;

/// Default cap on bound parameters per statement
pub const DEFAULT_MAX_QUERY_PARAMS: usize = 1000;

/// Regex for validating SQL identifiers (database names, usernames)
static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]{0,254}$").unwrap());

/// Validate a SQL identifier (database name, username, application name)
///
/// Rejects empty strings, strings starting with digits, special characters
/// (quotes, semicolons, whitespace), and excessively long strings.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(PoolError::validation("identifier cannot be empty"));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(PoolError::validation(format!(
            "identifier too long: {} chars (max: {})",
            name.len(),
            MAX_IDENTIFIER_LENGTH
        )));
    }

    if !IDENTIFIER_REGEX.is_match(name) {
        return Err(PoolError::validation(format!(
            "invalid identifier '{}': must start with letter/underscore and contain only alphanumeric characters and underscores",
            name
        )));
    }

    Ok(())
}

/// DoS guard applied to every `query`/`execute` call before the request
/// reaches the circuit breaker, the pool lock, or the network.
#[derive(Debug, Clone, Copy)]
pub struct QueryGuard {
    /// Maximum SQL text size in bytes
    pub max_query_bytes: usize,
    /// Maximum number of bound parameters
    pub max_query_params: usize,
}

impl Default for QueryGuard {
    fn default() -> Self {
        Self {
            max_query_bytes: DEFAULT_MAX_QUERY_BYTES,
            max_query_params: DEFAULT_MAX_QUERY_PARAMS,
        }
    }
}

impl QueryGuard {
    /// Create a guard with explicit limits
    pub fn new(max_query_bytes: usize, max_query_params: usize) -> Self {
        Self {
            max_query_bytes,
            max_query_params,
        }
    }

    /// Validate a statement and its parameters.
    ///
    /// Classified as a caller error, never retried.
    pub fn validate(&self, sql: &str, params: &[Value]) -> Result<()> {
        if sql.is_empty() {
            return Err(PoolError::validation("SQL text is empty"));
        }

        if sql.len() > self.max_query_bytes {
            return Err(PoolError::validation(format!(
                "SQL text of {} bytes exceeds maximum {}",
                sql.len(),
                self.max_query_bytes
            )));
        }

        if params.len() > self.max_query_params {
            return Err(PoolError::validation(format!(
                "{} bound parameters exceed maximum {}",
                params.len(),
                self.max_query_params
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_identifiers() {
        assert!(validate_identifier("my_database").is_ok());
        assert!(validate_identifier("AppDb123").is_ok());
        assert!(validate_identifier("_internal").is_ok());
    }

    #[test]
    fn test_invalid_identifiers() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1db").is_err());
        assert!(validate_identifier("db-name").is_err());
        assert!(validate_identifier("db.name").is_err());
        assert!(validate_identifier("db'; DROP TABLE users; --").is_err());
        assert!(validate_identifier(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_injection_attempts_rejected() {
        let malicious = [
            "'; DROP TABLE users; --",
            "1' OR '1'='1",
            "admin'--",
            "../../../etc/passwd",
            "db; DELETE FROM users",
            "db\x00evil",
            "db\tname",
        ];
        for input in malicious {
            assert!(
                validate_identifier(input).is_err(),
                "should reject: {}",
                input.escape_debug()
            );
        }
    }

    #[test]
    fn test_guard_accepts_normal_query() {
        let guard = QueryGuard::default();
        assert!(guard
            .validate("SELECT * FROM users WHERE id = $1", &[Value::Int64(1)])
            .is_ok());
    }

    #[test]
    fn test_guard_rejects_empty_sql() {
        let guard = QueryGuard::default();
        assert!(guard.validate("", &[]).is_err());
    }

    #[test]
    fn test_guard_rejects_oversized_sql() {
        let guard = QueryGuard::new(64, 10);
        let sql = format!("SELECT '{}'", "x".repeat(128));
        let err = guard.validate(&sql, &[]).unwrap_err();
        assert!(matches!(err, PoolError::QueryValidation { .. }));
        assert!(err.to_string().contains("exceeds maximum 64"));
    }

    #[test]
    fn test_guard_rejects_too_many_params() {
        let guard = QueryGuard::new(1024, 4);
        let params = vec![Value::Int64(0); 5];
        let err = guard.validate("SELECT 1", &params).unwrap_err();
        assert!(matches!(err, PoolError::QueryValidation { .. }));
        assert!(err.to_string().contains("5 bound parameters"));
    }

    #[test]
    fn test_guard_boundary_conditions() {
        let guard = QueryGuard::new(8, 2);
        // Exactly at the limit is allowed
        assert!(guard.validate("SELECT 1", &[Value::Null, Value::Null]).is_ok());
        // One byte over is rejected
        assert!(guard.validate("SELECT 12", &[]).is_err());
    }
}

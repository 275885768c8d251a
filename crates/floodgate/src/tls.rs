//! TLS configuration for pooled database connections
//!
//! The pool does not terminate TLS itself; it validates the settings once at
//! construction and renders them into the driver DSN so the underlying
//! driver negotiates the session.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// TLS mode for database connections
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// No TLS - plain TCP connection
    #[default]
    Disable,
    /// Try TLS, but allow unencrypted if the server doesn't support it
    Prefer,
    /// Require TLS, verify the server certificate against root CAs
    Require,
    /// Require TLS, verify against the specified CA
    VerifyCa,
    /// Require TLS, verify both CA and server hostname
    VerifyFull,
}

impl std::fmt::Display for SslMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SslMode::Disable => write!(f, "disable"),
            SslMode::Prefer => write!(f, "prefer"),
            SslMode::Require => write!(f, "require"),
            SslMode::VerifyCa => write!(f, "verify-ca"),
            SslMode::VerifyFull => write!(f, "verify-full"),
        }
    }
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "off" | "no" | "false" | "0" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            "verify-ca" | "verify_ca" => Ok(SslMode::VerifyCa),
            "verify-full" | "verify_full" => Ok(SslMode::VerifyFull),
            _ => Err(format!(
                "Invalid SSL mode '{}'. Valid values: disable, prefer, require, verify-ca, verify-full",
                s
            )),
        }
    }
}

/// TLS configuration for pooled connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// SSL mode (disable, prefer, require, verify-ca, verify-full)
    pub mode: SslMode,

    /// Path to CA certificate file (PEM format)
    /// Required for verify-ca and verify-full modes
    pub ca_cert_path: Option<PathBuf>,

    /// Path to client certificate file (PEM format, mTLS)
    pub client_cert_path: Option<PathBuf>,

    /// Path to client private key file (PEM format)
    /// Required if client_cert_path is specified
    pub client_key_path: Option<PathBuf>,
}

impl TlsConfig {
    /// Create a TLS config with the given mode
    pub fn new(mode: SslMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Create a TLS config that fully verifies the server
    pub fn verify_full(ca_cert_path: PathBuf) -> Self {
        Self {
            mode: SslMode::VerifyFull,
            ca_cert_path: Some(ca_cert_path),
            ..Default::default()
        }
    }

    /// Check if TLS is enabled
    pub fn is_enabled(&self) -> bool {
        !matches!(self.mode, SslMode::Disable)
    }

    /// Validate the configuration, appending each violation to `violations`
    pub fn collect_violations(&self, violations: &mut Vec<String>) {
        if matches!(self.mode, SslMode::VerifyCa | SslMode::VerifyFull)
            && self.ca_cert_path.is_none()
        {
            violations.push(format!(
                "ca_cert_path is required for SSL mode '{}'",
                self.mode
            ));
        }

        if self.client_cert_path.is_some() && self.client_key_path.is_none() {
            violations
                .push("client_key_path is required when client_cert_path is specified".into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!("disable".parse::<SslMode>().unwrap(), SslMode::Disable);
        assert_eq!("prefer".parse::<SslMode>().unwrap(), SslMode::Prefer);
        assert_eq!("REQUIRE".parse::<SslMode>().unwrap(), SslMode::Require);
        assert_eq!("verify-ca".parse::<SslMode>().unwrap(), SslMode::VerifyCa);
        assert_eq!(
            "verify_full".parse::<SslMode>().unwrap(),
            SslMode::VerifyFull
        );
        assert!("invalid".parse::<SslMode>().is_err());
    }

    #[test]
    fn test_ssl_mode_display() {
        assert_eq!(SslMode::Disable.to_string(), "disable");
        assert_eq!(SslMode::VerifyFull.to_string(), "verify-full");
    }

    #[test]
    fn test_tls_validation() {
        let mut violations = Vec::new();
        TlsConfig::new(SslMode::Disable).collect_violations(&mut violations);
        assert!(violations.is_empty());

        // Require mode needs no CA (encryption only)
        TlsConfig::new(SslMode::Require).collect_violations(&mut violations);
        assert!(violations.is_empty());

        // VerifyFull needs a CA
        TlsConfig::new(SslMode::VerifyFull).collect_violations(&mut violations);
        assert_eq!(violations.len(), 1);

        // Client cert needs a key
        violations.clear();
        let mut config = TlsConfig::new(SslMode::Require);
        config.client_cert_path = Some(PathBuf::from("/certs/client.pem"));
        config.collect_violations(&mut violations);
        assert_eq!(violations.len(), 1);

        violations.clear();
        config.client_key_path = Some(PathBuf::from("/certs/client.key"));
        config.collect_violations(&mut violations);
        assert!(violations.is_empty());
    }

    #[test]
    fn test_tls_enabled() {
        assert!(!TlsConfig::new(SslMode::Disable).is_enabled());
        assert!(TlsConfig::new(SslMode::Prefer).is_enabled());
        assert!(TlsConfig::verify_full(PathBuf::from("/ca.pem")).is_enabled());
    }
}

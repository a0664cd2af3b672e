//! Resolved connection parameters and session metadata.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Server setting key carrying the pool sizing hint.
pub const SUGGESTED_POOL_CONCURRENCY: &str = "suggested_pool_concurrency";

/// Network address of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// TCP host and port.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Address {
    /// Create a TCP address.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
            Self::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// TLS verification mode requested for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsSecurity {
    /// Pick strict or no-host-verification depending on the CA source.
    #[default]
    Default,
    /// Verify certificate chain and host name.
    Strict,
    /// Verify certificate chain only.
    NoHostVerification,
    /// Do not verify certificates.
    Insecure,
}

/// Fully resolved connection parameters.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedConnectConfig {
    /// Server address.
    pub address: Address,
    /// User name.
    pub user: String,
    /// Password, if any.
    pub password: Option<String>,
    /// Database (branch) name.
    pub database: String,
    /// TLS verification mode.
    pub tls_security: TlsSecurity,
}

impl fmt::Debug for ResolvedConnectConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedConnectConfig")
            .field("address", &self.address)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("tls_security", &self.tls_security)
            .finish()
    }
}

/// Client-side settings that apply to every session of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfiguration {
    /// Time allowed for a single connection attempt.
    pub connect_timeout: Duration,
    /// How long to keep retrying while the server is unavailable.
    pub wait_until_available: Duration,
    /// Default timeout for statement execution.
    pub command_timeout: Option<Duration>,
}

impl Default for ClientConfiguration {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            wait_until_available: Duration::from_secs(30),
            command_timeout: None,
        }
    }
}

/// Settings advertised by the server after the handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerSettings {
    values: HashMap<String, serde_json::Value>,
}

impl ServerSettings {
    /// Create an empty settings map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, returning `self` for chaining.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a raw value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    /// Server-suggested pool size. Zero or non-numeric values are ignored.
    #[must_use]
    pub fn suggested_pool_concurrency(&self) -> Option<usize> {
        self.values
            .get(SUGGESTED_POOL_CONCURRENCY)
            .and_then(serde_json::Value::as_u64)
            .filter(|n| *n > 0)
            .and_then(|n| usize::try_from(n).ok())
    }

    /// Number of settings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no settings were advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Severity of a server log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    /// Debug output.
    Debug,
    /// Informational notice.
    Info,
    /// Something worth attention.
    Notice,
    /// Warning.
    Warning,
}

/// A log message pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    /// Severity level.
    pub severity: LogSeverity,
    /// Message code.
    pub code: u32,
    /// Message text.
    pub text: String,
}

impl LogMessage {
    /// Create a new log message.
    pub fn new(severity: LogSeverity, code: u32, text: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            text: text.into(),
        }
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:#x}: {}", self.severity, self.code, self.text)
    }
}

//! Connection traits for rivven-sqlsink
//!
//! The minimal driver surface the submission engine needs:
//! - [`Connection`]: prepare statements, commit, validity check
//! - [`PreparedStatement`]: execute with positional [`Param`]s
//! - [`ConnectionFactory`]: open connections from a [`ConnectionConfig`]

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Param, SensitiveString};

/// A connection to a database
#[async_trait]
pub trait Connection: Send + Sync {
    /// Prepare a statement. Placeholders are `?`, numbered left to right from 1.
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// Commit work done since the last commit.
    ///
    /// A no-op for connections in auto-commit mode.
    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    /// Check if connection is valid/alive
    async fn is_valid(&self) -> bool;

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A prepared statement
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// Execute with the given parameters, returns the affected row count
    async fn execute(&self, params: &[Param]) -> Result<u64>;

    /// Get the SQL string
    fn sql(&self) -> &str;

    /// Release driver-side resources held by the statement
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Configuration for creating connections
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Connection URL (e.g., postgres://host:5432/db or jdbc:postgresql://host/db)
    pub url: String,
    /// User name, overrides any user in the URL
    pub username: Option<String>,
    /// Password, overrides any password in the URL
    pub password: Option<SensitiveString>,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Whether every statement commits on its own
    pub auto_commit: bool,
    /// Prepared statements cached per connection (0 disables the cache)
    pub statement_cache_size: usize,
    /// Application name (shown in pg_stat_activity, etc)
    pub application_name: Option<String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &redact_url(&self.url))
            .field("username", &self.username)
            .field("password", &self.password)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("auto_commit", &self.auto_commit)
            .field("statement_cache_size", &self.statement_cache_size)
            .field("application_name", &self.application_name)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            username: None,
            password: None,
            connect_timeout_ms: 10_000,
            auto_commit: true,
            statement_cache_size: 100,
            application_name: Some("rivven-sqlsink".into()),
        }
    }
}

impl ConnectionConfig {
    /// Create configuration with just a URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set credentials
    pub fn with_credentials(
        mut self,
        username: Option<String>,
        password: Option<SensitiveString>,
    ) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Set connection timeout
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    /// Set auto-commit mode
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Set statement cache size
    pub fn with_statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    /// Set application name
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }
}

/// URL with any embedded password masked, safe for logs.
pub fn redact_url(raw: &str) -> String {
    let (prefix, rest) = match raw.strip_prefix("jdbc:") {
        Some(rest) => ("jdbc:", rest),
        None => ("", raw),
    };
    match url::Url::parse(rest) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            format!("{}{}", prefix, parsed)
        }
        Err(_) => "***".to_string(),
    }
}

/// Factory for creating connections
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Create a new connection
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Driver name, for log fields
    fn driver_name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_builder() {
        let config = ConnectionConfig::new("postgres://localhost/test")
            .with_connect_timeout(5000)
            .with_auto_commit(false)
            .with_statement_cache_size(8)
            .with_application_name("myapp");

        assert_eq!(config.url, "postgres://localhost/test");
        assert_eq!(config.connect_timeout_ms, 5000);
        assert!(!config.auto_commit);
        assert_eq!(config.statement_cache_size, 8);
        assert_eq!(config.application_name, Some("myapp".into()));
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let config = ConnectionConfig::new("jdbc:postgresql://app:s3cret@db:5432/logs")
            .with_credentials(Some("app".into()), Some("hunter2".into()));
        let debug = format!("{:?}", config);

        assert!(!debug.contains("s3cret"));
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("jdbc:postgresql://app:***@db:5432/logs"));
    }

    #[test]
    fn test_redact_url_unparseable() {
        assert_eq!(redact_url("not a url"), "***");
        assert_eq!(
            redact_url("postgres://db/logs"),
            "postgres://db/logs"
        );
    }
}

//! Sink configuration
//!
//! YAML with camelCase keys. `${VAR}` and `${VAR:-default}` are expanded
//! from the environment before parsing.
//!
//! ```yaml
//! connectionString: jdbc:postgresql://db:5432/logs
//! username: writer
//! password: ${DB_PASSWORD}
//! statement:
//!   - INSERT INTO events (ts, host, msg) VALUES (?, ?, ?)
//!   - "@timestamp"
//!   - host
//!   - message
//! flushSize: 500
//! maxFlushExceptions: 0
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::connection::ConnectionConfig;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::retry::RetryPolicy;
use crate::template::{StatementMode, StatementTemplate};
use crate::types::SensitiveString;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Supported database drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Driver {
    /// PostgreSQL via tokio-postgres
    Postgres,
}

impl Driver {
    /// Resolve a `driverClass` value
    pub fn from_class(class: &str) -> Option<Self> {
        match class.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "org.postgresql.driver" => Some(Self::Postgres),
            _ => None,
        }
    }

    /// Infer the driver from a connection string scheme
    pub fn from_url(url: &str) -> Option<Self> {
        let url = url.strip_prefix("jdbc:").unwrap_or(url);
        let scheme = url.split_once(':').map(|(scheme, _)| scheme)?;
        Self::from_class(scheme)
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
        }
    }
}

/// SQL sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[validate(schema(function = "validate_intervals"))]
pub struct SqlSinkConfig {
    /// Driver to load (`org.postgresql.Driver`, `postgres`); inferred from
    /// the connection string when absent
    #[serde(default)]
    pub driver_class: Option<String>,

    /// Commit every statement on its own (default: true)
    ///
    /// When false, the connection is committed once per submission attempt.
    #[serde(default = "default_true")]
    pub driver_auto_commit: bool,

    /// Database connection string
    #[validate(length(min = 1))]
    pub connection_string: String,

    /// User name, overrides the connection string
    #[serde(default)]
    pub username: Option<String>,

    /// Password, overrides the connection string
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// SQL text followed by the field references bound to its `?` placeholders
    #[validate(length(min = 1))]
    pub statement: Vec<String>,

    /// Expand `%{field}` references in the SQL text per record (default: false)
    #[serde(default)]
    pub unsafe_statement: bool,

    /// Maximum pooled connections (default: 5)
    #[serde(default = "default_max_pool_size")]
    #[validate(range(min = 1, max = 1024))]
    pub max_pool_size: u32,

    /// Connection and acquire timeout in milliseconds (default: 10000)
    #[serde(default = "default_connection_timeout_ms")]
    #[validate(range(min = 1))]
    pub connection_timeout_ms: u64,

    /// Maximum records per batch (default: 1000)
    #[serde(default = "default_flush_size")]
    #[validate(range(min = 1))]
    pub flush_size: usize,

    /// First backoff interval in seconds (default: 2)
    #[serde(default = "default_retry_initial_interval")]
    pub retry_initial_interval_seconds: f64,

    /// Backoff ceiling in seconds (default: 128)
    #[serde(default = "default_retry_max_interval")]
    pub retry_max_interval_seconds: f64,

    /// Failed rounds allowed per batch before dropping its remaining
    /// records (default: 10, `<= 0` retries forever)
    #[serde(default = "default_max_flush_exceptions")]
    pub max_flush_exceptions: i64,

    /// Prepared statements cached per connection (default: 100)
    #[serde(default = "default_statement_cache_size")]
    pub statement_cache_size: usize,

    /// Application name reported to the server
    #[serde(default)]
    pub application_name: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_max_pool_size() -> u32 {
    5
}

fn default_connection_timeout_ms() -> u64 {
    10_000
}

fn default_flush_size() -> usize {
    1000
}

fn default_retry_initial_interval() -> f64 {
    2.0
}

fn default_retry_max_interval() -> f64 {
    128.0
}

fn default_max_flush_exceptions() -> i64 {
    10
}

fn default_statement_cache_size() -> usize {
    100
}

fn validate_intervals(config: &SqlSinkConfig) -> std::result::Result<(), ValidationError> {
    let initial = config.retry_initial_interval_seconds;
    let max = config.retry_max_interval_seconds;

    if !(initial.is_finite() && initial > 0.0) {
        return Err(ValidationError::new("retry_initial_interval")
            .with_message("retryInitialIntervalSeconds must be a positive number".into()));
    }
    if !(max.is_finite() && max > 0.0) {
        return Err(ValidationError::new("retry_max_interval")
            .with_message("retryMaxIntervalSeconds must be a positive number".into()));
    }
    if max < initial {
        return Err(ValidationError::new("retry_interval_order").with_message(
            "retryMaxIntervalSeconds must not be less than retryInitialIntervalSeconds".into(),
        ));
    }
    Ok(())
}

impl Default for SqlSinkConfig {
    fn default() -> Self {
        Self {
            driver_class: None,
            driver_auto_commit: true,
            connection_string: String::new(),
            username: None,
            password: None,
            statement: Vec::new(),
            unsafe_statement: false,
            max_pool_size: default_max_pool_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            flush_size: default_flush_size(),
            retry_initial_interval_seconds: default_retry_initial_interval(),
            retry_max_interval_seconds: default_retry_max_interval(),
            max_flush_exceptions: default_max_flush_exceptions(),
            statement_cache_size: default_statement_cache_size(),
            application_name: None,
        }
    }
}

impl SqlSinkConfig {
    /// Load, expand and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse, expand and validate YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Run every validation rule
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid config: {}", e)))?;
        self.driver()?;
        self.template()?;
        self.retry_policy()?;
        Ok(())
    }

    /// Driver selected by `driverClass`, or inferred from the connection string
    pub fn driver(&self) -> Result<Driver> {
        match &self.driver_class {
            Some(class) => Driver::from_class(class)
                .ok_or_else(|| Error::config(format!("unsupported driverClass '{}'", class))),
            None => Driver::from_url(&self.connection_string).ok_or_else(|| {
                Error::config("cannot infer driver from connectionString, set driverClass")
            }),
        }
    }

    /// Statement template from `statement`
    pub fn template(&self) -> Result<StatementTemplate> {
        StatementTemplate::from_parts(&self.statement)
    }

    /// Statement mode from `unsafeStatement`
    pub fn mode(&self) -> StatementMode {
        StatementMode::from_unsafe_flag(self.unsafe_statement)
    }

    /// Retry policy from the interval and budget settings
    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        let seconds = |value: f64, key: &str| {
            Duration::try_from_secs_f64(value)
                .map_err(|e| Error::config(format!("invalid {}: {}", key, e)))
        };
        Ok(RetryPolicy::new(
            seconds(self.retry_initial_interval_seconds, "retryInitialIntervalSeconds")?,
            seconds(self.retry_max_interval_seconds, "retryMaxIntervalSeconds")?,
            self.max_flush_exceptions,
        ))
    }

    /// Connection settings
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut connection = ConnectionConfig::new(self.connection_string.clone())
            .with_credentials(self.username.clone(), self.password.clone())
            .with_connect_timeout(self.connection_timeout_ms)
            .with_auto_commit(self.driver_auto_commit)
            .with_statement_cache_size(self.statement_cache_size);
        if let Some(name) = &self.application_name {
            connection = connection.with_application_name(name.clone());
        }
        connection
    }

    /// Pool settings
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::from_connection(self.connection_config())
            .with_max_size(self.max_pool_size as usize)
            .with_acquire_timeout(Duration::from_millis(self.connection_timeout_ms))
    }

    /// JSON schema of the configuration
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(SqlSinkConfig)).unwrap_or_default()
    }
}

/// Expand `${VAR}` / `${VAR:-default}`; unset variables without a default expand to ""
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SqlSinkConfig::from_yaml(
            r#"
connectionString: postgres://localhost/logs
statement: ["INSERT INTO t (a) VALUES (?)", "a"]
"#,
        )
        .unwrap();

        assert!(config.driver_auto_commit);
        assert!(!config.unsafe_statement);
        assert_eq!(config.max_pool_size, 5);
        assert_eq!(config.connection_timeout_ms, 10_000);
        assert_eq!(config.flush_size, 1000);
        assert_eq!(config.max_flush_exceptions, 10);

        let policy = config.retry_policy().unwrap();
        assert_eq!(policy.initial_interval, Duration::from_secs(2));
        assert_eq!(policy.max_interval, Duration::from_secs(128));
    }

    #[test]
    fn test_driver_resolution() {
        assert_eq!(Driver::from_class("org.postgresql.Driver"), Some(Driver::Postgres));
        assert_eq!(Driver::from_url("jdbc:postgresql://db/x"), Some(Driver::Postgres));
        assert_eq!(Driver::from_url("postgres://db/x"), Some(Driver::Postgres));
        assert_eq!(Driver::from_url("mysql://db/x"), None);
        assert_eq!(Driver::from_url("no scheme"), None);
    }

    #[test]
    fn test_expand_env_vars_default() {
        let text = expand_env_vars("url: ${RIVVEN_SQLSINK_SURELY_UNSET:-postgres://fallback/db}");
        assert_eq!(text, "url: postgres://fallback/db");
    }

    #[test]
    fn test_interval_rules() {
        let base = SqlSinkConfig {
            connection_string: "postgres://localhost/logs".into(),
            statement: vec!["SELECT 1".into()],
            ..Default::default()
        };
        assert!(base.check().is_ok());

        let inverted = SqlSinkConfig {
            retry_initial_interval_seconds: 10.0,
            retry_max_interval_seconds: 5.0,
            ..base.clone()
        };
        assert!(inverted.check().is_err());

        let zero = SqlSinkConfig {
            retry_initial_interval_seconds: 0.0,
            ..base
        };
        assert!(zero.check().is_err());
    }
}

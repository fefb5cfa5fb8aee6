//! Error types for rivven-sqlsink
//!
//! Two layers:
//! - [`StoreError`]: an error reported by the database itself, identified by
//!   its SQLSTATE and carrying any chained sub-errors the driver attached
//! - [`Error`]: everything that can go wrong while talking to the store
//!   (pool, connection, driver, I/O), with [`ErrorCategory`] for log fields

use std::fmt;
use thiserror::Error;

/// Result type for rivven-sqlsink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories, used as a structured field when logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-level failures (connect, broken socket)
    Connection,
    /// Errors reported by the database with a SQLSTATE
    Store,
    /// No connection could be checked out of the pool
    PoolExhausted,
    /// Operation timed out
    Timeout,
    /// Invalid configuration
    Configuration,
    /// Driver-side statement failure without a SQLSTATE
    Statement,
    /// I/O errors
    Io,
    /// Anything else
    Other,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Store => write!(f, "store"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Timeout => write!(f, "timeout"),
            Self::Configuration => write!(f, "configuration"),
            Self::Statement => write!(f, "statement"),
            Self::Io => write!(f, "io"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// An error reported by the database.
///
/// Drivers may link several errors together (a batch failure followed by
/// the per-row causes, for example). The links are kept flat in `chained`,
/// in the order the driver reported them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (SQLSTATE {sqlstate}, vendor code {vendor_code})")]
pub struct StoreError {
    /// Five character SQLSTATE
    pub sqlstate: String,
    /// Vendor specific error number (0 if the driver has none)
    pub vendor_code: i32,
    /// Human readable message
    pub message: String,
    /// Linked sub-errors
    pub chained: Vec<StoreError>,
}

impl StoreError {
    /// Create a store error with the given SQLSTATE
    pub fn new(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sqlstate: sqlstate.into(),
            vendor_code: 0,
            message: message.into(),
            chained: Vec::new(),
        }
    }

    /// Set the vendor error number
    pub fn with_vendor_code(mut self, code: i32) -> Self {
        self.vendor_code = code;
        self
    }

    /// Link a sub-error
    pub fn with_chained(mut self, next: StoreError) -> Self {
        self.chained.push(next);
        self
    }

    /// Walk this error and every linked sub-error, depth first.
    pub fn chain(&self) -> Vec<&StoreError> {
        let mut out = vec![self];
        for next in &self.chained {
            out.extend(next.chain());
        }
        out
    }

    /// SQLSTATE class (first two characters)
    pub fn class(&self) -> &str {
        self.sqlstate.get(..2).unwrap_or(&self.sqlstate)
    }
}

/// Main error type for rivven-sqlsink
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed or was lost
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Error reported by the database
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Connection pool could not hand out a connection
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Driver-side statement failure (prepare/bind/execute) without a SQLSTATE
    #[error("statement error: {message}")]
    Statement {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Input could not be decoded into a record
    #[error("decode error: {message}")]
    Decode { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Store(_) => ErrorCategory::Store,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Statement { .. } => ErrorCategory::Statement,
            Self::Io(_) => ErrorCategory::Io,
            Self::Decode { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// The database error, if this is one
    pub fn as_store(&self) -> Option<&StoreError> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a store error
    pub fn store(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store(StoreError::new(sqlstate, message))
    }

    /// Create a statement error
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement {
            message: message.into(),
            source: None,
        }
    }

    /// Create a statement error with source
    pub fn statement_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Statement {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a decode error
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_chain_order() {
        let err = StoreError::new("22001", "batch entry 0 failed")
            .with_chained(
                StoreError::new("22001", "value too long").with_chained(StoreError::new(
                    "XX000",
                    "nested",
                )),
            )
            .with_chained(StoreError::new("23502", "null value"));

        let states: Vec<_> = err.chain().iter().map(|e| e.sqlstate.as_str()).collect();
        assert_eq!(states, vec!["22001", "22001", "XX000", "23502"]);
    }

    #[test]
    fn test_store_error_class() {
        assert_eq!(StoreError::new("23505", "dup").class(), "23");
        assert_eq!(StoreError::new("2", "short").class(), "2");
    }

    #[test]
    fn test_error_category() {
        assert_eq!(Error::connection("x").category(), ErrorCategory::Connection);
        assert_eq!(Error::store("23505", "x").category(), ErrorCategory::Store);
        assert_eq!(Error::config("x").category(), ErrorCategory::Configuration);
        assert_eq!(
            Error::PoolExhausted {
                message: "x".into()
            }
            .category(),
            ErrorCategory::PoolExhausted
        );
    }

    #[test]
    fn test_error_display() {
        let err = Error::store("23505", "duplicate key value");
        let text = err.to_string();
        assert!(text.contains("duplicate key value"));
        assert!(text.contains("23505"));

        let err = Error::connection("connection refused");
        assert!(err.to_string().contains("connection refused"));
    }
}

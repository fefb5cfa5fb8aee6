//! # rivven-sqlsink
//!
//! Resilient batch writer that persists a stream of records into a SQL
//! database through one parameterized statement.
//!
//! Each record is written on its own. Failures are classified by SQLSTATE:
//! ignorable ones (duplicate keys, "no data") and fatal ones (constraint and
//! data errors) drop the record, everything else is retried with exponential
//! backoff until the batch settles, the retry budget runs out or the sink is
//! shut down.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_sqlsink::prelude::*;
//!
//! let config = SqlSinkConfig::from_yaml(r#"
//! connectionString: postgres://writer@localhost/events
//! statement:
//!   - "INSERT INTO log (ts, host, msg) VALUES (?, ?, ?)"
//!   - "@timestamp"
//!   - host
//!   - message
//! flushSize: 500
//! "#)?;
//!
//! let sink = SqlSink::from_config(&config)?;
//! let outcome = sink.write_batch(records).await;
//! assert_eq!(outcome.accounted(), outcome.records);
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL support via tokio-postgres (default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod binder;
pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod retry;
pub mod sink;
pub mod submit;
pub mod template;
pub mod testing;
pub mod types;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result, StoreError};

    pub use crate::types::{FieldValue, Param, Record, SensitiveString, TIMESTAMP_FIELD};

    pub use crate::template::{sprintf, StatementMode, StatementTemplate};

    pub use crate::binder::bind;

    pub use crate::classify::{classify, Classification, Verdict};

    pub use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, PreparedStatement};

    pub use crate::pool::{
        ConnectionPool, PoolConfig, PoolStats, PooledConnection, SimpleConnectionPool,
    };

    pub use crate::submit::{Submission, Submitter};

    pub use crate::retry::{BatchOutcome, RetryController, RetryPolicy};

    pub use crate::sink::{factory_for, SinkStats, SqlSink};

    pub use crate::config::{Driver, SqlSinkConfig};
}

pub use error::{Error, Result};
pub use sink::SqlSink;
pub use types::Record;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let record = Record::new().with_field("host", "web-1");
        let template = StatementTemplate::new("INSERT INTO t (h) VALUES (?)", vec!["host".into()]);
        assert_eq!(bind(template.fields(), &record), vec![Param::Text("web-1".into())]);
        assert_eq!(RetryPolicy::default().max_flush_exceptions, 10);
    }

    #[test]
    fn test_error_types() {
        let err = Error::store("23505", "duplicate key");
        assert_eq!(err.category(), ErrorCategory::Store);
        assert_eq!(classify(err).classification(), Classification::Ignorable);
    }
}

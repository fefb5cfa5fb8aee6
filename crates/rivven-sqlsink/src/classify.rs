//! Per-record failure classification
//!
//! A record that failed to write is either dropped or retried, decided by
//! the SQLSTATE the database reported:
//!
//! | Classification | SQLSTATEs | Effect |
//! |----------------|-----------|--------|
//! | Ignorable | `00000`, `02000`, `23505` | dropped, logged at warn |
//! | Fatal | `22001`, `22003`, `23502`, `22007`, `22008`, `22023`, `23503`, `2200H`, `01004` | dropped, logged at error |
//! | Retryable | every other SQLSTATE, every non-database error | retried next round |
//!
//! The table is fixed. Only the top-level SQLSTATE is consulted; chained
//! sub-errors are reported but never change the verdict.

use std::fmt;

use tracing::{error, warn};

use crate::error::{Error, StoreError};
use crate::types::Record;

/// SQLSTATEs meaning the write had no real effect
pub const IGNORABLE_SQLSTATES: &[&str] = &[
    "00000", // successful completion
    "02000", // no data
    "23505", // unique violation
];

/// SQLSTATEs meaning the write can never succeed
pub const FATAL_SQLSTATES: &[&str] = &[
    "22001", // string data, right truncation (value too long for column)
    "22003", // numeric value out of range
    "23502", // not null violation
    "22007", // invalid datetime format
    "22008", // datetime field overflow
    "22023", // invalid parameter value
    "23503", // foreign key violation
    "2200H", // sequence generator limit exceeded
    "01004", // string data, right truncation on conversion
];

/// Classification of a failed write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    /// Drop the record, it had no effect anyway
    Ignorable,
    /// Drop the record, it can never be written
    Fatal,
    /// Try the record again in the next round
    Retryable,
}

impl Classification {
    /// Classify a SQLSTATE
    pub fn for_sqlstate(sqlstate: &str) -> Self {
        if IGNORABLE_SQLSTATES.contains(&sqlstate) {
            Self::Ignorable
        } else if FATAL_SQLSTATES.contains(&sqlstate) {
            Self::Fatal
        } else {
            Self::Retryable
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ignorable => write!(f, "ignorable"),
            Self::Fatal => write!(f, "fatal"),
            Self::Retryable => write!(f, "retryable"),
        }
    }
}

/// Classification together with the error that caused it
#[derive(Debug)]
pub enum Verdict {
    /// Database error in the ignorable set
    Ignorable(StoreError),
    /// Database error in the fatal set
    Fatal(StoreError),
    /// Any other database error, or a non-database error
    Retryable(Error),
}

impl Verdict {
    /// The bare classification
    pub fn classification(&self) -> Classification {
        match self {
            Self::Ignorable(_) => Classification::Ignorable,
            Self::Fatal(_) => Classification::Fatal,
            Self::Retryable(_) => Classification::Retryable,
        }
    }
}

/// Classify a failed write.
pub fn classify(err: Error) -> Verdict {
    match err {
        Error::Store(store) => match Classification::for_sqlstate(&store.sqlstate) {
            Classification::Ignorable => Verdict::Ignorable(store),
            Classification::Fatal => Verdict::Fatal(store),
            Classification::Retryable => Verdict::Retryable(Error::Store(store)),
        },
        other => Verdict::Retryable(other),
    }
}

/// Log level used when reporting a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Severity {
    Warn,
    Error,
}

macro_rules! at_severity {
    ($severity:expr, $($arg:tt)+) => {
        match $severity {
            Severity::Warn => warn!($($arg)+),
            Severity::Error => error!($($arg)+),
        }
    };
}

/// Log a failure, one event per link of its cause chain.
///
/// Database errors follow their chained sub-errors; any other error follows
/// `source()`. The `record` field is left out when there is no record.
pub(crate) fn report(severity: Severity, summary: &str, err: &Error, record: Option<&Record>) {
    let record = record.map(tracing::field::display);

    match err.as_store() {
        Some(store) => {
            let chain = store.chain();
            let depth = chain.len();
            for (link, e) in chain.into_iter().enumerate() {
                at_severity!(
                    severity,
                    sqlstate = %e.sqlstate,
                    vendor_code = e.vendor_code,
                    link,
                    depth,
                    record,
                    "{}: {}",
                    summary,
                    e.message
                );
            }
        }
        None => {
            let mut links = vec![err.to_string()];
            let mut source = std::error::Error::source(err);
            while let Some(cause) = source {
                links.push(cause.to_string());
                source = cause.source();
            }
            let depth = links.len();
            for (link, message) in links.iter().enumerate() {
                at_severity!(
                    severity,
                    category = %err.category(),
                    link,
                    depth,
                    record,
                    "{}: {}",
                    summary,
                    message
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_table() {
        for code in IGNORABLE_SQLSTATES {
            assert_eq!(Classification::for_sqlstate(code), Classification::Ignorable);
        }
        for code in FATAL_SQLSTATES {
            assert_eq!(Classification::for_sqlstate(code), Classification::Fatal);
        }
        for code in ["08006", "40001", "40P01", "53300", "57014", "42P01", "XX000", ""] {
            assert_eq!(Classification::for_sqlstate(code), Classification::Retryable);
        }
    }

    #[test]
    fn test_tables_are_disjoint() {
        for code in IGNORABLE_SQLSTATES {
            assert!(!FATAL_SQLSTATES.contains(code));
        }
    }

    #[test]
    fn test_classify_keeps_cause() {
        match classify(Error::store("23505", "duplicate key")) {
            Verdict::Ignorable(e) => assert_eq!(e.message, "duplicate key"),
            other => panic!("unexpected verdict {:?}", other),
        }

        match classify(Error::store("23503", "fk")) {
            Verdict::Fatal(e) => assert_eq!(e.sqlstate, "23503"),
            other => panic!("unexpected verdict {:?}", other),
        }

        match classify(Error::store("40001", "serialization failure")) {
            Verdict::Retryable(Error::Store(e)) => assert_eq!(e.sqlstate, "40001"),
            other => panic!("unexpected verdict {:?}", other),
        }
    }

    #[test]
    fn test_non_store_errors_retry() {
        let verdicts = [
            classify(Error::connection("reset by peer")),
            classify(Error::statement("bind failed")),
            classify(Error::timeout("statement timeout")),
            classify(Error::Io(std::io::Error::other("broken pipe"))),
        ];
        for verdict in verdicts {
            assert_eq!(verdict.classification(), Classification::Retryable);
        }
    }

    #[test]
    fn test_chained_errors_do_not_change_verdict() {
        let err = StoreError::new("40001", "batch failed")
            .with_chained(StoreError::new("23505", "duplicate key"));
        assert_eq!(
            classify(Error::Store(err)).classification(),
            Classification::Retryable
        );
    }

    // ==================== Reporting Tests ====================

    use crate::testing::LogCapture;
    use tracing::Level;

    #[test]
    fn test_report_logs_every_store_link() {
        let logs = LogCapture::default();
        let err = Error::Store(
            StoreError::new("23503", "insert violates foreign key")
                .with_chained(StoreError::new("23503", "key (org_id)=(9) is not present")),
        );
        let record = Record::new().with_field("org_id", 9_i64);
        {
            let _guard = logs.set_default();
            report(Severity::Error, "Dropping record", &err, Some(&record));
        }

        let lines = logs.lines_at(Level::ERROR);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("link=0"));
        assert!(lines[0].contains("insert violates foreign key"));
        assert!(lines[1].contains("link=1"));
        assert!(lines[1].contains("key (org_id)=(9) is not present"));
        assert!(lines.iter().all(|line| line.contains("record=")));
    }

    #[test]
    fn test_report_walks_source_chain() {
        let logs = LogCapture::default();
        let io = std::io::Error::other("password authentication failed");
        let err = Error::connection_with_source("could not connect", io);
        {
            let _guard = logs.set_default();
            report(Severity::Warn, "Pool unavailable", &err, None);
        }

        let lines = logs.lines_at(Level::WARN);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("could not connect"));
        assert!(lines[1].contains("link=1"));
        assert!(lines[1].contains("password authentication failed"));
        assert!(logs.lines_at(Level::ERROR).is_empty());
    }

    #[test]
    fn test_report_omits_missing_record() {
        let logs = LogCapture::default();
        {
            let _guard = logs.set_default();
            report(Severity::Warn, "Duplicate", &Error::store("23505", "dup"), None);
        }

        let contents = logs.contents();
        assert!(contents.contains("Duplicate: dup"));
        assert!(!contents.contains("record="));
    }
}

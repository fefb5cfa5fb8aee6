//! Submission engine: one pass of a batch over one pooled connection
//!
//! Every record is prepared, bound and executed on its own; a failure only
//! affects the record that raised it. Failures are classified and the
//! retryable ones come back in [`Submission::retry`], in input order.

use std::sync::Arc;
use tracing::{debug, trace};

use crate::binder;
use crate::classify::{classify, report, Severity, Verdict};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;
use crate::template::{StatementMode, StatementTemplate};
use crate::types::Record;

/// Result of one submission attempt
#[derive(Debug, Clone, Default)]
pub struct Submission {
    /// Records that need another attempt, in input order
    pub retry: Vec<Record>,
    /// Records written
    pub written: usize,
    /// Records dropped as ignorable
    pub ignored: usize,
    /// Records dropped as fatal
    pub fatal: usize,
    /// Records actually attempted (0 when no connection was available)
    pub attempted: usize,
    /// Whether the connection could not be acquired
    pub pool_failure: bool,
}

impl Submission {
    /// Whether nothing needs retrying
    pub fn is_complete(&self) -> bool {
        self.retry.is_empty()
    }

    fn unattempted(batch: Vec<Record>) -> Self {
        Self {
            retry: batch,
            pool_failure: true,
            ..Default::default()
        }
    }
}

/// Per-record outcome within one attempt
enum Outcome {
    Written,
    Ignored,
    Fatal,
    Retry,
}

/// Executes batches against a connection pool
#[derive(Clone)]
pub struct Submitter {
    pool: Arc<dyn ConnectionPool>,
    template: Arc<StatementTemplate>,
    mode: StatementMode,
    auto_commit: bool,
}

impl Submitter {
    /// Create a submitter.
    ///
    /// With `auto_commit` off, the connection is committed after every
    /// record of an attempt was tried.
    pub fn new(
        pool: Arc<dyn ConnectionPool>,
        template: StatementTemplate,
        mode: StatementMode,
        auto_commit: bool,
    ) -> Self {
        Self {
            pool,
            template: Arc::new(template),
            mode,
            auto_commit,
        }
    }

    /// Statement template in use
    pub fn template(&self) -> &StatementTemplate {
        &self.template
    }

    /// Statement mode in use
    pub fn mode(&self) -> StatementMode {
        self.mode
    }

    /// Attempt every record of `batch` once.
    pub async fn submit(&self, batch: Vec<Record>) -> Submission {
        let conn = match self.pool.get().await {
            Ok(conn) => conn,
            Err(e) => {
                report(
                    Severity::Error,
                    "Failed to acquire a connection, batch will be retried",
                    &e,
                    None,
                );
                return Submission::unattempted(batch);
            }
        };

        let mut submission = Submission::default();
        let mut outcomes = Vec::with_capacity(batch.len());

        for record in batch {
            submission.attempted += 1;
            let outcome = match self.write_record(&*conn, &record).await {
                Ok(rows) => {
                    trace!(rows, "Record written");
                    Outcome::Written
                }
                Err(e) => self.dispose(e, &record),
            };
            outcomes.push((record, outcome));
        }

        if !self.auto_commit && !outcomes.is_empty() {
            if let Err(e) = conn.commit().await {
                report(
                    Severity::Error,
                    "Commit failed, records of this attempt will be retried",
                    &e,
                    None,
                );
                for (_, outcome) in outcomes.iter_mut() {
                    if matches!(outcome, Outcome::Written) {
                        *outcome = Outcome::Retry;
                    }
                }
            }
        }

        conn.release().await;

        for (record, outcome) in outcomes {
            match outcome {
                Outcome::Written => submission.written += 1,
                Outcome::Ignored => submission.ignored += 1,
                Outcome::Fatal => submission.fatal += 1,
                Outcome::Retry => submission.retry.push(record),
            }
        }

        debug!(
            attempted = submission.attempted,
            written = submission.written,
            ignored = submission.ignored,
            fatal = submission.fatal,
            retry = submission.retry.len(),
            "Submission finished"
        );
        submission
    }

    /// Prepare, bind and execute one record. The statement is closed on every path.
    async fn write_record(&self, conn: &dyn Connection, record: &Record) -> Result<u64> {
        let sql = self.template.render(record, self.mode);
        let stmt = conn.prepare(&sql).await?;

        let params = if self.template.has_parameters() {
            binder::bind(self.template.fields(), record)
        } else {
            Vec::new()
        };
        let result = stmt.execute(&params).await;

        if let Err(e) = stmt.close().await {
            debug!(error = %e, sql = stmt.sql(), "Failed to close statement");
        }
        result
    }

    fn dispose(&self, err: Error, record: &Record) -> Outcome {
        match classify(err) {
            Verdict::Ignorable(cause) => {
                report(
                    Severity::Warn,
                    "Ignoring record",
                    &Error::Store(cause),
                    Some(record),
                );
                Outcome::Ignored
            }
            Verdict::Fatal(cause) => {
                report(
                    Severity::Error,
                    "Dropping record that can never be written",
                    &Error::Store(cause),
                    Some(record),
                );
                Outcome::Fatal
            }
            Verdict::Retryable(cause) => {
                report(
                    Severity::Warn,
                    "Failed to write record, will retry",
                    &cause,
                    Some(record),
                );
                Outcome::Retry
            }
        }
    }
}

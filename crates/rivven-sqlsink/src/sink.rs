//! Batch dispatcher
//!
//! Slices the input into batches of at most `flushSize` records and drives
//! each one through the [`RetryController`] before taking the next. The
//! producer is not polled while a batch is being retried, which is what
//! pushes back on it.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_sqlsink::prelude::*;
//!
//! let config = SqlSinkConfig::from_file("sink.yaml")?;
//! let sink = SqlSink::from_config(&config)?;
//!
//! let stop = sink.shutdown_token();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     stop.cancel();
//! });
//!
//! let stats = sink.run(records).await;
//! sink.close().await?;
//! ```

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Driver, SqlSinkConfig};
use crate::connection::{redact_url, ConnectionFactory};
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolStats, SimpleConnectionPool};
use crate::retry::{BatchOutcome, RetryController};
use crate::submit::Submitter;
use crate::types::Record;

/// Sink statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SinkStats {
    /// Records written
    pub records_written: u64,
    /// Records dropped as ignorable
    pub records_ignored: u64,
    /// Records dropped as fatal
    pub records_fatal: u64,
    /// Records dropped after the retry budget ran out
    pub records_exhausted: u64,
    /// Records left behind on shutdown
    pub records_abandoned: u64,
    /// Batches dispatched
    pub batches: u64,
    /// Submission rounds across all batches
    pub rounds: u64,
    /// Rounds that could not get a connection
    pub pool_failures: u64,
    /// Time spent in backoff (milliseconds)
    pub backoff_ms: u64,
    /// Time spent dispatching batches (milliseconds)
    pub total_write_time_ms: u64,
    /// Average records written per second of dispatch time
    pub records_per_second: f64,
}

impl SinkStats {
    /// Records that will never be written
    pub fn records_dropped(&self) -> u64 {
        self.records_ignored + self.records_fatal + self.records_exhausted + self.records_abandoned
    }
}

/// Atomic sink statistics
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicSinkStats {
    pub records_written: AtomicU64,
    pub records_ignored: AtomicU64,
    pub records_fatal: AtomicU64,
    pub records_exhausted: AtomicU64,
    pub records_abandoned: AtomicU64,
    pub batches: AtomicU64,
    pub rounds: AtomicU64,
    pub pool_failures: AtomicU64,
    pub backoff_ms: AtomicU64,
    pub total_write_time_ms: AtomicU64,
}

impl AtomicSinkStats {
    /// Record a dispatched batch
    pub fn record_outcome(&self, outcome: &BatchOutcome, duration: Duration) {
        self.records_written
            .fetch_add(outcome.written as u64, Ordering::Relaxed);
        self.records_ignored
            .fetch_add(outcome.ignored as u64, Ordering::Relaxed);
        self.records_fatal
            .fetch_add(outcome.fatal as u64, Ordering::Relaxed);
        self.records_exhausted
            .fetch_add(outcome.exhausted as u64, Ordering::Relaxed);
        self.records_abandoned
            .fetch_add(outcome.abandoned as u64, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.rounds
            .fetch_add(u64::from(outcome.rounds), Ordering::Relaxed);
        self.pool_failures
            .fetch_add(u64::from(outcome.pool_failures), Ordering::Relaxed);
        self.backoff_ms
            .fetch_add(outcome.backoff.as_millis() as u64, Ordering::Relaxed);
        self.total_write_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    /// Record records never dispatched because the sink was stopping
    pub fn record_abandoned(&self, records: u64) {
        self.records_abandoned.fetch_add(records, Ordering::Relaxed);
    }

    /// Get a snapshot
    pub fn snapshot(&self) -> SinkStats {
        let records = self.records_written.load(Ordering::Relaxed);
        let time_ms = self.total_write_time_ms.load(Ordering::Relaxed);
        let rps = if time_ms > 0 {
            (records as f64 * 1000.0) / time_ms as f64
        } else {
            0.0
        };

        SinkStats {
            records_written: records,
            records_ignored: self.records_ignored.load(Ordering::Relaxed),
            records_fatal: self.records_fatal.load(Ordering::Relaxed),
            records_exhausted: self.records_exhausted.load(Ordering::Relaxed),
            records_abandoned: self.records_abandoned.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            rounds: self.rounds.load(Ordering::Relaxed),
            pool_failures: self.pool_failures.load(Ordering::Relaxed),
            backoff_ms: self.backoff_ms.load(Ordering::Relaxed),
            total_write_time_ms: time_ms,
            records_per_second: rps,
        }
    }
}

/// Connection factory for a driver
pub fn factory_for(driver: Driver) -> Result<Arc<dyn ConnectionFactory>> {
    match driver {
        #[cfg(feature = "postgres")]
        Driver::Postgres => Ok(Arc::new(crate::postgres::PgConnectionFactory)),
        #[cfg(not(feature = "postgres"))]
        Driver::Postgres => Err(Error::config(
            "PostgreSQL support requires the `postgres` feature",
        )),
    }
}

/// Writes a record stream to a SQL database, one batch at a time
pub struct SqlSink {
    controller: RetryController,
    pool: Arc<dyn ConnectionPool>,
    flush_size: usize,
    stats: AtomicSinkStats,
    shutdown: CancellationToken,
}

impl SqlSink {
    /// Create a sink over an existing pool
    pub fn new(config: &SqlSinkConfig, pool: Arc<dyn ConnectionPool>) -> Result<Self> {
        if config.flush_size == 0 {
            return Err(Error::config("flushSize must be at least 1"));
        }
        let submitter = Submitter::new(
            Arc::clone(&pool),
            config.template()?,
            config.mode(),
            config.driver_auto_commit,
        );
        let controller = RetryController::new(submitter, config.retry_policy()?);

        Ok(Self {
            controller,
            pool,
            flush_size: config.flush_size,
            stats: AtomicSinkStats::default(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Create a sink with a new connection pool over `factory`
    pub fn connect(config: &SqlSinkConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let driver = factory.driver_name().to_string();
        let pool = SimpleConnectionPool::new(config.pool_config(), factory)?;
        let sink = Self::new(config, pool)?;

        info!(
            driver = %driver,
            url = %redact_url(&config.connection_string),
            max_pool_size = config.max_pool_size,
            flush_size = config.flush_size,
            unsafe_statement = config.unsafe_statement,
            auto_commit = config.driver_auto_commit,
            "SQL sink ready"
        );
        Ok(sink)
    }

    /// Create a sink using the driver selected by the configuration
    pub fn from_config(config: &SqlSinkConfig) -> Result<Self> {
        let factory = factory_for(config.driver()?)?;
        Self::connect(config, factory)
    }

    /// Maximum records per batch
    pub fn flush_size(&self) -> usize {
        self.flush_size
    }

    /// Token that stops the sink when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Request a stop: backoff sleeps end early and no new batch is started
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether a stop was requested
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Get sink statistics
    pub fn stats(&self) -> SinkStats {
        self.stats.snapshot()
    }

    /// Get pool statistics
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Write already collected records, `flushSize` at a time.
    ///
    /// Returns the combined outcome of every batch.
    pub async fn write_batch(&self, records: Vec<Record>) -> BatchOutcome {
        let mut total = BatchOutcome::default();
        let mut records = records.into_iter();

        loop {
            let batch: Vec<Record> = records.by_ref().take(self.flush_size).collect();
            if batch.is_empty() {
                break;
            }
            if self.is_shutting_down() {
                let abandoned = BatchOutcome::abandoned(batch.len() + records.len());
                self.stats.record_abandoned(abandoned.abandoned as u64);
                total.merge(&abandoned);
                break;
            }
            total.merge(&self.dispatch(batch).await);
        }
        total
    }

    /// Consume `records` until the stream ends or the sink is shut down.
    pub async fn run<S>(&self, records: S) -> SinkStats
    where
        S: Stream<Item = Record> + Send,
    {
        let batches = records.ready_chunks(self.flush_size);
        futures::pin_mut!(batches);

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                next = batches.next() => match next {
                    Some(batch) => batch,
                    None => break,
                },
            };
            self.dispatch(batch).await;
        }

        let stats = self.stats();
        info!(
            written = stats.records_written,
            dropped = stats.records_dropped(),
            batches = stats.batches,
            "SQL sink stopped"
        );
        stats
    }

    /// Drive one batch to completion
    async fn dispatch(&self, batch: Vec<Record>) -> BatchOutcome {
        let started = Instant::now();
        let outcome = self.controller.retrying_submit(batch, &self.shutdown).await;
        self.stats.record_outcome(&outcome, started.elapsed());

        if outcome.is_settled() {
            debug!(
                records = outcome.records,
                written = outcome.written,
                ignored = outcome.ignored,
                fatal = outcome.fatal,
                rounds = outcome.rounds,
                "Batch settled"
            );
        } else {
            warn!(
                records = outcome.records,
                written = outcome.written,
                exhausted = outcome.exhausted,
                abandoned = outcome.abandoned,
                rounds = outcome.rounds,
                "Batch finished with records left unwritten"
            );
        }
        outcome
    }

    /// Close the connection pool
    pub async fn close(&self) -> Result<()> {
        self.pool.close().await?;
        info!("SQL sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_sink_stats() {
        let stats = AtomicSinkStats::default();
        stats.record_outcome(
            &BatchOutcome {
                records: 10,
                written: 6,
                ignored: 1,
                fatal: 1,
                exhausted: 2,
                rounds: 3,
                sleeps: 2,
                backoff: Duration::from_secs(6),
                ..Default::default()
            },
            Duration::from_secs(2),
        );
        stats.record_abandoned(4);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.records_written, 6);
        assert_eq!(snapshot.records_dropped(), 8);
        assert_eq!(snapshot.batches, 1);
        assert_eq!(snapshot.rounds, 3);
        assert_eq!(snapshot.backoff_ms, 6000);
        assert!((snapshot.records_per_second - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_factory_for_postgres() {
        #[cfg(feature = "postgres")]
        assert_eq!(factory_for(Driver::Postgres).unwrap().driver_name(), "postgres");
        #[cfg(not(feature = "postgres"))]
        assert!(factory_for(Driver::Postgres).is_err());
    }
}

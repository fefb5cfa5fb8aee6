//! Retry controller: drives one batch to completion
//!
//! ```text
//!            ┌────────────── retry set non-empty ──────────────┐
//!            ▼                                                  │
//!       Attempting ── retry set empty ──► Succeeded             │
//!            │                                                  │
//!            ├── attempts > maxFlushExceptions ──► Exhausted    │
//!            ▼                                                  │
//!         Backoff ── cancelled ──► Abandoned                    │
//!            └──────────── slept, interval doubled ─────────────┘
//! ```
//!
//! `maxFlushExceptions <= 0` removes the budget: the loop then ends only on
//! success or cancellation.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::submit::{Submission, Submitter};
use crate::types::Record;

/// Backoff and budget settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First sleep between rounds
    pub initial_interval: Duration,
    /// Sleep ceiling
    pub max_interval: Duration,
    /// Rounds with failures allowed before giving up (`<= 0` = unbounded)
    pub max_flush_exceptions: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(128),
            max_flush_exceptions: 10,
        }
    }
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(initial_interval: Duration, max_interval: Duration, max_flush_exceptions: i64) -> Self {
        Self {
            initial_interval,
            max_interval,
            max_flush_exceptions,
        }
    }

    /// Interval following `current`: doubled, capped at the maximum
    pub fn next_interval(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_interval)
    }

    /// Whether `attempts` failed rounds exceed the budget
    pub fn is_exhausted(&self, attempts: u64) -> bool {
        self.max_flush_exceptions > 0 && attempts > self.max_flush_exceptions as u64
    }

    /// Whether retries are unbounded
    pub fn is_unbounded(&self) -> bool {
        self.max_flush_exceptions <= 0
    }

    /// The sleep sequence between consecutive failed rounds
    pub fn intervals(&self) -> impl Iterator<Item = Duration> {
        let policy = *self;
        std::iter::successors(Some(self.initial_interval), move |d| {
            Some(policy.next_interval(*d))
        })
    }
}

/// What happened to one batch.
///
/// `written + ignored + fatal + exhausted + abandoned == records`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Records handed in
    pub records: usize,
    /// Records written
    pub written: usize,
    /// Records dropped as ignorable
    pub ignored: usize,
    /// Records dropped as fatal
    pub fatal: usize,
    /// Records dropped because the retry budget ran out
    pub exhausted: usize,
    /// Records left behind by cancellation
    pub abandoned: usize,
    /// Submission rounds run
    pub rounds: u32,
    /// Backoff sleeps completed
    pub sleeps: u32,
    /// Total time slept between rounds
    pub backoff: Duration,
    /// Rounds in which no connection could be acquired
    pub pool_failures: u32,
}

impl BatchOutcome {
    fn starting(records: usize) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    /// Outcome for records never submitted because the sink was stopping
    pub fn abandoned(records: usize) -> Self {
        Self {
            records,
            abandoned: records,
            ..Default::default()
        }
    }

    /// Sum of every terminal category
    pub fn accounted(&self) -> usize {
        self.written + self.ignored + self.fatal + self.exhausted + self.abandoned
    }

    /// Whether every record was written, ignored or fatally dropped
    pub fn is_settled(&self) -> bool {
        self.exhausted == 0 && self.abandoned == 0
    }

    /// Fold another outcome into this one
    pub fn merge(&mut self, other: &BatchOutcome) {
        self.records += other.records;
        self.written += other.written;
        self.ignored += other.ignored;
        self.fatal += other.fatal;
        self.exhausted += other.exhausted;
        self.abandoned += other.abandoned;
        self.rounds += other.rounds;
        self.sleeps += other.sleeps;
        self.backoff += other.backoff;
        self.pool_failures += other.pool_failures;
    }

    fn absorb(&mut self, submission: &Submission) {
        self.rounds += 1;
        self.written += submission.written;
        self.ignored += submission.ignored;
        self.fatal += submission.fatal;
        if submission.pool_failure {
            self.pool_failures += 1;
        }
    }
}

/// Runs the submission engine until a batch settles, runs out of budget or is cancelled
#[derive(Clone)]
pub struct RetryController {
    submitter: Submitter,
    policy: RetryPolicy,
}

impl RetryController {
    /// Create a controller
    pub fn new(submitter: Submitter, policy: RetryPolicy) -> Self {
        Self { submitter, policy }
    }

    /// Retry policy in use
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Submit `batch`, retrying the retryable subset with exponential backoff.
    ///
    /// `stop` is observed before and during each backoff sleep; an execution
    /// already in flight is never interrupted.
    pub async fn retrying_submit(&self, batch: Vec<Record>, stop: &CancellationToken) -> BatchOutcome {
        let mut outcome = BatchOutcome::starting(batch.len());
        let mut working = batch;
        let mut attempts: u64 = 0;
        let mut interval = self.policy.initial_interval;

        loop {
            let submission = self.submitter.submit(working).await;
            outcome.absorb(&submission);
            working = submission.retry;

            if working.is_empty() {
                break;
            }

            attempts += 1;
            if self.policy.is_exhausted(attempts) {
                error!(
                    remaining = working.len(),
                    attempts,
                    max_flush_exceptions = self.policy.max_flush_exceptions,
                    "Retry budget exhausted, dropping records"
                );
                outcome.exhausted = working.len();
                break;
            }

            warn!(
                remaining = working.len(),
                attempts,
                backoff_ms = interval.as_millis() as u64,
                "Records failed, retrying after backoff"
            );

            if !sleep_or_cancel(interval, stop).await {
                debug!(remaining = working.len(), "Retry loop cancelled");
                outcome.abandoned = working.len();
                break;
            }
            outcome.sleeps += 1;
            outcome.backoff += interval;
            interval = self.policy.next_interval(interval);
        }

        outcome
    }
}

/// Sleep for `interval`; `false` if `stop` fired first
async fn sleep_or_cancel(interval: Duration, stop: &CancellationToken) -> bool {
    if stop.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(interval) => true,
    }
}

//! Testing utilities
//!
//! An in-memory driver for exercising the sink without a database.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_sqlsink::testing::*;
//!
//! let factory = MockConnectionFactory::new().with_script(|stmt| {
//!     match stmt.params.first() {
//!         Some(Param::Integer(2)) => Err(Error::store("23505", "duplicate key")),
//!         _ => Ok(1),
//!     }
//! });
//! let pool = factory.pool(PoolConfig::new("mock://db"))?;
//! ```
//!
//! Executions that succeed are recorded as committed right away on
//! auto-commit connections; otherwise they wait for `commit()`, and are
//! discarded if the commit fails or the connection closes first.
//!
//! [`LogCapture`] collects formatted `tracing` output so tests can assert on
//! what was logged and at which level.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::io;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::fmt::MakeWriter;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, PreparedStatement};
use crate::error::{Error, Result};
use crate::pool::{PoolConfig, SimpleConnectionPool};
use crate::types::Param;

/// One statement execution seen by the mock driver
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    /// SQL as prepared
    pub sql: String,
    /// Bound parameters
    pub params: Vec<Param>,
    /// Id of the connection it ran on (1-based, in open order)
    pub connection: usize,
}

type Script = dyn Fn(&ExecutedStatement) -> Result<u64> + Send + Sync;

struct MockState {
    script: Mutex<Arc<Script>>,
    connect_failures: AtomicUsize,
    commit_failures: AtomicUsize,
    valid: AtomicBool,
    executed: Mutex<Vec<ExecutedStatement>>,
    committed: Mutex<Vec<ExecutedStatement>>,
    prepared: Mutex<Vec<String>>,
    connections_opened: AtomicUsize,
    statements_closed: AtomicUsize,
    commits: AtomicUsize,
}

impl MockState {
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

/// Connection factory backed by a script instead of a database
#[derive(Clone)]
pub struct MockConnectionFactory {
    state: Arc<MockState>,
}

impl Default for MockConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockConnectionFactory {
    /// Create a factory whose statements all succeed, affecting one row
    pub fn new() -> Self {
        let script: Arc<Script> = Arc::new(|_: &ExecutedStatement| -> Result<u64> { Ok(1) });
        Self {
            state: Arc::new(MockState {
                script: Mutex::new(script),
                connect_failures: AtomicUsize::new(0),
                commit_failures: AtomicUsize::new(0),
                valid: AtomicBool::new(true),
                executed: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
                prepared: Mutex::new(Vec::new()),
                connections_opened: AtomicUsize::new(0),
                statements_closed: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
            }),
        }
    }

    /// Decide the outcome of every execution
    pub fn with_script<F>(self, script: F) -> Self
    where
        F: Fn(&ExecutedStatement) -> Result<u64> + Send + Sync + 'static,
    {
        *self.state.script.lock() = Arc::new(script);
        self
    }

    /// Make the next `n` connection attempts fail
    pub fn fail_connects(self, n: usize) -> Self {
        self.state.connect_failures.store(n, Ordering::Release);
        self
    }

    /// Make every connection attempt fail until [`Self::allow_connects`]
    pub fn fail_all_connects(self) -> Self {
        self.state
            .connect_failures
            .store(usize::MAX, Ordering::Release);
        self
    }

    /// Let connection attempts succeed again
    pub fn allow_connects(&self) {
        self.state.connect_failures.store(0, Ordering::Release);
    }

    /// Make the next `n` commits fail
    pub fn fail_commits(self, n: usize) -> Self {
        self.state.commit_failures.store(n, Ordering::Release);
        self
    }

    /// Report open connections as valid or broken
    pub fn set_valid(&self, valid: bool) {
        self.state.valid.store(valid, Ordering::Release);
    }

    /// Pool over this factory
    pub fn pool(&self, config: PoolConfig) -> Result<Arc<SimpleConnectionPool>> {
        SimpleConnectionPool::new(config, Arc::new(self.clone()))
    }

    /// Every execution, in order
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state.executed.lock().clone()
    }

    /// Successful executions that were committed, in order
    pub fn committed(&self) -> Vec<ExecutedStatement> {
        self.state.committed.lock().clone()
    }

    /// SQL of every prepare call, in order
    pub fn prepared(&self) -> Vec<String> {
        self.state.prepared.lock().clone()
    }

    /// Number of executions
    pub fn execution_count(&self) -> usize {
        self.state.executed.lock().len()
    }

    /// Number of physical connections opened
    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::Acquire)
    }

    /// Number of statements closed
    pub fn statements_closed(&self) -> usize {
        self.state.statements_closed.load(Ordering::Acquire)
    }

    /// Number of successful commits
    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::Acquire)
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        if MockState::take_failure(&self.state.connect_failures) {
            return Err(Error::connection("mock connection refused"));
        }
        let id = self.state.connections_opened.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(Box::new(MockConnection {
            id,
            auto_commit: config.auto_commit,
            state: Arc::clone(&self.state),
            pending: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }))
    }

    fn driver_name(&self) -> &str {
        "mock"
    }
}

struct MockConnection {
    id: usize,
    auto_commit: bool,
    state: Arc<MockState>,
    pending: Arc<Mutex<Vec<ExecutedStatement>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::connection("connection is closed"));
        }
        self.state.prepared.lock().push(sql.to_string());
        Ok(Box::new(MockStatement {
            sql: sql.to_string(),
            connection: self.id,
            auto_commit: self.auto_commit,
            state: Arc::clone(&self.state),
            pending: Arc::clone(&self.pending),
        }))
    }

    async fn commit(&self) -> Result<()> {
        let pending: Vec<_> = std::mem::take(&mut *self.pending.lock());
        if MockState::take_failure(&self.state.commit_failures) {
            return Err(Error::store("40001", "could not serialize access"));
        }
        self.state.committed.lock().extend(pending);
        self.state.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.state.valid.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.pending.lock().clear();
        Ok(())
    }
}

struct MockStatement {
    sql: String,
    connection: usize,
    auto_commit: bool,
    state: Arc<MockState>,
    pending: Arc<Mutex<Vec<ExecutedStatement>>>,
}

#[async_trait]
impl PreparedStatement for MockStatement {
    async fn execute(&self, params: &[Param]) -> Result<u64> {
        let executed = ExecutedStatement {
            sql: self.sql.clone(),
            params: params.to_vec(),
            connection: self.connection,
        };
        self.state.executed.lock().push(executed.clone());

        let script = Arc::clone(&*self.state.script.lock());
        let rows = (*script)(&executed)?;

        if self.auto_commit {
            self.state.committed.lock().push(executed);
        } else {
            self.pending.lock().push(executed);
        }
        Ok(rows)
    }

    fn sql(&self) -> &str {
        &self.sql
    }

    async fn close(&self) -> Result<()> {
        self.state.statements_closed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// In-memory sink for formatted log lines
///
/// ```rust,ignore
/// let logs = LogCapture::default();
/// let _guard = logs.set_default();
/// tracing::warn!("duplicate");
/// assert_eq!(logs.lines_at(Level::WARN).len(), 1);
/// ```
#[derive(Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Install a plain-text subscriber writing here for the current thread
    pub fn set_default(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(Level::TRACE)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Everything logged so far
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }

    /// Lines logged at exactly `level`
    pub fn lines_at(&self, level: Level) -> Vec<String> {
        let marker = format!(" {} ", level);
        self.contents()
            .lines()
            .filter(|line| line.contains(&marker))
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.lock().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

//! Connection pool for rivven-sqlsink
//!
//! A semaphore bounds the number of physical connections (`maxPoolSize`);
//! waiting for a permit is bounded by `connectionTimeoutMs`. Idle
//! connections are validated on borrow and recycled once they pass their
//! maximum lifetime or idle timeout.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_sqlsink::prelude::*;
//!
//! let pool = SimpleConnectionPool::new(
//!     PoolConfig::new("postgres://localhost/db").with_max_size(5),
//!     Arc::new(PgConnectionFactory),
//! )?;
//!
//! let conn = pool.get().await?;
//! let stmt = conn.prepare("INSERT INTO logs (msg) VALUES (?)").await?;
//! stmt.execute(&[Param::Text("hello".into())]).await?;
//! conn.release().await;
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};

/// Connection pool trait
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Get a connection from the pool
    async fn get(&self) -> Result<PooledConnection>;

    /// Return a connection to the pool
    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant);

    /// Account for a borrowed connection that was dropped without being returned
    fn discard_connection(&self);

    /// Get current pool size
    fn size(&self) -> usize;

    /// Get number of idle connections
    fn idle(&self) -> usize;

    /// Get number of connections in use
    fn in_use(&self) -> usize {
        self.size().saturating_sub(self.idle())
    }

    /// Get pool statistics
    fn stats(&self) -> PoolStats;

    /// Close all connections and shutdown the pool
    async fn close(&self) -> Result<()>;
}

/// A connection borrowed from the pool.
///
/// Give it back with [`PooledConnection::release`]. Dropping it also
/// returns it, from a spawned task when a runtime is available.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    created_at: Instant,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<dyn ConnectionPool>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Wrap a connection checked out of `pool`
    pub fn new(
        conn: Box<dyn Connection>,
        created_at: Instant,
        permit: Option<OwnedSemaphorePermit>,
        pool: Arc<dyn ConnectionPool>,
    ) -> Self {
        Self {
            conn: Some(conn),
            created_at,
            permit,
            pool,
        }
    }

    /// Return the connection to the pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.return_connection(conn, self.created_at).await;
        }
        // permit is released after the connection is idle again
        self.permit.take();
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        // conn is only taken by release() and drop(), both of which consume self
        self.conn
            .as_deref()
            .expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let pool = self.pool.clone();
        let permit = self.permit.take();
        let created_at = self.created_at;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    pool.return_connection(conn, created_at).await;
                    drop(permit);
                });
            }
            Err(_) => {
                drop(conn);
                pool.discard_connection();
                drop(permit);
            }
        }
    }
}

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection configuration
    pub connection: ConnectionConfig,
    /// Maximum pool size
    pub max_size: usize,
    /// Maximum time to wait for a connection
    pub acquire_timeout: Duration,
    /// Maximum connection lifetime (for recycling)
    pub max_lifetime: Duration,
    /// Idle timeout (connections idle longer are closed)
    pub idle_timeout: Duration,
    /// Whether to test connections on borrow
    pub test_on_borrow: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_size: 5,
            acquire_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            idle_timeout: Duration::from_secs(600),  // 10 minutes
            test_on_borrow: true,
        }
    }
}

impl PoolConfig {
    /// Create pool config from a connection URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionConfig::new(url),
            ..Default::default()
        }
    }

    /// Create pool config around an existing connection config
    pub fn from_connection(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Set maximum pool size
    pub fn with_max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Set acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set maximum connection lifetime
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of connection acquisitions
    pub acquisitions: u64,
    /// Number of failed acquisitions (timeout or connect failure)
    pub acquire_failures: u64,
    /// Total wait time for connections (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Number of health check failures
    pub health_check_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub acquire_failures: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub health_check_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    fn record_acquire_failure(&self) {
        self.acquire_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn record_health_check_failure(&self) {
        self.health_check_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            acquire_failures: self.acquire_failures.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            health_check_failures: self.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// Semaphore-bounded connection pool.
///
/// Connections are opened lazily on first demand and kept LIFO in the idle
/// list. A failed connect releases its permit, so the next `get` tries again.
pub struct SimpleConnectionPool {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PoolEntry>>,
    idle_count: AtomicUsize,
    semaphore: Arc<Semaphore>,
    total_connections: AtomicUsize,
    stats: AtomicPoolStats,
    shutdown: AtomicBool,
    self_ref: Weak<Self>,
}

struct PoolEntry {
    conn: Box<dyn Connection>,
    created_at: Instant,
    last_used: Instant,
}

impl SimpleConnectionPool {
    /// Create a new connection pool.
    pub fn new(config: PoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Arc<Self>> {
        if config.max_size == 0 {
            return Err(Error::config("pool max_size must be at least 1"));
        }

        Ok(Arc::new_cyclic(|self_ref| Self {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            idle_count: AtomicUsize::new(0),
            total_connections: AtomicUsize::new(0),
            stats: AtomicPoolStats::new(),
            shutdown: AtomicBool::new(false),
            self_ref: self_ref.clone(),
            config,
            factory,
        }))
    }

    async fn create_connection(&self) -> Result<Box<dyn Connection>> {
        let timeout = Duration::from_millis(self.config.connection.connect_timeout_ms.max(1));
        let conn = tokio::time::timeout(timeout, self.factory.connect(&self.config.connection))
            .await
            .map_err(|_| {
                Error::timeout(format!("connect timed out after {}ms", timeout.as_millis()))
            })??;
        self.total_connections.fetch_add(1, Ordering::AcqRel);
        self.stats.record_created();
        debug!(
            driver = self.factory.driver_name(),
            size = self.size(),
            "Opened pooled connection"
        );
        Ok(conn)
    }

    fn forget_connection(&self) {
        self.total_connections.fetch_sub(1, Ordering::AcqRel);
        self.stats.record_closed();
    }

    fn should_recycle(&self, entry: &PoolEntry) -> bool {
        entry.created_at.elapsed() > self.config.max_lifetime
            || entry.last_used.elapsed() > self.config.idle_timeout
    }

    /// Pop idle connections until one is usable
    async fn take_idle(&self) -> Option<PoolEntry> {
        loop {
            let entry = {
                let mut idle = self.idle.lock().await;
                let entry = idle.pop()?;
                self.idle_count.store(idle.len(), Ordering::Release);
                entry
            };

            if self.should_recycle(&entry) {
                let _ = entry.conn.close().await;
                self.forget_connection();
                continue;
            }
            if self.config.test_on_borrow && !entry.conn.is_valid().await {
                warn!(
                    driver = self.factory.driver_name(),
                    "Discarding pooled connection that failed validation"
                );
                let _ = entry.conn.close().await;
                self.forget_connection();
                self.stats.record_health_check_failure();
                continue;
            }
            return Some(entry);
        }
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

#[async_trait]
impl ConnectionPool for SimpleConnectionPool {
    async fn get(&self) -> Result<PooledConnection> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::PoolExhausted {
                message: "pool is shut down".to_string(),
            });
        }

        let start = Instant::now();

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            self.stats.record_acquire_failure();
            Error::PoolExhausted {
                message: format!(
                    "timeout waiting for connection ({}ms)",
                    self.config.acquire_timeout.as_millis()
                ),
            }
        })?
        .map_err(|_| Error::PoolExhausted {
            message: "pool semaphore closed".to_string(),
        })?;

        let (conn, created_at) = match self.take_idle().await {
            Some(entry) => (entry.conn, entry.created_at),
            None => match self.create_connection().await {
                Ok(conn) => (conn, Instant::now()),
                Err(e) => {
                    self.stats.record_acquire_failure();
                    return Err(e);
                }
            },
        };

        self.stats
            .record_acquisition(start.elapsed().as_millis() as u64);

        let pool = self.self_ref.upgrade().ok_or_else(|| Error::PoolExhausted {
            message: "pool has been dropped".to_string(),
        })?;
        let pool: Arc<dyn ConnectionPool> = pool;

        Ok(PooledConnection::new(conn, created_at, Some(permit), pool))
    }

    async fn return_connection(&self, conn: Box<dyn Connection>, created_at: Instant) {
        if self.shutdown.load(Ordering::Acquire) {
            let _ = conn.close().await;
            self.forget_connection();
            return;
        }

        let mut idle = self.idle.lock().await;
        idle.push(PoolEntry {
            conn,
            created_at,
            last_used: Instant::now(),
        });
        self.idle_count.store(idle.len(), Ordering::Release);
    }

    fn discard_connection(&self) {
        self.forget_connection();
    }

    fn size(&self) -> usize {
        self.total_connections.load(Ordering::Acquire)
    }

    fn idle(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Release);

        let mut idle = self.idle.lock().await;
        for entry in idle.drain(..) {
            let _ = entry.conn.close().await;
            self.forget_connection();
        }
        self.idle_count.store(0, Ordering::Release);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new("postgres://localhost/test")
            .with_max_size(20)
            .with_acquire_timeout(Duration::from_secs(10))
            .with_idle_timeout(Duration::from_secs(60))
            .with_test_on_borrow(false);

        assert_eq!(config.max_size, 20);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert!(!config.test_on_borrow);
    }

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, 5);
        assert_eq!(config.acquire_timeout, Duration::from_millis(10_000));
        assert!(config.test_on_borrow);
    }

    #[test]
    fn test_atomic_pool_stats() {
        let stats = AtomicPoolStats::new();

        stats.record_created();
        stats.record_created();
        stats.record_acquisition(100);
        stats.record_acquisition(200);
        stats.record_closed();
        stats.record_acquire_failure();
        stats.record_health_check_failure();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.connections_created, 2);
        assert_eq!(snapshot.connections_closed, 1);
        assert_eq!(snapshot.acquisitions, 2);
        assert_eq!(snapshot.total_wait_time_ms, 300);
        assert_eq!(snapshot.acquire_failures, 1);
        assert_eq!(snapshot.health_check_failures, 1);
    }
}

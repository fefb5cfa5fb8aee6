//! PostgreSQL backend implementation for rivven-sqlsink
//!
//! - Connection strings: `postgres://`, `postgresql://` and
//!   `jdbc:postgresql://`; JDBC-only query options are dropped
//! - `?` placeholders are rewritten to `$n`
//! - Prepared statements are cached per connection in a bounded LRU
//! - Parameters are converted client-side to the column type the server
//!   inferred; a value that cannot be converted fails with the SQLSTATE the
//!   server would have raised for it
//! - With auto-commit off, work runs inside `BEGIN`/`COMMIT` and every
//!   record gets its own savepoint, so one failed record does not abort the
//!   records around it; if a savepoint cannot be released or rolled back
//!   the transaction is marked failed and `commit()` rolls it back and
//!   returns an error

use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tracing::{debug, warn};

use crate::connection::{redact_url, Connection, ConnectionConfig, ConnectionFactory, PreparedStatement};
use crate::error::{Error, Result, StoreError};
use crate::types::Param;

const SAVEPOINT: &str = "rivven_sqlsink_record";

/// URL query options understood by tokio-postgres
const PG_OPTIONS: &[&str] = &[
    "user",
    "password",
    "dbname",
    "options",
    "application_name",
    "sslmode",
    "host",
    "hostaddr",
    "port",
    "connect_timeout",
    "tcp_user_timeout",
    "keepalives",
    "keepalives_idle",
    "target_session_attrs",
    "channel_binding",
];

/// Build a tokio-postgres config from a connection config
pub fn pg_config(config: &ConnectionConfig) -> Result<tokio_postgres::Config> {
    let raw = config.url.strip_prefix("jdbc:").unwrap_or(&config.url);
    let mut url = url::Url::parse(raw).map_err(|e| {
        Error::config(format!(
            "invalid connection string {}: {}",
            redact_url(&config.url),
            e
        ))
    })?;
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(Error::config(format!(
            "not a PostgreSQL connection string: {}",
            redact_url(&config.url)
        )));
    }

    let mut options = Vec::new();
    for (key, value) in url.query_pairs() {
        let key = match key.as_ref() {
            "ApplicationName" => "application_name",
            "connectTimeout" => "connect_timeout",
            "currentSchema" => {
                options.push(("options".to_string(), format!("-c search_path={}", value)));
                continue;
            }
            other if PG_OPTIONS.contains(&other) => other,
            other => {
                debug!(option = other, "Ignoring unsupported connection string option");
                continue;
            }
        };
        options.push((key.to_string(), value.into_owned()));
    }
    if options.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(options);
    }

    let mut pg = tokio_postgres::Config::from_str(url.as_str()).map_err(|e| {
        Error::config(format!(
            "invalid connection string {}: {}",
            redact_url(&config.url),
            e
        ))
    })?;

    if let Some(user) = &config.username {
        pg.user(user);
    }
    if let Some(password) = &config.password {
        pg.password(password.expose_secret());
    }
    if let Some(name) = &config.application_name {
        if pg.get_application_name().is_none() {
            pg.application_name(name);
        }
    }
    if pg.get_connect_timeout().is_none() && config.connect_timeout_ms > 0 {
        pg.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
    }
    Ok(pg)
}

/// Rewrite `?` placeholders to `$1..$n`, skipping quoted text and comments
pub fn rewrite_placeholders(sql: &str) -> String {
    enum State {
        Code,
        Single,
        Double,
        Line,
        Block,
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut state = State::Code;
    let mut index = 0;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '?' => {
                    index += 1;
                    out.push('$');
                    out.push_str(&index.to_string());
                    continue;
                }
                '\'' => state = State::Single,
                '"' => state = State::Double,
                '-' if chars.peek() == Some(&'-') => state = State::Line,
                '/' if chars.peek() == Some(&'*') => state = State::Block,
                _ => {}
            },
            State::Single if c == '\'' => state = State::Code,
            State::Double if c == '"' => state = State::Code,
            State::Line if c == '\n' => state = State::Code,
            State::Block if c == '*' && chars.peek() == Some(&'/') => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
                state = State::Code;
                continue;
            }
            _ => {}
        }
        out.push(c);
    }
    out
}

/// Map a tokio-postgres error to the crate error
fn map_pg_error(err: tokio_postgres::Error, sql: &str) -> Error {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        let mut store = StoreError::new(code, db.message());
        if let Some(detail) = db.detail() {
            store = store.with_chained(StoreError::new(code, detail));
        }
        if let Some(hint) = db.hint() {
            store = store.with_chained(StoreError::new(code, hint));
        }
        if let Some(context) = db.where_() {
            store = store.with_chained(StoreError::new(code, context));
        }
        return Error::Store(store);
    }
    if err.is_closed() {
        return Error::connection_with_source("connection closed", err);
    }
    Error::statement_with_source(format!("failed to run `{}`", sql), err)
}

/// A parameter converted to the column type the server expects
#[derive(Debug, Clone, PartialEq)]
enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Numeric(Decimal),
    Text(String),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
}

impl ToSql for PgValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            Self::Null => Ok(IsNull::Yes),
            Self::Bool(v) => v.to_sql(ty, out),
            Self::Int2(v) => v.to_sql(ty, out),
            Self::Int4(v) => v.to_sql(ty, out),
            Self::Int8(v) => v.to_sql(ty, out),
            Self::Float4(v) => v.to_sql(ty, out),
            Self::Float8(v) => v.to_sql(ty, out),
            Self::Numeric(v) => v.to_sql(ty, out),
            Self::Text(v) => v.to_sql(ty, out),
            Self::Timestamp(v) => v.to_sql(ty, out),
            Self::TimestampTz(v) => v.to_sql(ty, out),
            Self::Date(v) => v.to_sql(ty, out),
            Self::Time(v) => v.to_sql(ty, out),
            Self::Uuid(v) => v.to_sql(ty, out),
            Self::Json(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn invalid(sqlstate: &str, ty: &Type, input: &str) -> Error {
    Error::Store(StoreError::new(
        sqlstate,
        format!("invalid input syntax for type {}: \"{}\"", ty, input),
    ))
}

fn out_of_range(ty: &Type, input: impl std::fmt::Display) -> Error {
    Error::Store(StoreError::new(
        "22003",
        format!("value {} is out of range for type {}", input, ty),
    ))
}

fn integer(n: i64, ty: &Type) -> Result<PgValue> {
    match *ty {
        Type::INT2 => i16::try_from(n)
            .map(PgValue::Int2)
            .map_err(|_| out_of_range(ty, n)),
        Type::INT4 => i32::try_from(n)
            .map(PgValue::Int4)
            .map_err(|_| out_of_range(ty, n)),
        _ => Ok(PgValue::Int8(n)),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" | "on" | "1" => Some(true),
        "f" | "false" | "n" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    parse_naive_datetime(s).map(|ts| ts.and_utc())
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Convert text to the column type, the way the server parses literals
fn from_text(s: &str, ty: &Type) -> Result<PgValue> {
    match *ty {
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Ok(PgValue::Text(s.to_string()))
        }
        Type::BOOL => parse_bool(s)
            .map(PgValue::Bool)
            .ok_or_else(|| invalid("22P02", ty, s)),
        Type::INT2 | Type::INT4 | Type::INT8 => {
            let n = s.trim().parse::<i64>().map_err(|_| invalid("22P02", ty, s))?;
            integer(n, ty)
        }
        Type::FLOAT4 => s
            .trim()
            .parse::<f32>()
            .map(PgValue::Float4)
            .map_err(|_| invalid("22P02", ty, s)),
        Type::FLOAT8 => s
            .trim()
            .parse::<f64>()
            .map(PgValue::Float8)
            .map_err(|_| invalid("22P02", ty, s)),
        Type::NUMERIC => Decimal::from_str(s.trim())
            .or_else(|_| Decimal::from_scientific(s.trim()))
            .map(PgValue::Numeric)
            .map_err(|_| invalid("22P02", ty, s)),
        Type::TIMESTAMP => parse_naive_datetime(s)
            .or_else(|| parse_datetime(s).map(|ts| ts.naive_utc()))
            .map(PgValue::Timestamp)
            .ok_or_else(|| invalid("22007", ty, s)),
        Type::TIMESTAMPTZ => parse_datetime(s)
            .map(PgValue::TimestampTz)
            .ok_or_else(|| invalid("22007", ty, s)),
        Type::DATE => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .ok()
            .or_else(|| parse_naive_datetime(s).map(|ts| ts.date()))
            .map(PgValue::Date)
            .ok_or_else(|| invalid("22007", ty, s)),
        Type::TIME => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
            .or_else(|_| NaiveTime::parse_from_str(s.trim(), "%H:%M"))
            .map(PgValue::Time)
            .map_err(|_| invalid("22007", ty, s)),
        Type::UUID => uuid::Uuid::parse_str(s.trim())
            .map(PgValue::Uuid)
            .map_err(|_| invalid("22P02", ty, s)),
        Type::JSON | Type::JSONB => serde_json::from_str(s)
            .map(PgValue::Json)
            .map_err(|_| invalid("22P02", ty, s)),
        // enums, citext and friends take text in binary form
        _ => Ok(PgValue::Text(s.to_string())),
    }
}

/// Convert one bound parameter for a column of type `ty`
fn coerce(param: &Param, ty: &Type) -> Result<PgValue> {
    match param {
        Param::Null => Ok(PgValue::Null),
        Param::Boolean(b) => match *ty {
            Type::BOOL => Ok(PgValue::Bool(*b)),
            _ => from_text(&b.to_string(), ty),
        },
        Param::Integer(n) => match *ty {
            Type::INT2 | Type::INT4 | Type::INT8 => integer(*n, ty),
            Type::FLOAT4 => Ok(PgValue::Float4(*n as f32)),
            Type::FLOAT8 => Ok(PgValue::Float8(*n as f64)),
            Type::NUMERIC => Ok(PgValue::Numeric(Decimal::from(*n))),
            _ => from_text(&n.to_string(), ty),
        },
        Param::Float(f) => match *ty {
            Type::FLOAT4 => Ok(PgValue::Float4(*f as f32)),
            Type::FLOAT8 => Ok(PgValue::Float8(*f)),
            Type::NUMERIC => Decimal::try_from(*f)
                .map(PgValue::Numeric)
                .map_err(|_| invalid("22P02", ty, &f.to_string())),
            Type::INT2 | Type::INT4 | Type::INT8 => {
                let rounded = f.round();
                if !rounded.is_finite() || rounded < i64::MIN as f64 || rounded > i64::MAX as f64 {
                    return Err(out_of_range(ty, f));
                }
                integer(rounded as i64, ty)
            }
            _ => from_text(&f.to_string(), ty),
        },
        Param::Text(s) => from_text(s, ty),
    }
}

fn coerce_all(params: &[Param], types: &[Type]) -> Result<Vec<PgValue>> {
    if params.len() < types.len() {
        return Err(Error::Store(StoreError::new(
            "22023",
            format!("no value specified for parameter {}", params.len() + 1),
        )));
    }
    if params.len() > types.len() {
        return Err(Error::Store(StoreError::new(
            "22023",
            format!(
                "parameter index out of range: {}, number of parameters: {}",
                types.len() + 1,
                types.len()
            ),
        )));
    }
    params
        .iter()
        .zip(types)
        .map(|(param, ty)| coerce(param, ty))
        .collect()
}

/// Bounded least-recently-used cache keyed by SQL text, `None` when disabled
fn bounded_cache<V>(capacity: usize) -> Option<Mutex<LruCache<String, V>>> {
    NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap)))
}

/// Transaction state shared by a connection and its statements
#[derive(Debug, Default)]
struct TxState {
    active: AtomicBool,
    failed: AtomicBool,
}

impl TxState {
    /// Mark the transaction open, `true` if `BEGIN` still has to be sent
    fn begin(&self) -> bool {
        !self.active.swap(true, Ordering::AcqRel)
    }

    /// `BEGIN` did not go through
    fn abort_begin(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// The server-side transaction is aborted and can only roll back
    fn mark_failed(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Close the transaction for commit.
    ///
    /// `Ok(false)` when none is open, `Ok(true)` when it can be committed,
    /// and a retryable `25P02` error when it must be rolled back instead.
    fn take_for_commit(&self) -> Result<bool> {
        let active = self.active.swap(false, Ordering::AcqRel);
        let failed = self.failed.swap(false, Ordering::AcqRel);
        match (active, failed) {
            (false, _) => Ok(false),
            (true, true) => Err(Error::store(
                "25P02",
                "transaction aborted after a savepoint failure, rolled back",
            )),
            (true, false) => Ok(true),
        }
    }

    /// Close the transaction without committing, `true` if one was open
    fn take_for_rollback(&self) -> bool {
        self.failed.store(false, Ordering::Release);
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    auto_commit: bool,
    tx: Arc<TxState>,
    closed: AtomicBool,
    cache: Option<Mutex<LruCache<String, tokio_postgres::Statement>>>,
}

impl PgConnection {
    /// Wrap a tokio-postgres client; a `cache_size` of 0 disables statement caching
    pub fn new(client: tokio_postgres::Client, auto_commit: bool, cache_size: usize) -> Self {
        Self {
            client: Arc::new(client),
            auto_commit,
            tx: Arc::new(TxState::default()),
            closed: AtomicBool::new(false),
            cache: bounded_cache(cache_size),
        }
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }

        let cached = self
            .cache
            .as_ref()
            .and_then(|cache| cache.lock().get(sql).cloned());
        let statement = match cached {
            Some(stmt) => stmt,
            None => {
                let stmt = self
                    .client
                    .prepare(&rewrite_placeholders(sql))
                    .await
                    .map_err(|e| map_pg_error(e, sql))?;
                if let Some(cache) = &self.cache {
                    cache.lock().put(sql.to_string(), stmt.clone());
                }
                stmt
            }
        };

        Ok(Box::new(PgStatement {
            client: Arc::clone(&self.client),
            statement,
            sql: sql.to_string(),
            auto_commit: self.auto_commit,
            tx: Arc::clone(&self.tx),
        }))
    }

    async fn commit(&self) -> Result<()> {
        if self.auto_commit {
            return Ok(());
        }
        match self.tx.take_for_commit() {
            Ok(false) => Ok(()),
            Ok(true) => self
                .client
                .batch_execute("COMMIT")
                .await
                .map_err(|e| map_pg_error(e, "COMMIT")),
            Err(e) => {
                if let Err(rollback) = self.client.batch_execute("ROLLBACK").await {
                    warn!(error = %rollback, "Failed to roll back aborted transaction");
                }
                Err(e)
            }
        }
    }

    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        if self.tx.take_for_rollback() && !self.client.is_closed() {
            let _ = self.client.batch_execute("ROLLBACK").await;
        }
        Ok(())
    }
}

/// PostgreSQL prepared statement
pub struct PgStatement {
    client: Arc<tokio_postgres::Client>,
    statement: tokio_postgres::Statement,
    sql: String,
    auto_commit: bool,
    tx: Arc<TxState>,
}

impl PgStatement {
    async fn run(&self, values: &[PgValue]) -> Result<u64> {
        let refs: Vec<&(dyn ToSql + Sync)> =
            values.iter().map(|v| v as &(dyn ToSql + Sync)).collect();
        self.client
            .execute(&self.statement, &refs)
            .await
            .map_err(|e| map_pg_error(e, &self.sql))
    }

    async fn simple(&self, sql: &str) -> Result<()> {
        self.client
            .batch_execute(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))
    }
}

#[async_trait]
impl PreparedStatement for PgStatement {
    async fn execute(&self, params: &[Param]) -> Result<u64> {
        let values = coerce_all(params, self.statement.params())?;

        if self.auto_commit {
            return self.run(&values).await;
        }

        if self.tx.begin() {
            if let Err(e) = self.simple("BEGIN").await {
                self.tx.abort_begin();
                return Err(e);
            }
        }

        if let Err(e) = self.simple(&format!("SAVEPOINT {}", SAVEPOINT)).await {
            self.tx.mark_failed();
            return Err(e);
        }
        match self.run(&values).await {
            Ok(rows) => {
                if let Err(e) = self
                    .simple(&format!("RELEASE SAVEPOINT {}", SAVEPOINT))
                    .await
                {
                    self.tx.mark_failed();
                    return Err(e);
                }
                Ok(rows)
            }
            Err(e) => {
                if let Err(rollback) = self
                    .simple(&format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT))
                    .await
                {
                    warn!(error = %rollback, "Failed to roll back to savepoint");
                    self.tx.mark_failed();
                }
                Err(e)
            }
        }
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let pg = pg_config(config)?;
        let (client, connection) = pg
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(Box::new(PgConnection::new(
            client,
            config.auto_commit,
            config.statement_cache_size,
        )))
    }

    fn driver_name(&self) -> &str {
        "postgres"
    }
}

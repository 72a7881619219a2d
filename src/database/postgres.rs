//! Postgres driver on top of sqlx.
//!
//! Arguments arrive as JSON values and are bound per variant; result rows are
//! decoded column by column back into JSON maps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Number, Value};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgQueryResult, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, Executor, PgPool, Postgres, Row};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::{validate_url, DatabaseConfig};
use crate::database::driver::{Driver, DriverConn, DriverStmt, DriverTx};
use crate::error::DbError;
use crate::types::{ExecResult, Row as JsonRow, Rows, TxOptions};

type SharedConn = Arc<PinnedConn>;
type SharedTx = Arc<Mutex<Option<sqlx::Transaction<'static, Postgres>>>>;

/// A reserved pool connection plus any transaction abandoned on it that still
/// needs a `ROLLBACK`
struct PinnedConn {
    conn: Mutex<PoolConnection<Postgres>>,
    rollback_pending: AtomicBool,
}

impl PinnedConn {
    fn new(conn: PoolConnection<Postgres>) -> SharedConn {
        Arc::new(Self { conn: Mutex::new(conn), rollback_pending: AtomicBool::new(false) })
    }

    /// Lock the connection, ending an abandoned transaction before anything else runs on it
    async fn acquire(&self) -> Result<MutexGuard<'_, PoolConnection<Postgres>>, DbError> {
        let mut conn = self.conn.lock().await;
        if self.rollback_pending.swap(false, Ordering::SeqCst) {
            debug!("Rolling back abandoned transaction before reusing the connection");
            (&mut **conn).execute("ROLLBACK").await?;
        }
        Ok(conn)
    }
}

/// Where a statement runs
#[derive(Clone)]
enum Target {
    Pool(PgPool),
    Conn(SharedConn),
    Tx(SharedTx),
}

impl Target {
    async fn execute(&self, sql: &str, args: &[Value]) -> Result<PgQueryResult, DbError> {
        let query = bind_all(sqlx::query(sql), args);
        let result = match self {
            Target::Pool(pool) => query.execute(pool).await?,
            Target::Conn(conn) => {
                let mut conn = conn.acquire().await?;
                query.execute(&mut **conn).await?
            }
            Target::Tx(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(DbError::TxDone)?;
                query.execute(&mut **tx).await?
            }
        };
        Ok(result)
    }

    async fn fetch(&self, sql: &str, args: &[Value]) -> Result<Vec<PgRow>, DbError> {
        let query = bind_all(sqlx::query(sql), args);
        let rows = match self {
            Target::Pool(pool) => query.fetch_all(pool).await?,
            Target::Conn(conn) => {
                let mut conn = conn.acquire().await?;
                query.fetch_all(&mut **conn).await?
            }
            Target::Tx(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(DbError::TxDone)?;
                query.fetch_all(&mut **tx).await?
            }
        };
        Ok(rows)
    }

    /// Ask the server to parse `sql`; sqlx keeps the statement in its per-connection cache
    async fn prepare(&self, sql: &str) -> Result<(), DbError> {
        match self {
            Target::Pool(pool) => {
                pool.prepare(sql).await?;
            }
            Target::Conn(conn) => {
                let mut conn = conn.acquire().await?;
                (&mut **conn).prepare(sql).await?;
            }
            Target::Tx(tx) => {
                let mut guard = tx.lock().await;
                let tx = guard.as_mut().ok_or(DbError::TxDone)?;
                (&mut **tx).prepare(sql).await?;
            }
        }
        Ok(())
    }

    async fn exec_result(&self, sql: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        let result = self.execute(sql, args).await?;
        Ok(ExecResult { rows_affected: result.rows_affected(), last_insert_id: None })
    }

    async fn rows(&self, sql: &str, args: &[Value]) -> Result<Rows, DbError> {
        let rows = self.fetch(sql, args).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn prepared(&self, sql: &str) -> Result<Arc<dyn DriverStmt>, DbError> {
        self.prepare(sql).await?;
        Ok(Arc::new(PgStmt {
            target: self.clone(),
            sql: sql.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Pool-backed Postgres driver
#[derive(Clone)]
pub struct PgDriver {
    pool: PgPool,
}

impl PgDriver {
    pub async fn connect(database_url: &str, config: &DatabaseConfig) -> Result<Self, DbError> {
        validate_url(database_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Driver for PgDriver {
    async fn ping(&self) -> Result<(), DbError> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        Target::Pool(self.pool.clone()).exec_result(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        Target::Pool(self.pool.clone()).rows(query, args).await
    }

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError> {
        Target::Pool(self.pool.clone()).prepared(query).await
    }

    async fn begin(&self, options: TxOptions) -> Result<Arc<dyn DriverTx>, DbError> {
        let mut tx = self.pool.begin().await?;
        if let Some(sql) = options.to_set_transaction() {
            (&mut *tx).execute(sql.as_str()).await?;
        }
        Ok(Arc::new(PgTx {
            target: Target::Tx(Arc::new(Mutex::new(Some(tx)))),
            finished: AtomicBool::new(false),
        }))
    }

    async fn conn(&self) -> Result<Arc<dyn DriverConn>, DbError> {
        let conn = self.pool.acquire().await?;
        Ok(Arc::new(PgConn { conn: PinnedConn::new(conn) }))
    }

    async fn close(&self) -> Result<(), DbError> {
        self.pool.close().await;
        debug!("Closed database pool");
        Ok(())
    }
}

/// One pooled connection reserved for the caller
pub struct PgConn {
    conn: SharedConn,
}

#[async_trait]
impl DriverConn for PgConn {
    async fn ping(&self) -> Result<(), DbError> {
        let mut conn = self.conn.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        Target::Conn(Arc::clone(&self.conn)).exec_result(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        Target::Conn(Arc::clone(&self.conn)).rows(query, args).await
    }

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError> {
        Target::Conn(Arc::clone(&self.conn)).prepared(query).await
    }

    async fn begin(&self, options: TxOptions) -> Result<Arc<dyn DriverTx>, DbError> {
        let target = Target::Conn(Arc::clone(&self.conn));
        target.execute("BEGIN", &[]).await?;
        if let Some(sql) = options.to_set_transaction() {
            if let Err(e) = target.execute(&sql, &[]).await {
                target.execute("ROLLBACK", &[]).await?;
                return Err(e);
            }
        }
        Ok(Arc::new(PgTx { target, finished: AtomicBool::new(false) }))
    }

    /// The connection goes back to the pool once every statement and
    /// transaction opened on it is dropped as well
    async fn close(&self) -> Result<(), DbError> {
        debug!("Releasing reserved connection");
        Ok(())
    }
}

/// Transaction on a pooled connection (`Target::Tx`) or on a reserved
/// connection through explicit `BEGIN`/`COMMIT` (`Target::Conn`)
pub struct PgTx {
    target: Target,
    finished: AtomicBool,
}

impl PgTx {
    fn ensure_open(&self) -> Result<(), DbError> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        Ok(())
    }

    async fn end(&self, commit: bool) -> Result<(), DbError> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(DbError::TxDone);
        }
        match &self.target {
            Target::Tx(tx) => {
                let tx = tx.lock().await.take().ok_or(DbError::TxDone)?;
                if commit {
                    tx.commit().await?;
                } else {
                    tx.rollback().await?;
                }
            }
            Target::Conn(_) | Target::Pool(_) => {
                let sql = if commit { "COMMIT" } else { "ROLLBACK" };
                self.target.execute(sql, &[]).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DriverTx for PgTx {
    async fn commit(&self) -> Result<(), DbError> {
        self.end(true).await
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.end(false).await
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        self.ensure_open()?;
        self.target.exec_result(query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        self.ensure_open()?;
        self.target.rows(query, args).await
    }

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError> {
        self.ensure_open()?;
        self.target.prepared(query).await
    }
}

impl Drop for PgTx {
    fn drop(&mut self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        // sqlx rolls back its own transactions on drop; explicit BEGIN needs an explicit ROLLBACK
        let Target::Conn(conn) = &self.target else {
            return;
        };
        // The next lock holder runs the ROLLBACK before its own statement
        conn.rollback_pending.store(true, Ordering::SeqCst);

        // Settle it now as well in case the connection is not used again
        let conn = Arc::clone(conn);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = conn.acquire().await {
                        warn!("Rollback of abandoned transaction failed: {}", e);
                    }
                });
            }
            Err(_) => debug!("No runtime to roll back abandoned transaction; the next call on the connection will"),
        }
    }
}

/// Statement text validated at prepare time and re-run against its target
pub struct PgStmt {
    target: Target,
    sql: String,
    closed: AtomicBool,
}

impl PgStmt {
    fn ensure_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::StmtClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl DriverStmt for PgStmt {
    async fn exec(&self, args: &[Value]) -> Result<ExecResult, DbError> {
        self.ensure_open()?;
        self.target.exec_result(&self.sql, args).await
    }

    async fn query(&self, args: &[Value]) -> Result<Rows, DbError> {
        self.ensure_open()?;
        self.target.rows(&self.sql, args).await
    }

    async fn close(&self) -> Result<(), DbError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn bind_all<'q>(
    mut q: Query<'q, Postgres, PgArguments>,
    args: &[Value],
) -> Query<'q, Postgres, PgArguments> {
    for arg in args {
        q = bind_param(q, arg);
    }
    q
}

fn bind_param<'q>(
    q: Query<'q, Postgres, PgArguments>,
    v: &Value,
) -> Query<'q, Postgres, PgArguments> {
    match v {
        Value::Null => {
            let none: Option<String> = None;
            q.bind(none)
        }
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(n.to_string())
            }
        }
        Value::String(s) => q.bind(s.clone()),
        // Arrays and objects travel as JSONB
        Value::Array(_) | Value::Object(_) => q.bind(v.clone()),
    }
}

fn row_to_json(row: &PgRow) -> JsonRow {
    let mut map = Map::new();
    for i in 0..row.len() {
        map.insert(row.column(i).name().to_string(), column_to_json(row, i));
    }
    map
}

fn column_to_json(row: &PgRow, i: usize) -> Value {
    // NULLs decode as None for any requested type
    match row.try_get::<Option<Value>, _>(i) {
        Ok(Some(v)) => return v,
        Ok(None) => return Value::Null,
        Err(_) => {}
    }

    if let Ok(s) = row.try_get::<String, _>(i) {
        Value::String(s)
    } else if let Ok(v) = row.try_get::<i64, _>(i) {
        Value::Number(v.into())
    } else if let Ok(v) = row.try_get::<i32, _>(i) {
        Value::Number(v.into())
    } else if let Ok(v) = row.try_get::<i16, _>(i) {
        Value::Number(v.into())
    } else if let Ok(v) = row.try_get::<f64, _>(i) {
        float_to_json(v)
    } else if let Ok(v) = row.try_get::<f32, _>(i) {
        float_to_json(f64::from(v))
    } else if let Ok(v) = row.try_get::<bool, _>(i) {
        Value::Bool(v)
    } else if let Ok(v) = row.try_get::<sqlx::types::BigDecimal, _>(i) {
        // Keep full precision
        Value::String(v.to_string())
    } else if let Ok(v) = row.try_get::<uuid::Uuid, _>(i) {
        Value::String(v.to_string())
    } else if let Ok(v) = row.try_get::<chrono::DateTime<chrono::Utc>, _>(i) {
        Value::String(v.to_rfc3339())
    } else if let Ok(v) = row.try_get::<chrono::NaiveDateTime, _>(i) {
        Value::String(v.to_string())
    } else if let Ok(v) = row.try_get::<chrono::NaiveDate, _>(i) {
        Value::String(v.to_string())
    } else if let Ok(v) = row.try_get::<chrono::NaiveTime, _>(i) {
        Value::String(v.to_string())
    } else {
        debug!(
            column = row.column(i).name(),
            "Unsupported column type, returning null"
        );
        Value::Null
    }
}

fn float_to_json(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

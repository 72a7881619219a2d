use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::config::{redact_url, DatabaseConfig};
use crate::database::conn::Connection;
use crate::database::driver::Driver;
use crate::database::postgres::PgDriver;
use crate::database::stmt::Statement;
use crate::database::tx::Transaction;
use crate::error::DbError;
use crate::middleware::pipeline::{intercept, Registry};
use crate::middleware::{Cancellation, Handler, OperationKind, Origin, SetupError};
use crate::types::{ExecResult, Rows, TxOptions};

/// Connection pool wrapper with per-operation handler chains.
///
/// Register handlers first, then open connections, transactions and
/// statements: they all share this database's registry, and registration
/// fails with [`SetupError::RegistryShared`] once anything else holds it.
/// Cloning a `Database` shares the registry too.
#[derive(Clone)]
pub struct Database {
    driver: Arc<dyn Driver>,
    registry: Arc<Registry>,
}

impl Database {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self { driver, registry: Arc::new(Registry::new()) }
    }

    /// Open a Postgres pool with default settings
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        Self::connect_with(database_url, &DatabaseConfig::default()).await
    }

    pub async fn connect_with(database_url: &str, config: &DatabaseConfig) -> Result<Self, DbError> {
        let driver = PgDriver::connect(database_url, config).await?;
        info!("Connected to {}", redact_url(database_url));
        Ok(Self::new(Arc::new(driver)))
    }

    /// Bind `handler` to every kind in `kinds`, after any handlers already bound
    pub fn register(
        &mut self,
        handler: impl Handler + 'static,
        kinds: &[OperationKind],
    ) -> Result<(), SetupError> {
        self.register_shared(Arc::new(handler), kinds)
    }

    /// Like [`register`](Self::register), for a handler instance reused elsewhere
    pub fn register_shared(
        &mut self,
        handler: Arc<dyn Handler>,
        kinds: &[OperationKind],
    ) -> Result<(), SetupError> {
        Arc::get_mut(&mut self.registry)
            .ok_or(SetupError::RegistryShared)?
            .register(handler, kinds)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub async fn begin(&self) -> Result<Transaction, DbError> {
        self.begin_with(&Cancellation::none(), TxOptions::default()).await
    }

    pub async fn begin_with(
        &self,
        cancel: &Cancellation,
        options: TxOptions,
    ) -> Result<Transaction, DbError> {
        if self.registry.bypasses(OperationKind::Begin, Origin::Database) {
            let tx = cancel.run(self.driver.begin(options)).await?;
            return Ok(Transaction::new(tx, Arc::clone(&self.registry)));
        }

        let driver = Arc::clone(&self.driver);
        let registry = Arc::clone(&self.registry);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Begin,
            Origin::Database,
            "",
            &[],
            move |_query, _args| async move {
                let tx = driver.begin(options).await?;
                Ok(Transaction::new(tx, registry))
            },
        )
        .await
        .into_value()
    }

    /// Reserve a single connection. Not intercepted.
    pub async fn conn(&self) -> Result<Connection, DbError> {
        let conn = self.driver.conn().await?;
        Ok(Connection::new(conn, Arc::clone(&self.registry)))
    }

    pub async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        self.exec_with(&Cancellation::none(), query, args).await
    }

    pub async fn exec_with(
        &self,
        cancel: &Cancellation,
        query: &str,
        args: &[Value],
    ) -> Result<ExecResult, DbError> {
        if self.registry.bypasses(OperationKind::Exec, Origin::Database) {
            return cancel.run(self.driver.exec(query, args)).await;
        }

        let driver = Arc::clone(&self.driver);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Exec,
            Origin::Database,
            query,
            args,
            move |query, args| async move { driver.exec(&query, &args).await },
        )
        .await
        .into_value()
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        self.ping_with(&Cancellation::none()).await
    }

    pub async fn ping_with(&self, cancel: &Cancellation) -> Result<(), DbError> {
        if self.registry.bypasses(OperationKind::Ping, Origin::Database) {
            return cancel.run(self.driver.ping()).await;
        }

        let driver = Arc::clone(&self.driver);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Ping,
            Origin::Database,
            "",
            &[],
            move |_query, _args| async move { driver.ping().await },
        )
        .await
        .into_unit()
    }

    pub async fn prepare(&self, query: &str) -> Result<Statement, DbError> {
        self.prepare_with(&Cancellation::none(), query).await
    }

    pub async fn prepare_with(&self, cancel: &Cancellation, query: &str) -> Result<Statement, DbError> {
        if self.registry.bypasses(OperationKind::Prepare, Origin::Database) {
            let stmt = cancel.run(self.driver.prepare(query)).await?;
            return Ok(Statement::new(stmt, Arc::clone(&self.registry), query));
        }

        let driver = Arc::clone(&self.driver);
        let registry = Arc::clone(&self.registry);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Prepare,
            Origin::Database,
            query,
            &[],
            move |query, _args| async move {
                let stmt = driver.prepare(&query).await?;
                Ok(Statement::new(stmt, registry, query))
            },
        )
        .await
        .into_value()
    }

    pub async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        self.query_with(&Cancellation::none(), query, args).await
    }

    pub async fn query_with(
        &self,
        cancel: &Cancellation,
        query: &str,
        args: &[Value],
    ) -> Result<Rows, DbError> {
        if self.registry.bypasses(OperationKind::Query, Origin::Database) {
            return cancel.run(self.driver.query(query, args)).await;
        }

        let driver = Arc::clone(&self.driver);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Query,
            Origin::Database,
            query,
            args,
            move |query, args| async move { driver.query(&query, &args).await },
        )
        .await
        .into_value()
    }

    /// Close the pool. Not intercepted.
    pub async fn close(&self) -> Result<(), DbError> {
        self.driver.close().await
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("registry", &self.registry).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use futures::FutureExt;
    use serde_json::json;

    use super::*;
    use crate::middleware::handler_fn;
    use crate::testing::{Deny, MockDriver, Spy};

    /// Adds one to the first argument, then advances
    fn bump_first_arg() -> impl Handler {
        handler_fn("bump", |ctx| {
            async move {
                if let Some(n) = ctx.args().first().and_then(Value::as_i64) {
                    ctx.args_mut()[0] = json!(n + 1);
                }
                ctx.advance().await;
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn without_handlers_calls_go_straight_to_the_driver() {
        let (db, driver) = MockDriver::database();

        db.ping().await.unwrap();
        let result = db.exec("UPDATE t SET a = $1", &[json!(1)]).await.unwrap();
        let rows = db.query("SELECT $1", &[json!("x")]).await.unwrap();

        assert_eq!(result.rows_affected, 1);
        assert_eq!(rows, vec![json!({"query": "SELECT $1", "args": ["x"]}).as_object().cloned().unwrap()]);
        assert_eq!(driver.labels(), vec!["pool.ping", "pool.exec", "pool.query"]);
    }

    #[tokio::test]
    async fn pass_through_handler_does_not_change_results() {
        let (plain, _) = MockDriver::database();
        let (mut observed, driver) = MockDriver::database();
        observed.register(Spy::new(), &OperationKind::ALL).unwrap();

        let expected = plain.query("SELECT 1", &[json!(1)]).await.unwrap();
        let actual = observed.query("SELECT 1", &[json!(1)]).await.unwrap();

        assert_eq!(actual, expected);
        assert_eq!(driver.call_count(), 1);
    }

    #[tokio::test]
    async fn argument_rewrite_reaches_the_driver() {
        let (mut db, driver) = MockDriver::database();
        db.register(bump_first_arg(), &[OperationKind::Exec]).unwrap();

        db.exec("INSERT INTO t VALUES ($1)", &[json!(5)]).await.unwrap();

        assert_eq!(driver.last_call().unwrap().args, vec![json!(6)]);
    }

    #[tokio::test]
    async fn query_rewrite_reaches_the_driver() {
        let (mut db, driver) = MockDriver::database();
        db.register(
            handler_fn("tenant", |ctx| {
                async move {
                    let scoped = format!("{} WHERE tenant = 'acme'", ctx.query());
                    ctx.set_query(scoped);
                    ctx.advance().await;
                }
                .boxed()
            }),
            &[OperationKind::Query],
        )
        .unwrap();

        db.query("SELECT * FROM orders", &[]).await.unwrap();

        assert_eq!(driver.last_call().unwrap().query, "SELECT * FROM orders WHERE tenant = 'acme'");
    }

    #[tokio::test]
    async fn veto_applies_to_every_origin_without_driver_calls() {
        let (mut db, driver) = MockDriver::database();
        db.register(Deny::new("permission denied"), &[OperationKind::Exec, OperationKind::Query])
            .unwrap();

        let conn = db.conn().await.unwrap();
        let tx = db.begin().await.unwrap();
        let stmt = db.prepare("DELETE FROM t WHERE id = $1").await.unwrap();
        let setup_calls = driver.call_count();

        let failures = vec![
            db.exec("DELETE FROM t", &[]).await.unwrap_err(),
            db.query("SELECT 1", &[]).await.unwrap_err(),
            conn.exec("DELETE FROM t", &[]).await.unwrap_err(),
            conn.query("SELECT 1", &[]).await.unwrap_err(),
            tx.exec("DELETE FROM t", &[]).await.unwrap_err(),
            tx.query("SELECT 1", &[]).await.unwrap_err(),
            stmt.exec(&[json!(1)]).await.unwrap_err(),
            stmt.query(&[json!(1)]).await.unwrap_err(),
        ];

        for err in failures {
            assert_eq!(err.to_string(), "permission denied");
            assert!(err.is_rejection());
        }
        assert_eq!(driver.call_count(), setup_calls);
    }

    #[tokio::test]
    async fn driver_failure_is_returned_through_the_chain() {
        let (mut db, driver) = MockDriver::database();
        let spy = Spy::new();
        db.register(spy.clone(), &[OperationKind::Query]).unwrap();
        driver.fail("query", "relation \"t\" does not exist");

        let err = db.query("SELECT * FROM t", &[]).await.unwrap_err();

        assert_eq!(err.to_string(), "Driver error: relation \"t\" does not exist");
        assert_eq!(spy.seen().len(), 1);
    }

    #[tokio::test]
    async fn handler_can_serve_rows_without_the_driver() {
        let (mut db, driver) = MockDriver::database();
        db.register(
            handler_fn("cache", |ctx| {
                async move {
                    let cached = vec![json!({"id": 1}).as_object().cloned().unwrap_or_default()];
                    ctx.respond::<Rows>(cached);
                }
                .boxed()
            }),
            &[OperationKind::Query],
        )
        .unwrap();

        let rows = db.query("SELECT id FROM t", &[]).await.unwrap();

        assert_eq!(rows[0]["id"], json!(1));
        assert_eq!(driver.call_count(), 0);
    }

    #[tokio::test]
    async fn scratch_is_private_to_each_call() {
        let (mut db, driver) = MockDriver::database();
        db.register(
            handler_fn("stash", |ctx| {
                async move {
                    let n = ctx.args().first().cloned().unwrap_or(Value::Null);
                    ctx.set("n", n);
                    // Let the other calls interleave before reading back
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    let stashed = ctx.get::<Value>("n").unwrap_or(Value::Null);
                    ctx.set_args(vec![stashed]);
                    ctx.advance().await;
                }
                .boxed()
            }),
            &[OperationKind::Query],
        )
        .unwrap();

        let calls = (0..32).map(|i| {
            let db = db.clone();
            async move { (i, db.query("SELECT $1", &[json!(i)]).await) }
        });
        for (i, rows) in join_all(calls).await {
            assert_eq!(rows.unwrap()[0]["args"], json!([i]));
        }
        assert_eq!(driver.call_count(), 32);
    }

    #[tokio::test]
    async fn registry_is_inherited_by_connections_transactions_and_statements() {
        let (mut db, _driver) = MockDriver::database();
        let spy = Spy::new();
        db.register(spy.clone(), &OperationKind::ALL).unwrap();

        let conn = db.conn().await.unwrap();
        conn.ping().await.unwrap();
        let tx = conn.begin().await.unwrap();
        let stmt = tx.prepare("SELECT $1").await.unwrap();
        stmt.query(&[json!(1)]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            spy.origins(),
            vec![
                (OperationKind::Ping, Origin::Connection),
                (OperationKind::Begin, Origin::Connection),
                (OperationKind::Prepare, Origin::Transaction),
                (OperationKind::Query, Origin::Statement),
                (OperationKind::Commit, Origin::Transaction),
            ]
        );
    }

    #[tokio::test]
    async fn registration_fails_once_the_registry_is_shared() {
        let (mut db, _driver) = MockDriver::database();
        db.register(Spy::new(), &[OperationKind::Query]).unwrap();

        let conn = db.conn().await.unwrap();
        let err = db.register(Spy::new(), &[OperationKind::Exec]).unwrap_err();
        assert_eq!(err, SetupError::RegistryShared);

        // Released again once nothing else holds it
        drop(conn);
        db.register(Spy::new(), &[OperationKind::Exec]).unwrap();

        let clone = db.clone();
        assert_eq!(
            db.register(Spy::new(), &[OperationKind::Ping]).unwrap_err(),
            SetupError::RegistryShared
        );
        assert_eq!(clone.registry().handler_names(OperationKind::Exec), vec!["Spy"]);
    }

    #[test]
    fn registration_requires_at_least_one_kind() {
        let (mut db, _driver) = MockDriver::database();
        let err = db.register(Spy::new(), &[]).unwrap_err();
        assert_eq!(err, SetupError::EmptyKinds { handler: "Spy" });
    }

    #[tokio::test]
    async fn vetoed_begin_returns_no_transaction() {
        let (mut db, driver) = MockDriver::database();
        db.register(Deny::new("no transactions"), &[OperationKind::Begin]).unwrap();

        let err = db.begin().await.unwrap_err();

        assert_eq!(err.to_string(), "no transactions");
        assert_eq!(driver.call_count(), 0);
    }

    #[tokio::test]
    async fn prepared_sql_is_the_rewritten_sql() {
        let (mut db, driver) = MockDriver::database();
        db.register(
            handler_fn("qualify", |ctx| {
                async move {
                    let qualified = ctx.query().replace("FROM t", "FROM app.t");
                    ctx.set_query(qualified);
                    ctx.advance().await;
                }
                .boxed()
            }),
            &[OperationKind::Prepare],
        )
        .unwrap();

        let stmt = db.prepare("SELECT * FROM t").await.unwrap();

        assert_eq!(stmt.query_text(), "SELECT * FROM app.t");
        assert_eq!(driver.last_call().unwrap().query, "SELECT * FROM app.t");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_slow_calls_with_and_without_handlers() {
        let (mut db, driver) = MockDriver::database();
        driver.set_delay(Duration::from_secs(5));

        let cancel = Cancellation::timeout(Duration::from_millis(100));
        let err = db.query_with(&cancel, "SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::DeadlineExceeded));

        let spy = Spy::new();
        db.register(spy.clone(), &[OperationKind::Query]).unwrap();
        let cancel = Cancellation::timeout(Duration::from_millis(100));
        let err = db.query_with(&cancel, "SELECT 1", &[]).await.unwrap_err();

        assert!(matches!(err, DbError::DeadlineExceeded));
        assert_eq!(spy.seen().len(), 1);
        assert_eq!(driver.call_count(), 0);
    }

    #[test]
    fn clones_share_one_registry() {
        let (mut db, _driver) = MockDriver::database();
        db.register(Spy::new(), &[OperationKind::Query]).unwrap();

        let other = db.clone();
        let conn_side = other.clone();

        assert!(std::ptr::eq(db.registry(), other.registry()));
        assert!(std::ptr::eq(db.registry(), conn_side.registry()));
        assert_eq!(other.registry().handler_names(OperationKind::Query), vec!["Spy"]);
    }
}

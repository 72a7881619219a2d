use std::sync::Arc;

use serde_json::Value;

use crate::database::driver::DriverConn;
use crate::database::stmt::Statement;
use crate::database::tx::Transaction;
use crate::error::DbError;
use crate::middleware::pipeline::{intercept, Registry};
use crate::middleware::{Cancellation, OperationKind, Origin};
use crate::types::{ExecResult, Rows, TxOptions};

/// A single reserved connection, sharing its database's handlers.
///
/// Every call runs on the same underlying connection, so session state
/// (temporary tables, `SET` parameters) persists between calls.
pub struct Connection {
    conn: Arc<dyn DriverConn>,
    registry: Arc<Registry>,
}

impl Connection {
    pub(crate) fn new(conn: Arc<dyn DriverConn>, registry: Arc<Registry>) -> Self {
        Self { conn, registry }
    }

    pub fn driver(&self) -> &Arc<dyn DriverConn> {
        &self.conn
    }

    pub async fn begin(&self) -> Result<Transaction, DbError> {
        self.begin_with(&Cancellation::none(), TxOptions::default()).await
    }

    pub async fn begin_with(
        &self,
        cancel: &Cancellation,
        options: TxOptions,
    ) -> Result<Transaction, DbError> {
        if self.registry.bypasses(OperationKind::Begin, Origin::Connection) {
            let tx = cancel.run(self.conn.begin(options)).await?;
            return Ok(Transaction::new(tx, Arc::clone(&self.registry)));
        }

        let conn = Arc::clone(&self.conn);
        let registry = Arc::clone(&self.registry);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Begin,
            Origin::Connection,
            "",
            &[],
            move |_query, _args| async move {
                let tx = conn.begin(options).await?;
                Ok(Transaction::new(tx, registry))
            },
        )
        .await
        .into_value()
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
        if self.registry.bypasses(OperationKind::Exec, Origin::Connection) {
            return cancel.run(self.conn.exec(query, args)).await;
        }

        let conn = Arc::clone(&self.conn);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Exec,
            Origin::Connection,
            query,
            args,
            move |query, args| async move { conn.exec(&query, &args).await },
        )
        .await
        .into_value()
    }

    pub async fn ping(&self) -> Result<(), DbError> {
        self.ping_with(&Cancellation::none()).await
    }

    pub async fn ping_with(&self, cancel: &Cancellation) -> Result<(), DbError> {
        if self.registry.bypasses(OperationKind::Ping, Origin::Connection) {
            return cancel.run(self.conn.ping()).await;
        }

        let conn = Arc::clone(&self.conn);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Ping,
            Origin::Connection,
            "",
            &[],
            move |_query, _args| async move { conn.ping().await },
        )
        .await
        .into_unit()
    }

    pub async fn prepare(&self, query: &str) -> Result<Statement, DbError> {
        self.prepare_with(&Cancellation::none(), query).await
    }

    pub async fn prepare_with(&self, cancel: &Cancellation, query: &str) -> Result<Statement, DbError> {
        if self.registry.bypasses(OperationKind::Prepare, Origin::Connection) {
            let stmt = cancel.run(self.conn.prepare(query)).await?;
            return Ok(Statement::new(stmt, Arc::clone(&self.registry), query));
        }

        let conn = Arc::clone(&self.conn);
        let registry = Arc::clone(&self.registry);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Prepare,
            Origin::Connection,
            query,
            &[],
            move |query, _args| async move {
                let stmt = conn.prepare(&query).await?;
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
        if self.registry.bypasses(OperationKind::Query, Origin::Connection) {
            return cancel.run(self.conn.query(query, args)).await;
        }

        let conn = Arc::clone(&self.conn);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Query,
            Origin::Connection,
            query,
            args,
            move |query, args| async move { conn.query(&query, &args).await },
        )
        .await
        .into_value()
    }

    /// Return the connection to the pool. Not intercepted.
    pub async fn close(self) -> Result<(), DbError> {
        self.conn.close().await
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("registry", &self.registry).finish()
    }
}

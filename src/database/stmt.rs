use std::sync::Arc;

use serde_json::Value;

use crate::database::driver::DriverStmt;
use crate::error::DbError;
use crate::middleware::pipeline::{intercept, Registry};
use crate::middleware::{Cancellation, OperationKind, Origin};
use crate::types::{ExecResult, Rows};

/// A prepared statement with the handlers of the object that prepared it.
///
/// Handlers see the prepared SQL as the call's query. Rewriting it from a
/// handler has no effect: the statement is already prepared. Argument
/// rewrites do apply.
#[derive(Clone)]
pub struct Statement {
    stmt: Arc<dyn DriverStmt>,
    registry: Arc<Registry>,
    query: Arc<str>,
}

impl Statement {
    pub(crate) fn new(stmt: Arc<dyn DriverStmt>, registry: Arc<Registry>, query: impl Into<Arc<str>>) -> Self {
        Self { stmt, registry, query: query.into() }
    }

    /// SQL this statement was prepared from
    pub fn query_text(&self) -> &str {
        &self.query
    }

    pub fn driver(&self) -> &Arc<dyn DriverStmt> {
        &self.stmt
    }

    pub async fn exec(&self, args: &[Value]) -> Result<ExecResult, DbError> {
        self.exec_with(&Cancellation::none(), args).await
    }

    pub async fn exec_with(&self, cancel: &Cancellation, args: &[Value]) -> Result<ExecResult, DbError> {
        if self.registry.bypasses(OperationKind::Exec, Origin::Statement) {
            return cancel.run(self.stmt.exec(args)).await;
        }

        let stmt = Arc::clone(&self.stmt);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Exec,
            Origin::Statement,
            &self.query,
            args,
            move |_query, args| async move { stmt.exec(&args).await },
        )
        .await
        .into_value()
    }

    pub async fn query(&self, args: &[Value]) -> Result<Rows, DbError> {
        self.query_with(&Cancellation::none(), args).await
    }

    pub async fn query_with(&self, cancel: &Cancellation, args: &[Value]) -> Result<Rows, DbError> {
        if self.registry.bypasses(OperationKind::Query, Origin::Statement) {
            return cancel.run(self.stmt.query(args)).await;
        }

        let stmt = Arc::clone(&self.stmt);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Query,
            Origin::Statement,
            &self.query,
            args,
            move |_query, args| async move { stmt.query(&args).await },
        )
        .await
        .into_value()
    }

    /// Release the prepared statement. Not intercepted. Clones of this
    /// statement fail with `DbError::StmtClosed` afterwards.
    pub async fn close(self) -> Result<(), DbError> {
        self.stmt.close().await
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement").field("query", &self.query).finish()
    }
}

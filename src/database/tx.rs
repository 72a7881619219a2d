use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::database::driver::DriverTx;
use crate::database::stmt::Statement;
use crate::error::DbError;
use crate::middleware::pipeline::{intercept, Registry};
use crate::middleware::{Cancellation, OperationKind, Origin};
use crate::types::{ExecResult, Rows};

/// An open transaction carrying the handlers of the object that began it.
///
/// Once committed or rolled back, further `commit`/`rollback` calls return
/// `Ok(())` without running handlers or reaching the driver.
pub struct Transaction {
    tx: Arc<dyn DriverTx>,
    registry: Arc<Registry>,
    done: Arc<AtomicBool>,
}

impl Transaction {
    pub(crate) fn new(tx: Arc<dyn DriverTx>, registry: Arc<Registry>) -> Self {
        Self { tx, registry, done: Arc::new(AtomicBool::new(false)) }
    }

    /// Whether commit or rollback has reached the driver
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn driver(&self) -> &Arc<dyn DriverTx> {
        &self.tx
    }

    pub async fn commit(&self) -> Result<(), DbError> {
        self.finish(&Cancellation::none(), OperationKind::Commit).await
    }

    pub async fn commit_with(&self, cancel: &Cancellation) -> Result<(), DbError> {
        self.finish(cancel, OperationKind::Commit).await
    }

    pub async fn rollback(&self) -> Result<(), DbError> {
        self.finish(&Cancellation::none(), OperationKind::Rollback).await
    }

    pub async fn rollback_with(&self, cancel: &Cancellation) -> Result<(), DbError> {
        self.finish(cancel, OperationKind::Rollback).await
    }

    async fn finish(&self, cancel: &Cancellation, kind: OperationKind) -> Result<(), DbError> {
        if self.is_done() {
            tracing::debug!(kind = %kind, "Transaction already finished, nothing to do");
            return Ok(());
        }

        let tx = Arc::clone(&self.tx);
        let done = Arc::clone(&self.done);
        let end = move || async move {
            // Set by whichever call reaches the driver first; a veto leaves it open
            if done.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            match kind {
                OperationKind::Commit => tx.commit().await,
                _ => tx.rollback().await,
            }
        };

        if self.registry.bypasses(kind, Origin::Transaction) {
            return cancel.run(end()).await;
        }

        intercept(&self.registry, cancel, kind, Origin::Transaction, "", &[], move |_, _| end())
            .await
            .into_unit()
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
        if self.registry.bypasses(OperationKind::Exec, Origin::Transaction) {
            return cancel.run(self.tx.exec(query, args)).await;
        }

        let tx = Arc::clone(&self.tx);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Exec,
            Origin::Transaction,
            query,
            args,
            move |query, args| async move { tx.exec(&query, &args).await },
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
        if self.registry.bypasses(OperationKind::Query, Origin::Transaction) {
            return cancel.run(self.tx.query(query, args)).await;
        }

        let tx = Arc::clone(&self.tx);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Query,
            Origin::Transaction,
            query,
            args,
            move |query, args| async move { tx.query(&query, &args).await },
        )
        .await
        .into_value()
    }

    /// Prepare a statement bound to this transaction
    pub async fn prepare(&self, query: &str) -> Result<Statement, DbError> {
        self.prepare_with(&Cancellation::none(), query).await
    }

    pub async fn prepare_with(&self, cancel: &Cancellation, query: &str) -> Result<Statement, DbError> {
        if self.registry.bypasses(OperationKind::Prepare, Origin::Transaction) {
            let stmt = cancel.run(self.tx.prepare(query)).await?;
            return Ok(Statement::new(stmt, Arc::clone(&self.registry), query));
        }

        let tx = Arc::clone(&self.tx);
        let registry = Arc::clone(&self.registry);
        intercept(
            &self.registry,
            cancel,
            OperationKind::Prepare,
            Origin::Transaction,
            query,
            &[],
            move |query, _args| async move {
                let stmt = tx.prepare(&query).await?;
                Ok(Statement::new(stmt, registry, query))
            },
        )
        .await
        .into_value()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.is_done() {
            tracing::debug!("Transaction dropped without commit or rollback; the driver rolls it back");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("done", &self.is_done()).finish()
    }
}

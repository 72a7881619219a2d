//! In-memory driver for exercising call-scope objects and handlers without a server.
//!
//! Every driver call is recorded. `query` answers with a single row echoing
//! what it received (`{"query": ..., "args": [...]}`) and `exec` reports one
//! affected row per argument, so tests can observe exactly what reached the
//! driver after handlers ran.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::database::driver::{Driver, DriverConn, DriverStmt, DriverTx};
use crate::database::Database;
use crate::error::DbError;
use crate::middleware::{CallContext, Handler, OperationKind, Origin};
use crate::types::{ExecResult, Rows, TxOptions};

/// One call that reached the driver
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// "pool", "conn", "tx" or "stmt"
    pub scope: &'static str,
    pub op: &'static str,
    pub query: String,
    pub args: Vec<Value>,
}

impl RecordedCall {
    /// `scope.op`, e.g. "tx.commit"
    pub fn label(&self) -> String {
        format!("{}.{}", self.scope, self.op)
    }
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<RecordedCall>>,
    failures: Mutex<HashMap<String, String>>,
    delay: Mutex<Option<Duration>>,
}

impl MockState {
    async fn record(
        &self,
        scope: &'static str,
        op: &'static str,
        query: &str,
        args: &[Value],
    ) -> Result<(), DbError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().unwrap().push(RecordedCall {
            scope,
            op,
            query: query.to_string(),
            args: args.to_vec(),
        });

        let failures = self.failures.lock().unwrap();
        let injected = failures
            .get(&format!("{}.{}", scope, op))
            .or_else(|| failures.get(op));
        match injected {
            Some(message) => Err(DbError::driver(message.clone())),
            None => Ok(()),
        }
    }

    async fn exec(
        &self,
        scope: &'static str,
        query: &str,
        args: &[Value],
    ) -> Result<ExecResult, DbError> {
        self.record(scope, "exec", query, args).await?;
        Ok(ExecResult { rows_affected: args.len() as u64, last_insert_id: None })
    }

    async fn query(&self, scope: &'static str, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        self.record(scope, "query", query, args).await?;
        let row = json!({ "query": query, "args": args });
        Ok(row.as_object().into_iter().cloned().collect())
    }

    async fn prepare(
        self: &Arc<Self>,
        scope: &'static str,
        query: &str,
    ) -> Result<Arc<dyn DriverStmt>, DbError> {
        self.record(scope, "prepare", query, &[]).await?;
        Ok(Arc::new(MockStmt {
            state: Arc::clone(self),
            query: query.to_string(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn begin(self: &Arc<Self>, scope: &'static str) -> Result<Arc<dyn DriverTx>, DbError> {
        self.record(scope, "begin", "", &[]).await?;
        Ok(Arc::new(MockTx { state: Arc::clone(self) }))
    }
}

/// Recording driver; clones share the same call log
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `Database` over a fresh mock, plus the mock for inspection
    pub fn database() -> (Database, MockDriver) {
        let driver = Self::new();
        (Database::new(Arc::new(driver.clone())), driver)
    }

    /// Make `op` ("query") or `scope.op` ("tx.commit") fail with a driver error
    pub fn fail(&self, op: &str, message: &str) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(op.to_string(), message.to_string());
    }

    /// Sleep this long inside every driver call
    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls().iter().map(RecordedCall::label).collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.calls.lock().unwrap().len()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.state.calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn ping(&self) -> Result<(), DbError> {
        self.state.record("pool", "ping", "", &[]).await
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        self.state.exec("pool", query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        self.state.query("pool", query, args).await
    }

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError> {
        self.state.prepare("pool", query).await
    }

    async fn begin(&self, _options: TxOptions) -> Result<Arc<dyn DriverTx>, DbError> {
        self.state.begin("pool").await
    }

    async fn conn(&self) -> Result<Arc<dyn DriverConn>, DbError> {
        self.state.record("pool", "conn", "", &[]).await?;
        Ok(Arc::new(MockConn { state: Arc::clone(&self.state) }))
    }

    async fn close(&self) -> Result<(), DbError> {
        self.state.record("pool", "close", "", &[]).await
    }
}

struct MockConn {
    state: Arc<MockState>,
}

#[async_trait]
impl DriverConn for MockConn {
    async fn ping(&self) -> Result<(), DbError> {
        self.state.record("conn", "ping", "", &[]).await
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        self.state.exec("conn", query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        self.state.query("conn", query, args).await
    }

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError> {
        self.state.prepare("conn", query).await
    }

    async fn begin(&self, _options: TxOptions) -> Result<Arc<dyn DriverTx>, DbError> {
        self.state.begin("conn").await
    }

    async fn close(&self) -> Result<(), DbError> {
        self.state.record("conn", "close", "", &[]).await
    }
}

struct MockTx {
    state: Arc<MockState>,
}

#[async_trait]
impl DriverTx for MockTx {
    async fn commit(&self) -> Result<(), DbError> {
        self.state.record("tx", "commit", "", &[]).await
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.state.record("tx", "rollback", "", &[]).await
    }

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError> {
        self.state.exec("tx", query, args).await
    }

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError> {
        self.state.query("tx", query, args).await
    }

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError> {
        self.state.prepare("tx", query).await
    }
}

struct MockStmt {
    state: Arc<MockState>,
    query: String,
    closed: AtomicBool,
}

#[async_trait]
impl DriverStmt for MockStmt {
    async fn exec(&self, args: &[Value]) -> Result<ExecResult, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::StmtClosed);
        }
        self.state.exec("stmt", &self.query, args).await
    }

    async fn query(&self, args: &[Value]) -> Result<Rows, DbError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::StmtClosed);
        }
        self.state.query("stmt", &self.query, args).await
    }

    async fn close(&self) -> Result<(), DbError> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.record("stmt", "close", &self.query, &[]).await
    }
}

/// What a [`Spy`] saw on the way in
#[derive(Debug, Clone, PartialEq)]
pub struct SeenCall {
    pub kind: OperationKind,
    pub origin: Origin,
    pub query: String,
}

/// Handler that records each call it sees, then advances
#[derive(Clone, Default)]
pub struct Spy {
    seen: Arc<Mutex<Vec<SeenCall>>>,
}

impl Spy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seen(&self) -> Vec<SeenCall> {
        self.seen.lock().unwrap().clone()
    }

    pub fn origins(&self) -> Vec<(OperationKind, Origin)> {
        self.seen().into_iter().map(|call| (call.kind, call.origin)).collect()
    }
}

#[async_trait]
impl Handler for Spy {
    fn name(&self) -> &'static str {
        "Spy"
    }

    async fn handle(&self, ctx: &mut CallContext) {
        self.seen.lock().unwrap().push(SeenCall {
            kind: ctx.kind(),
            origin: ctx.origin(),
            query: ctx.query().to_string(),
        });
        ctx.advance().await;
    }
}

/// Handler that vetoes every call with the given message while enabled
#[derive(Clone)]
pub struct Deny {
    message: &'static str,
    enabled: Arc<AtomicBool>,
}

impl Deny {
    pub fn new(message: &'static str) -> Self {
        Self { message, enabled: Arc::new(AtomicBool::new(true)) }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

#[async_trait]
impl Handler for Deny {
    fn name(&self) -> &'static str {
        "Deny"
    }

    async fn handle(&self, ctx: &mut CallContext) {
        if self.enabled.load(Ordering::SeqCst) {
            ctx.record_error(DbError::rejected(self.message));
            return;
        }
        ctx.advance().await;
    }
}

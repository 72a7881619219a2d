use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::error::DbError;
use crate::middleware::cancellation::Cancellation;
use crate::middleware::pipeline::Registry;
use crate::middleware::traits::{OperationKind, Origin};

/// Key/value store shared by the handlers of a single call.
///
/// Handlers of one call never run concurrently: the cursor in
/// [`CallContext`] serializes them. The lock only matters when a handler
/// hands the store to a spawned task through [`CallContext::scratch_handle`].
#[derive(Default)]
pub struct Scratch {
    values: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn Any + Send + Sync>>> {
        // Inserts and removals are atomic, so a poisoned map is still consistent
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a value under `key`, replacing any previous value
    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.values().insert(key.into(), Arc::new(value));
    }

    /// Clone out the value under `key` if present and of type `T`
    pub fn get<T: Any + Clone + Send + Sync>(&self, key: &str) -> Option<T> {
        let value = self.values().get(key).cloned()?;
        value.as_ref().downcast_ref::<T>().cloned()
    }

    /// Untyped access for values whose type is not known up front
    pub fn get_raw(&self, key: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.values().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values().contains_key(key)
    }

    /// Remove `key`; returns whether it was present
    pub fn delete(&self, key: &str) -> bool {
        self.values().remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values().is_empty()
    }
}

impl fmt::Debug for Scratch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scratch").field("keys", &self.keys()).finish()
    }
}

/// Driver call bound into a context at construction
pub(crate) type DriverCall<T> = Box<
    dyn FnOnce(String, Vec<Value>, Cancellation) -> BoxFuture<'static, Result<T, DbError>> + Send,
>;

/// Type-erased view of the terminal action held by a context
pub(crate) trait TerminalSlot: Send {
    /// Run the driver call with the given query/args. Later invocations do nothing.
    fn invoke(
        &mut self,
        query: String,
        args: Vec<Value>,
        cancel: Cancellation,
    ) -> BoxFuture<'_, Result<(), DbError>>;

    /// Accept a result supplied by a handler; false if it has the wrong type
    fn supply(&mut self, value: Box<dyn Any + Send>) -> bool;

    fn has_run(&self) -> bool;

    fn take_output(&mut self) -> Option<Box<dyn Any + Send>>;
}

/// The real driver call for one operation, plus the result it produced
pub(crate) struct Terminal<T> {
    call: Option<DriverCall<T>>,
    output: Option<T>,
}

impl<T> Terminal<T> {
    pub(crate) fn new(call: DriverCall<T>) -> Self {
        Self { call: Some(call), output: None }
    }
}

impl<T: Send + 'static> TerminalSlot for Terminal<T> {
    fn invoke(
        &mut self,
        query: String,
        args: Vec<Value>,
        cancel: Cancellation,
    ) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move {
            let Some(call) = self.call.take() else {
                return Ok(());
            };
            let output = call(query, args, cancel).await?;
            self.output = Some(output);
            Ok(())
        })
    }

    fn supply(&mut self, value: Box<dyn Any + Send>) -> bool {
        match value.downcast::<T>() {
            Ok(value) => {
                self.output = Some(*value);
                true
            }
            Err(_) => false,
        }
    }

    fn has_run(&self) -> bool {
        self.call.is_none()
    }

    fn take_output(&mut self) -> Option<Box<dyn Any + Send>> {
        self.output.take().map(|value| Box::new(value) as Box<dyn Any + Send>)
    }
}

/// Per-call state flowing through a handler chain.
///
/// A context is created for exactly one intercepted call and dropped when the
/// call returns. Handlers affect the call only through this type: rewriting
/// the query or arguments, using the scratch space, recording failures, or
/// deciding whether to [`advance`](CallContext::advance).
pub struct CallContext {
    id: Uuid,
    kind: OperationKind,
    origin: Origin,
    query: String,
    args: Vec<Value>,
    scratch: Arc<Scratch>,
    errors: Vec<DbError>,
    cancel: Cancellation,
    registry: Arc<Registry>,
    cursor: usize,
    terminal: Box<dyn TerminalSlot>,
    started_at: Instant,
}

impl CallContext {
    pub(crate) fn new(
        registry: Arc<Registry>,
        kind: OperationKind,
        origin: Origin,
        query: String,
        args: Vec<Value>,
        cancel: Cancellation,
        terminal: Box<dyn TerminalSlot>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            origin,
            query,
            args,
            scratch: Arc::new(Scratch::new()),
            errors: Vec::with_capacity(1),
            cancel,
            registry,
            cursor: 0,
            terminal,
            started_at: Instant::now(),
        }
    }

    /// Unique id of this call, for correlating log lines
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Time since the call entered the chain
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Cancellation and deadline the caller supplied; the driver call runs under it
    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.cancel.deadline()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Query text the driver will receive. Empty for ping/begin/commit/rollback.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn set_query(&mut self, query: impl Into<String>) {
        self.query = query.into();
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn args_mut(&mut self) -> &mut Vec<Value> {
        &mut self.args
    }

    pub fn set_args(&mut self, args: Vec<Value>) {
        self.args = args;
    }

    pub fn scratch(&self) -> &Scratch {
        &self.scratch
    }

    /// Shared handle to the scratch space for work offloaded to another task
    pub fn scratch_handle(&self) -> Arc<Scratch> {
        Arc::clone(&self.scratch)
    }

    pub fn set<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.scratch.set(key, value);
    }

    pub fn get<T: Any + Clone + Send + Sync>(&self, key: &str) -> Option<T> {
        self.scratch.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.scratch.contains(key)
    }

    pub fn delete(&self, key: &str) -> bool {
        self.scratch.delete(key)
    }

    /// Append a failure. Does not stop the chain: a handler that wants to veto
    /// the call must also return without advancing.
    pub fn record_error(&mut self, error: DbError) {
        self.errors.push(error);
    }

    /// The failure returned to the caller, if any
    pub fn first_error(&self) -> Option<&DbError> {
        self.errors.first()
    }

    /// Every failure recorded so far, in recording order
    pub fn errors(&self) -> &[DbError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether the driver call has already been made
    pub fn terminal_ran(&self) -> bool {
        self.terminal.has_run()
    }

    /// Number of `advance` steps taken so far
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Supply the call's result from a handler, e.g. rows served from a cache.
    ///
    /// The value must have the type the caller expects (`Rows` for query,
    /// `ExecResult` for exec, ...). Returns false when the type does not match.
    pub fn respond<T: Any + Send>(&mut self, value: T) -> bool {
        let accepted = self.terminal.supply(Box::new(value));
        if !accepted {
            tracing::warn!(
                call = %self.id,
                kind = %self.kind,
                "Handler response has the wrong type for this operation, ignored"
            );
        }
        accepted
    }

    /// Run the next handler in the chain, or the driver call once the chain
    /// is exhausted.
    ///
    /// Handlers call this to continue; whatever they do after awaiting it
    /// wraps the rest of the chain. Calls made after the driver call has run
    /// do nothing.
    pub fn advance(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let position = self.cursor;
            self.cursor += 1;

            let handler = self.registry.lookup(self.kind).get(position).cloned();
            if let Some(handler) = handler {
                tracing::trace!(
                    call = %self.id,
                    kind = %self.kind,
                    origin = %self.origin,
                    position,
                    handler = handler.name(),
                    "Entering handler"
                );
                handler.handle(self).await;
                return;
            }

            if self.terminal.has_run() {
                tracing::warn!(
                    call = %self.id,
                    kind = %self.kind,
                    position,
                    "advance() called after the driver call already ran, ignoring"
                );
                return;
            }

            tracing::trace!(call = %self.id, kind = %self.kind, origin = %self.origin, "Invoking driver");
            let query = self.query.clone();
            let args = self.args.clone();
            let cancel = self.cancel.clone();
            if let Err(error) = self.terminal.invoke(query, args, cancel).await {
                self.errors.push(error);
            }
        })
    }

    /// Consume the context, returning the first failure and the call output
    pub(crate) fn finish(mut self) -> (Option<DbError>, Option<Box<dyn Any + Send>>) {
        let output = self.terminal.take_output();
        let mut errors = self.errors.into_iter();
        let first = errors.next();
        for suppressed in errors {
            tracing::debug!(
                call = %self.id,
                kind = %self.kind,
                "Additional failure not returned to caller: {}",
                suppressed
            );
        }
        (first, output)
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("query", &self.query)
            .field("args", &self.args)
            .field("scratch", &self.scratch)
            .field("errors", &self.errors)
            .field("cancellation", &self.cancel)
            .field("cursor", &self.cursor)
            .finish()
    }
}

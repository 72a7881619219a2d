// Handler registry and the dispatch entry point used by every call-scope object

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use serde_json::Value;

use crate::error::DbError;
use crate::middleware::cancellation::Cancellation;
use crate::middleware::context::{CallContext, DriverCall, Terminal};
use crate::middleware::error::SetupError;
use crate::middleware::traits::{Handler, OperationKind, Origin};

/// Ordered handler chains keyed by operation kind.
///
/// Populated during setup, then frozen: the owning `Database` keeps it in an
/// `Arc` and every connection, transaction and statement derived from it
/// holds a clone of that same `Arc`.
#[derive(Default)]
pub struct Registry {
    chains: HashMap<OperationKind, Vec<Arc<dyn Handler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the chain of every kind in `kinds`.
    ///
    /// Handlers run in registration order. A kind listed twice in one call
    /// binds the handler once.
    pub fn register(
        &mut self,
        handler: Arc<dyn Handler>,
        kinds: &[OperationKind],
    ) -> Result<(), SetupError> {
        if kinds.is_empty() {
            return Err(SetupError::EmptyKinds { handler: handler.name() });
        }

        let mut bound: Vec<OperationKind> = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            if bound.contains(&kind) {
                continue;
            }
            bound.push(kind);
            self.chains.entry(kind).or_default().push(Arc::clone(&handler));
        }

        tracing::debug!("Registered handler '{}' for {:?}", handler.name(), bound);
        Ok(())
    }

    /// Handlers bound to `kind`, in execution order. Empty when none are registered.
    pub fn lookup(&self, kind: OperationKind) -> &[Arc<dyn Handler>] {
        self.chains.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn handler_names(&self, kind: OperationKind) -> Vec<&'static str> {
        self.lookup(kind).iter().map(|handler| handler.name()).collect()
    }

    /// True when no kind has any handler
    pub fn is_empty(&self) -> bool {
        self.chains.values().all(Vec::is_empty)
    }

    /// Whether a call of `kind` should go straight to the driver
    pub(crate) fn bypasses(&self, kind: OperationKind, origin: Origin) -> bool {
        let bypass = self.lookup(kind).is_empty();
        if bypass {
            tracing::trace!(kind = %kind, origin = %origin, "No handlers, calling driver directly");
        }
        bypass
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for kind in OperationKind::ALL {
            let names = self.handler_names(kind);
            if !names.is_empty() {
                map.entry(&kind, &names);
            }
        }
        map.finish()
    }
}

/// Result of running one call through its handler chain
pub(crate) struct Intercepted<T> {
    kind: OperationKind,
    output: Option<T>,
    error: Option<DbError>,
}

impl<T> Intercepted<T> {
    /// Map onto the caller's result for operations that produce a value.
    ///
    /// A recorded failure wins over any output. A chain that stopped with
    /// neither yields `DbError::NoResult`.
    pub(crate) fn into_value(self) -> Result<T, DbError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.output.ok_or(DbError::NoResult { kind: self.kind })
    }

    /// Map onto the caller's result for operations without a value
    pub(crate) fn into_unit(self) -> Result<(), DbError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Run a call through the handlers registered for `kind`.
///
/// `call` is the terminal action: it receives the query and arguments as the
/// handlers left them, not as the caller supplied them, and runs under
/// `cancel`. Callers check [`Registry::bypasses`] first and skip this
/// entirely when it holds.
pub(crate) async fn intercept<T, F, Fut>(
    registry: &Arc<Registry>,
    cancel: &Cancellation,
    kind: OperationKind,
    origin: Origin,
    query: &str,
    args: &[Value],
    call: F,
) -> Intercepted<T>
where
    T: Send + 'static,
    F: FnOnce(String, Vec<Value>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, DbError>> + Send + 'static,
{
    let driver_call: DriverCall<T> = Box::new(move |query, args, cancel: Cancellation| {
        let call = call(query, args);
        async move { cancel.run(call).await }.boxed()
    });
    let terminal = Terminal::new(driver_call);
    let mut ctx = CallContext::new(
        Arc::clone(registry),
        kind,
        origin,
        query.to_owned(),
        args.to_vec(),
        cancel.clone(),
        Box::new(terminal),
    );

    ctx.advance().await;

    let (error, output) = ctx.finish();
    let output = output
        .and_then(|value: Box<dyn Any + Send>| value.downcast::<T>().ok())
        .map(|value| *value);
    Intercepted { kind, output, error }
}

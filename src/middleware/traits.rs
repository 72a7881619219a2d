use std::fmt;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::middleware::context::CallContext;

/// Database operations that can be intercepted by middleware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Begin,
    Commit,
    Rollback,
    Exec,
    Ping,
    Prepare,
    Query,
}

impl OperationKind {
    pub const ALL: [OperationKind; 7] = [
        OperationKind::Begin,
        OperationKind::Commit,
        OperationKind::Rollback,
        OperationKind::Exec,
        OperationKind::Ping,
        OperationKind::Prepare,
        OperationKind::Query,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Begin => "begin",
            OperationKind::Commit => "commit",
            OperationKind::Rollback => "rollback",
            OperationKind::Exec => "exec",
            OperationKind::Ping => "ping",
            OperationKind::Prepare => "prepare",
            OperationKind::Query => "query",
        }
    }

    /// Whether calls of this kind carry query text
    pub fn has_query(&self) -> bool {
        matches!(self, OperationKind::Exec | OperationKind::Prepare | OperationKind::Query)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which call-scope object initiated an operation. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Database,
    Transaction,
    Statement,
    Connection,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Database => "database",
            Origin::Transaction => "transaction",
            Origin::Statement => "statement",
            Origin::Connection => "connection",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of interception logic bound to one or more operation kinds.
///
/// The handler receives the call context and decides whether the rest of the
/// chain runs by awaiting [`CallContext::advance`]. Code placed after that
/// await runs once everything downstream, including the driver call, is done.
/// Returning without advancing stops the chain and the driver is never called.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handler name for logging and diagnostics
    fn name(&self) -> &'static str {
        "anonymous"
    }

    async fn handle(&self, ctx: &mut CallContext);
}

/// Handler backed by a closure, see [`handler_fn`]
pub struct HandlerFn<F> {
    name: &'static str,
    f: F,
}

/// Wrap a closure as a [`Handler`].
///
/// ```ignore
/// let handler = handler_fn("bump-first-arg", |ctx| {
///     async move {
///         if let Some(n) = ctx.args().first().and_then(|v| v.as_i64()) {
///             ctx.args_mut()[0] = (n + 1).into();
///         }
///         ctx.advance().await;
///     }
///     .boxed()
/// });
/// ```
pub fn handler_fn<F>(name: &'static str, f: F) -> HandlerFn<F>
where
    F: for<'c> Fn(&'c mut CallContext) -> BoxFuture<'c, ()> + Send + Sync,
{
    HandlerFn { name, f }
}

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'c> Fn(&'c mut CallContext) -> BoxFuture<'c, ()> + Send + Sync,
{
    fn name(&self) -> &'static str {
        self.name
    }

    async fn handle(&self, ctx: &mut CallContext) {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_render_lowercase() {
        let names: Vec<&str> = OperationKind::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["begin", "commit", "rollback", "exec", "ping", "prepare", "query"]);
        assert_eq!(Origin::Statement.to_string(), "statement");
    }

    #[test]
    fn only_statement_kinds_carry_query_text() {
        assert!(OperationKind::Query.has_query());
        assert!(OperationKind::Prepare.has_query());
        assert!(!OperationKind::Ping.has_query());
        assert!(!OperationKind::Commit.has_query());
    }

    #[test]
    fn kinds_serialize_lowercase() {
        let json = serde_json::to_string(&OperationKind::Rollback).unwrap();
        assert_eq!(json, "\"rollback\"");
    }
}

// Rejects statements that could modify data
use async_trait::async_trait;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::DbError;
use crate::middleware::context::CallContext;
use crate::middleware::traits::{Handler, OperationKind};

/// Kinds this guard should be registered for
pub const READ_ONLY_KINDS: [OperationKind; 3] =
    [OperationKind::Exec, OperationKind::Prepare, OperationKind::Query];

/// Vetoes any call whose SQL is not made only of read statements.
///
/// The SQL is parsed with the Postgres dialect and checked against an
/// allowlist of statement types. SQL that does not parse is rejected.
/// Side-effecting functions called from a `SELECT` are not detected, so
/// pair this with a read-only database role.
#[derive(Debug, Default, Clone)]
pub struct ReadOnlyGuard;

impl ReadOnlyGuard {
    pub fn new() -> Self {
        Self
    }

    /// Whether every statement in `sql` only reads
    pub fn is_read(sql: &str) -> bool {
        Self::check(sql).is_ok()
    }

    /// Why `sql` is not read-only, or `Ok` when it is
    pub fn check(sql: &str) -> Result<(), String> {
        let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
            .map_err(|e| format!("unparseable SQL: {}", e))?;
        if statements.is_empty() {
            return Err("empty statement".to_string());
        }
        match statements.iter().find(|statement| !statement_is_read(statement)) {
            Some(statement) => Err(format!("{:?}", std::mem::discriminant(statement))),
            None => Ok(()),
        }
    }
}

// Allowlist: any new Statement variant must be reviewed before adding it here
fn statement_is_read(statement: &Statement) -> bool {
    match statement {
        Statement::Query(query) => query_is_read(query),
        Statement::Explain { analyze, statement, .. } => !*analyze || statement_is_read(statement),
        Statement::ExplainTable { .. }
        | Statement::ShowVariable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. } => true,
        _ => false,
    }
}

fn query_is_read(query: &Query) -> bool {
    let ctes_read = query
        .with
        .as_ref()
        .map_or(true, |with| with.cte_tables.iter().all(|cte| query_is_read(&cte.query)));
    ctes_read && set_expr_is_read(&query.body)
}

fn set_expr_is_read(body: &SetExpr) -> bool {
    match body {
        // SELECT ... INTO creates a table
        SetExpr::Select(select) => select.into.is_none(),
        SetExpr::Query(query) => query_is_read(query),
        SetExpr::SetOperation { left, right, .. } => set_expr_is_read(left) && set_expr_is_read(right),
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        _ => false,
    }
}

#[async_trait]
impl Handler for ReadOnlyGuard {
    fn name(&self) -> &'static str {
        "ReadOnlyGuard"
    }

    async fn handle(&self, ctx: &mut CallContext) {
        if !ctx.kind().has_query() {
            ctx.advance().await;
            return;
        }

        match Self::check(ctx.query()) {
            Ok(()) => ctx.advance().await,
            Err(reason) => {
                tracing::warn!(
                    call = %ctx.id(),
                    kind = %ctx.kind(),
                    origin = %ctx.origin(),
                    reason = %reason,
                    "Rejected non-read-only statement"
                );
                ctx.record_error(DbError::rejected("only read-only statements are allowed"));
            }
        }
    }
}

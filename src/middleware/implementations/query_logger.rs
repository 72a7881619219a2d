// Structured log record per intercepted call
use async_trait::async_trait;

use crate::middleware::context::CallContext;
use crate::middleware::traits::Handler;

/// Logs every call it is bound to, after the rest of the chain has finished.
///
/// Register it first so its timing and outcome cover every other handler.
#[derive(Debug, Default, Clone)]
pub struct QueryLogger;

#[async_trait]
impl Handler for QueryLogger {
    fn name(&self) -> &'static str {
        "QueryLogger"
    }

    async fn handle(&self, ctx: &mut CallContext) {
        ctx.advance().await;

        let elapsed_ms = ctx.elapsed().as_secs_f64() * 1000.0;
        match ctx.first_error() {
            Some(error) => tracing::info!(
                call = %ctx.id(),
                kind = %ctx.kind(),
                origin = %ctx.origin(),
                query = ctx.query(),
                args = ctx.args().len(),
                elapsed_ms,
                error = %error,
                "Database call failed"
            ),
            None => tracing::info!(
                call = %ctx.id(),
                kind = %ctx.kind(),
                origin = %ctx.origin(),
                query = ctx.query(),
                args = ctx.args().len(),
                elapsed_ms,
                "Database call"
            ),
        }
    }
}

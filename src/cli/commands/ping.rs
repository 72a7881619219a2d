use serde_json::json;

use crate::cli::utils::output_success;
use crate::cli::OutputFormat;
use crate::database::Database;
use crate::middleware::Cancellation;

pub async fn handle(
    db: &Database,
    cancel: &Cancellation,
    output_format: &OutputFormat,
) -> anyhow::Result<()> {
    let started = std::time::Instant::now();
    db.ping_with(cancel).await?;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    output_success(
        output_format,
        &format!("Database reachable ({}ms)", elapsed_ms),
        Some(json!({ "elapsed_ms": elapsed_ms })),
    )
}

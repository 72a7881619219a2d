use serde_json::json;

use crate::cli::utils::{output_rows, output_success, parse_args};
use crate::cli::{OutputFormat, SqlArgs};
use crate::database::Database;
use crate::middleware::Cancellation;
use crate::types::TxOptions;

pub async fn query(
    db: &Database,
    cancel: &Cancellation,
    cmd: SqlArgs,
    output_format: &OutputFormat,
) -> anyhow::Result<()> {
    let args = parse_args(&cmd.args);

    let rows = if cmd.tx {
        let tx = db.begin_with(cancel, TxOptions::default()).await?;
        let rows = if cmd.prepare {
            tx.prepare_with(cancel, &cmd.sql).await?.query_with(cancel, &args).await
        } else {
            tx.query_with(cancel, &cmd.sql, &args).await
        };
        match rows {
            Ok(rows) => {
                tx.commit_with(cancel).await?;
                rows
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        }
    } else if cmd.prepare {
        let stmt = db.prepare_with(cancel, &cmd.sql).await?;
        let rows = stmt.query_with(cancel, &args).await;
        stmt.close().await?;
        rows?
    } else {
        db.query_with(cancel, &cmd.sql, &args).await?
    };

    output_rows(output_format, &rows)
}

pub async fn exec(
    db: &Database,
    cancel: &Cancellation,
    cmd: SqlArgs,
    output_format: &OutputFormat,
) -> anyhow::Result<()> {
    let args = parse_args(&cmd.args);

    let result = if cmd.tx {
        let tx = db.begin_with(cancel, TxOptions::default()).await?;
        let result = if cmd.prepare {
            tx.prepare_with(cancel, &cmd.sql).await?.exec_with(cancel, &args).await
        } else {
            tx.exec_with(cancel, &cmd.sql, &args).await
        };
        match result {
            Ok(result) => {
                tx.commit_with(cancel).await?;
                result
            }
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        }
    } else if cmd.prepare {
        let stmt = db.prepare_with(cancel, &cmd.sql).await?;
        let result = stmt.exec_with(cancel, &args).await;
        stmt.close().await?;
        result?
    } else {
        db.exec_with(cancel, &cmd.sql, &args).await?
    };

    output_success(
        output_format,
        &format!("{} row(s) affected", result.rows_affected),
        Some(json!({ "rows_affected": result.rows_affected })),
    )
}

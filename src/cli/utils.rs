use serde_json::{json, Value};

use crate::cli::OutputFormat;
use crate::types::Row;

/// Output a success message in the appropriate format
pub fn output_success(
    output_format: &OutputFormat,
    message: &str,
    data: Option<Value>,
) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            let mut response = json!({
                "success": true,
                "message": message
            });

            if let (Some(response), Some(Value::Object(extra))) = (response.as_object_mut(), data) {
                response.extend(extra);
            }

            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Text => {
            println!("✓ {}", message);
        }
    }
    Ok(())
}

/// Output result rows: a JSON array, or one tab-separated line per row under a header
pub fn output_rows(output_format: &OutputFormat, rows: &[Row]) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(rows)?);
        }
        OutputFormat::Text => {
            print!("{}", format_table(rows));
            println!("({} row{})", rows.len(), if rows.len() == 1 { "" } else { "s" });
        }
    }
    Ok(())
}

fn format_table(rows: &[Row]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };

    let columns: Vec<&String> = first.keys().collect();
    let mut out = columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join("\t");
    out.push('\n');

    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| match row.get(column.as_str()) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "NULL".to_string(),
                Some(other) => other.to_string(),
            })
            .collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}

/// Parse `--arg` values as JSON, falling back to plain strings
pub fn parse_args(raw: &[String]) -> Vec<Value> {
    raw.iter()
        .map(|arg| serde_json::from_str(arg).unwrap_or_else(|_| Value::String(arg.clone())))
        .collect()
}

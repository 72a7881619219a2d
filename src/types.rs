/// Shared value types passed between call-scope objects, handlers and drivers

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A single result row, keyed by column name
pub type Row = Map<String, Value>;

/// Rows returned by a query
pub type Rows = Vec<Row>;

/// Outcome of a statement that does not return rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Only populated by drivers that report generated keys
    pub last_insert_id: Option<i64>,
}

/// Isolation levels understood by `TxOptions`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options for beginning a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
}

impl TxOptions {
    pub fn read_only() -> Self {
        Self { isolation: None, read_only: true }
    }

    pub fn isolation(level: IsolationLevel) -> Self {
        Self { isolation: Some(level), read_only: false }
    }

    /// `SET TRANSACTION` statement for these options, or `None` for driver defaults
    pub fn to_set_transaction(&self) -> Option<String> {
        let mut modes = Vec::new();
        if let Some(level) = self.isolation {
            modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
        }
        if self.read_only {
            modes.push("READ ONLY".to_string());
        }

        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}

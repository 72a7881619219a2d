// Error types shared by call-scope objects, handlers and drivers
use thiserror::Error;

use crate::middleware::OperationKind;

/// Failure of a single database call.
///
/// Handlers and the terminal driver call both record these on the call
/// context; only the first one recorded is returned to the caller.
#[derive(Debug, Error)]
pub enum DbError {
    /// Recorded by a handler that refused the call
    #[error("{0}")]
    Rejected(String),

    #[error("Driver error: {0}")]
    Driver(String),

    #[error("Transaction has already been committed or rolled back")]
    TxDone,

    #[error("Statement is closed")]
    StmtClosed,

    #[error("Call cancelled")]
    Cancelled,

    #[error("Call deadline exceeded")]
    DeadlineExceeded,

    #[error("Middleware stopped the {kind} call without a result")]
    NoResult { kind: OperationKind },

    #[error("Missing configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("Invalid database URL")]
    InvalidDatabaseUrl,

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

impl DbError {
    /// Failure a handler records when it vetoes a call
    pub fn rejected(message: impl Into<String>) -> Self {
        DbError::Rejected(message.into())
    }

    pub fn driver(message: impl Into<String>) -> Self {
        DbError::Driver(message.into())
    }

    /// Whether this failure was produced by middleware rather than the driver
    pub fn is_rejection(&self) -> bool {
        matches!(self, DbError::Rejected(_) | DbError::NoResult { .. })
    }
}

pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod middleware;
pub mod types;

#[cfg(test)]
pub mod testing;

pub use database::{Connection, Database, Statement, Transaction};
pub use error::DbError;
pub use middleware::{handler_fn, CallContext, Cancellation, Handler, OperationKind, Origin, SetupError};
pub use types::{ExecResult, IsolationLevel, Row, Rows, TxOptions};

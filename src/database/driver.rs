// Driver collaborators wrapped by the call-scope objects
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DbError;
use crate::types::{ExecResult, Rows, TxOptions};

/// A connection pool. Calls made here may run on any pooled connection.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn ping(&self) -> Result<(), DbError>;

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError>;

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError>;

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError>;

    async fn begin(&self, options: TxOptions) -> Result<Arc<dyn DriverTx>, DbError>;

    /// Reserve one connection from the pool
    async fn conn(&self) -> Result<Arc<dyn DriverConn>, DbError>;

    async fn close(&self) -> Result<(), DbError>;
}

/// A single reserved connection
#[async_trait]
pub trait DriverConn: Send + Sync {
    async fn ping(&self) -> Result<(), DbError>;

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError>;

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError>;

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError>;

    async fn begin(&self, options: TxOptions) -> Result<Arc<dyn DriverTx>, DbError>;

    /// Return the connection to the pool
    async fn close(&self) -> Result<(), DbError>;
}

/// An open transaction
#[async_trait]
pub trait DriverTx: Send + Sync {
    async fn commit(&self) -> Result<(), DbError>;

    async fn rollback(&self) -> Result<(), DbError>;

    async fn exec(&self, query: &str, args: &[Value]) -> Result<ExecResult, DbError>;

    async fn query(&self, query: &str, args: &[Value]) -> Result<Rows, DbError>;

    async fn prepare(&self, query: &str) -> Result<Arc<dyn DriverStmt>, DbError>;
}

/// A prepared statement, bound to the object that prepared it
#[async_trait]
pub trait DriverStmt: Send + Sync {
    async fn exec(&self, args: &[Value]) -> Result<ExecResult, DbError>;

    async fn query(&self, args: &[Value]) -> Result<Rows, DbError>;

    async fn close(&self) -> Result<(), DbError>;
}

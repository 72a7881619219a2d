pub mod conn;
pub mod db;
pub mod driver;
pub mod postgres;
pub mod stmt;
pub mod tx;

pub use conn::Connection;
pub use db::Database;
pub use driver::{Driver, DriverConn, DriverStmt, DriverTx};
pub use postgres::PgDriver;
pub use stmt::Statement;
pub use tx::Transaction;

pub mod ping;
pub mod sql;

//! Device-local libSQL database backing the key-value store

mod connection;
mod kv_repository;
mod migrations;

pub use connection::Database;
pub use kv_repository::LibSqlKvRepository;

//! SQLite storage layer.
//!
//! A single-connection `ExecutionStore` implementation in WAL mode with
//! foreign key enforcement. Transaction state lives on the connection; the
//! engine serializes all access through one logical thread of control.

pub mod store;

pub use store::SqliteExecutionStore;

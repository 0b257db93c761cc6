//! Infrastructure layer for Riverrun.
//!
//! Implements the storage traits from `riverrun-core` against SQLite.

pub mod sqlite;

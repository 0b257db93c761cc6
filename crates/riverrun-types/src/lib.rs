//! Shared domain types for the riverrun process engine.
//!
//! Persisted record shapes, the immutable process-definition graph, engine
//! events, and the error taxonomy. Both `riverrun-core` (engine) and
//! `riverrun-infra` (SQLite storage) build on these types.

pub mod definition;
pub mod error;
pub mod event;
pub mod execution;

//! Execution-synchronization engine for riverrun.
//!
//! The core of the runtime: the live execution tree and its dirty tracking,
//! the recursive tree-to-storage synchronization, the unit-of-work
//! coordinator wrapping every batch of execution steps in a transaction,
//! parallel-gateway fork/join behavior, and the business command handlers
//! that run inside a batch.
//!
//! Storage is abstracted behind the [`store::ExecutionStore`] trait;
//! `riverrun-infra` provides the SQLite implementation and
//! [`store::memory::MemoryExecutionStore`] serves embedded and test use.

pub mod behavior;
pub mod command;
pub mod engine;
pub mod event;
pub mod store;

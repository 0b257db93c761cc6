//! Storage trait for the execution engine.
//!
//! Defines the persistence interface the synchronization engine writes
//! through: transaction control plus row operations for the three persisted
//! tables (executions, event subscriptions, user tasks). The infrastructure
//! layer (riverrun-infra) implements this trait with SQLite; the in-memory
//! implementation in [`memory`] backs embedded use and tests.
//!
//! Uses native async fn in traits (RPITIT, Rust 2024 edition). Methods take
//! `&mut self` because the engine owns exactly one store and one logical
//! thread of control drives it; the open transaction is connection state.

pub mod memory;

use riverrun_types::error::StorageError;
use riverrun_types::execution::{EventSubscriptionRecord, ExecutionRecord, UserTaskRecord};
use uuid::Uuid;

/// Persistence interface for execution rows and the business tables that
/// ride the same transaction.
pub trait ExecutionStore: Send {
    /// Whether a transaction is currently open on this store.
    fn in_transaction(&self) -> bool;

    /// Open a transaction. The coordinator calls this only at depth 0.
    fn begin(&mut self) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Commit the open transaction.
    fn commit(&mut self) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Roll back the open transaction.
    fn rollback(&mut self) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Execution rows
    // -----------------------------------------------------------------------

    /// Insert a new execution row. The parent row, if any, must already be
    /// persisted.
    fn insert_execution(
        &mut self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Update every persisted field of an existing execution row.
    fn update_execution(
        &mut self,
        record: &ExecutionRecord,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Delete an execution row. Child rows must already be gone.
    fn delete_execution(
        &mut self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Load every execution row sharing the root process of the given
    /// execution id, in id order. Returns an empty vec when the id is
    /// unknown.
    fn load_process_executions(
        &mut self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<ExecutionRecord>, StorageError>> + Send;

    // -----------------------------------------------------------------------
    // Business rows (command handlers)
    // -----------------------------------------------------------------------

    /// Insert an event subscription row.
    fn insert_subscription(
        &mut self,
        record: &EventSubscriptionRecord,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Insert a user task row.
    fn insert_user_task(
        &mut self,
        record: &UserTaskRecord,
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;

    /// Fetch a user task row by id.
    fn find_user_task(
        &mut self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<UserTaskRecord>, StorageError>> + Send;
}

//! In-memory `ExecutionStore` for embedded use and tests.
//!
//! Mirrors the SQLite backend's behavior closely enough to exercise the
//! engine without a database: referential checks on parent links, cascade
//! removal of business rows, snapshot-based transactions, and write counters
//! that make idempotence observable.

use std::collections::BTreeMap;

use riverrun_types::error::StorageError;
use riverrun_types::execution::{EventSubscriptionRecord, ExecutionRecord, UserTaskRecord};
use uuid::Uuid;

use super::ExecutionStore;

/// Running totals of write operations issued against the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl WriteCounts {
    pub fn total(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    executions: BTreeMap<Uuid, ExecutionRecord>,
    subscriptions: BTreeMap<Uuid, EventSubscriptionRecord>,
    tasks: BTreeMap<Uuid, UserTaskRecord>,
}

/// Map-backed store with snapshot transactions.
#[derive(Debug, Default)]
pub struct MemoryExecutionStore {
    tables: Tables,
    /// Snapshot taken at `begin`, restored on `rollback`.
    checkpoint: Option<Tables>,
    writes: WriteCounts,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write counters since construction (or the last [`reset_writes`]).
    ///
    /// [`reset_writes`]: Self::reset_writes
    pub fn write_counts(&self) -> WriteCounts {
        self.writes
    }

    pub fn reset_writes(&mut self) {
        self.writes = WriteCounts::default();
    }

    /// Number of execution rows currently stored.
    pub fn execution_count(&self) -> usize {
        self.tables.executions.len()
    }

    /// Fetch a stored execution row by id.
    pub fn execution(&self, id: Uuid) -> Option<&ExecutionRecord> {
        self.tables.executions.get(&id)
    }

    /// All stored subscription rows, in id order.
    pub fn subscriptions(&self) -> Vec<&EventSubscriptionRecord> {
        self.tables.subscriptions.values().collect()
    }

    /// All stored user-task rows, in id order.
    pub fn user_tasks(&self) -> Vec<&UserTaskRecord> {
        self.tables.tasks.values().collect()
    }

    fn no_transaction() -> StorageError {
        StorageError::Query("no open transaction".into())
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn in_transaction(&self) -> bool {
        self.checkpoint.is_some()
    }

    async fn begin(&mut self) -> Result<(), StorageError> {
        if self.checkpoint.is_some() {
            return Err(StorageError::Query("transaction already open".into()));
        }
        self.checkpoint = Some(self.tables.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StorageError> {
        self.checkpoint.take().map(|_| ()).ok_or_else(Self::no_transaction)
    }

    async fn rollback(&mut self) -> Result<(), StorageError> {
        let snapshot = self.checkpoint.take().ok_or_else(Self::no_transaction)?;
        self.tables = snapshot;
        Ok(())
    }

    async fn insert_execution(&mut self, record: &ExecutionRecord) -> Result<(), StorageError> {
        if let Some(parent) = record.parent_id
            && !self.tables.executions.contains_key(&parent)
        {
            return Err(StorageError::Conflict(format!(
                "execution {} references missing parent {parent}",
                record.id
            )));
        }
        if self.tables.executions.contains_key(&record.id) {
            return Err(StorageError::Conflict(format!(
                "execution {} already exists",
                record.id
            )));
        }
        self.tables.executions.insert(record.id, record.clone());
        self.writes.inserts += 1;
        Ok(())
    }

    async fn update_execution(&mut self, record: &ExecutionRecord) -> Result<(), StorageError> {
        if !self.tables.executions.contains_key(&record.id) {
            return Err(StorageError::NotFound);
        }
        self.tables.executions.insert(record.id, record.clone());
        self.writes.updates += 1;
        Ok(())
    }

    async fn delete_execution(&mut self, id: Uuid) -> Result<(), StorageError> {
        if self
            .tables
            .executions
            .values()
            .any(|r| r.parent_id == Some(id))
        {
            return Err(StorageError::Conflict(format!(
                "execution {id} still has child rows"
            )));
        }
        if self.tables.executions.remove(&id).is_none() {
            return Err(StorageError::NotFound);
        }
        // Business rows cascade with their execution, as the SQLite schema does.
        self.tables.subscriptions.retain(|_, s| s.execution_id != id);
        self.tables.tasks.retain(|_, t| t.execution_id != id);
        self.writes.deletes += 1;
        Ok(())
    }

    async fn load_process_executions(
        &mut self,
        id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, StorageError> {
        let Some(record) = self.tables.executions.get(&id) else {
            return Ok(Vec::new());
        };
        let process_id = record.process_id;
        Ok(self
            .tables
            .executions
            .values()
            .filter(|r| r.process_id == process_id)
            .cloned()
            .collect())
    }

    async fn insert_subscription(
        &mut self,
        record: &EventSubscriptionRecord,
    ) -> Result<(), StorageError> {
        if !self.tables.executions.contains_key(&record.execution_id) {
            return Err(StorageError::Conflict(format!(
                "subscription references missing execution {}",
                record.execution_id
            )));
        }
        self.tables.subscriptions.insert(record.id, record.clone());
        self.writes.inserts += 1;
        Ok(())
    }

    async fn insert_user_task(&mut self, record: &UserTaskRecord) -> Result<(), StorageError> {
        if !self.tables.executions.contains_key(&record.execution_id) {
            return Err(StorageError::Conflict(format!(
                "user task references missing execution {}",
                record.execution_id
            )));
        }
        self.tables.tasks.insert(record.id, record.clone());
        self.writes.inserts += 1;
        Ok(())
    }

    async fn find_user_task(&mut self, id: Uuid) -> Result<Option<UserTaskRecord>, StorageError> {
        Ok(self.tables.tasks.get(&id).cloned())
    }
}

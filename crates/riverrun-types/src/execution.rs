//! Persisted record shapes for the execution engine.
//!
//! `ExecutionRecord` is the snapshot of one execution-tree node as it lives
//! in storage. Dirty tracking compares these snapshots by value, so the
//! struct derives `PartialEq` and every field mirrors a column exactly.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription flag: the subscription reacts to a signal.
pub const SUB_FLAG_SIGNAL: u32 = 1;

/// Subscription flag: the subscription reacts to a message.
pub const SUB_FLAG_MESSAGE: u32 = 2;

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Lifecycle state of an execution node, persisted as an integer bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionState(u32);

impl ExecutionState {
    /// The execution is actively advancing through the graph.
    pub const ACTIVE: u32 = 1;
    /// The execution is suspended, waiting for an external stimulus.
    pub const WAITING: u32 = 2;
    /// The execution is a concurrent branch created by a fork.
    pub const CONCURRENT: u32 = 4;
    /// The execution has ended and its row is pending removal.
    pub const TERMINATED: u32 = 8;

    pub fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    #[must_use]
    pub fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    #[must_use]
    pub fn without(self, flag: u32) -> Self {
        Self(self.0 & !flag)
    }

    pub fn is_active(self) -> bool {
        self.contains(Self::ACTIVE)
    }

    pub fn is_waiting(self) -> bool {
        self.contains(Self::WAITING)
    }

    pub fn is_concurrent(self) -> bool {
        self.contains(Self::CONCURRENT)
    }

    pub fn is_terminated(self) -> bool {
        self.contains(Self::TERMINATED)
    }
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self(Self::ACTIVE)
    }
}

// ---------------------------------------------------------------------------
// ExecutionRecord
// ---------------------------------------------------------------------------

/// Serializable snapshot of one execution node's persisted fields.
///
/// Invariants: a non-root record's `parent_id` references an existing record
/// in the same process; the root record has `parent_id = None` and its own
/// id equals `process_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Execution id (UUIDv7).
    pub id: Uuid,
    /// Parent execution, `None` for the process root.
    pub parent_id: Option<Uuid>,
    /// Root process instance id (equals `id` for the root).
    pub process_id: Uuid,
    /// Process definition the execution walks.
    pub definition_id: Uuid,
    /// Lifecycle state bitmask.
    pub state: ExecutionState,
    /// Last-activity timestamp, fractional seconds since the Unix epoch.
    pub active_at: f64,
    /// Current node id within the definition, if positioned on a node.
    pub node: Option<String>,
    /// Current transition id within the definition, if mid-transition.
    pub transition: Option<String>,
    /// Caller-supplied opaque correlation key.
    pub business_key: Option<String>,
    /// Variable scope, encoded as an opaque marker-prefixed blob.
    pub variables: Vec<u8>,
}

// ---------------------------------------------------------------------------
// EventSubscriptionRecord
// ---------------------------------------------------------------------------

/// Persisted event subscription keyed by execution + process + name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSubscriptionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub process_id: Uuid,
    /// Bitmask of `SUB_FLAG_SIGNAL` / `SUB_FLAG_MESSAGE`.
    pub flags: u32,
    pub name: String,
    /// Creation time, epoch seconds.
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// UserTaskRecord
// ---------------------------------------------------------------------------

/// Persisted user task referencing the execution's current node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTaskRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub name: String,
    pub documentation: Option<String>,
    /// Id of the node the task originated from.
    pub activity: String,
    /// Creation time, epoch seconds.
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_flags_compose() {
        let state = ExecutionState::default()
            .with(ExecutionState::CONCURRENT)
            .with(ExecutionState::WAITING);
        assert!(state.is_active());
        assert!(state.is_concurrent());
        assert!(state.is_waiting());
        assert!(!state.is_terminated());

        let resumed = state.without(ExecutionState::WAITING);
        assert!(!resumed.is_waiting());
        assert!(resumed.is_concurrent());
    }

    #[test]
    fn record_equality_is_field_by_field() {
        let id = Uuid::now_v7();
        let record = ExecutionRecord {
            id,
            parent_id: None,
            process_id: id,
            definition_id: Uuid::now_v7(),
            state: ExecutionState::default(),
            active_at: 1000.5,
            node: Some("start".into()),
            transition: None,
            business_key: None,
            variables: vec![1, 2, 3],
        };

        let mut other = record.clone();
        assert_eq!(record, other);

        other.node = Some("end".into());
        assert_ne!(record, other);
    }
}

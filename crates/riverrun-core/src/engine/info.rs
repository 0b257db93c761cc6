//! Dirty tracking for one execution node.
//!
//! `ExecutionInfo` pairs a live node with the snapshot last persisted for it.
//! Classification is a pure value comparison of record snapshots, so no-op
//! re-reads never trigger writes and replaying a synchronization pass with no
//! intervening mutation performs zero I/O.

use riverrun_types::execution::ExecutionRecord;

use super::execution::Execution;

/// Persistence status of a tracked node relative to its last snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Snapshot is identical; no I/O.
    Unchanged,
    /// Never persisted; requires an insert.
    New,
    /// Persisted before and at least one field differs; requires an update.
    Modified,
    /// No longer part of its tracked tree; requires a delete (if it was
    /// ever persisted).
    Removed,
}

/// A tracked execution together with its last-persisted snapshot.
#[derive(Debug)]
pub struct ExecutionInfo {
    execution: Execution,
    clean: Option<ExecutionRecord>,
}

impl ExecutionInfo {
    pub fn new(execution: Execution, clean: Option<ExecutionRecord>) -> Self {
        Self { execution, clean }
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    pub fn execution_mut(&mut self) -> &mut Execution {
        &mut self.execution
    }

    /// Whether the node has ever been persisted.
    pub fn is_persisted(&self) -> bool {
        self.clean.is_some()
    }

    /// Classify the node against its current snapshot. Pure: storage is
    /// never touched and nothing is mutated.
    pub fn classify(&self, current: &ExecutionRecord) -> DirtyState {
        if self.execution.state().is_terminated() {
            return DirtyState::Removed;
        }
        match &self.clean {
            None => DirtyState::New,
            Some(clean) if clean != current => DirtyState::Modified,
            Some(_) => DirtyState::Unchanged,
        }
    }

    /// Record the snapshot that was just persisted as the new baseline.
    pub fn commit(&mut self, snapshot: ExecutionRecord) {
        self.clean = Some(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riverrun_types::definition::{Node, NodeBehavior, ProcessDefinition};
    use riverrun_types::execution::ExecutionState;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use uuid::Uuid;

    fn sample() -> Execution {
        let definition = Arc::new(ProcessDefinition::new(
            Uuid::now_v7(),
            "d",
            "n",
            vec![Node {
                id: "n".into(),
                name: None,
                behavior: NodeBehavior::PassThrough,
            }],
            vec![],
        ));
        Execution::new_root(definition, None, BTreeMap::new())
    }

    #[test]
    fn classification_transitions() {
        let execution = sample();
        let record = execution.to_record().unwrap();
        let mut info = ExecutionInfo::new(execution, None);

        assert_eq!(info.classify(&record), DirtyState::New);

        info.commit(record.clone());
        assert_eq!(info.classify(&record), DirtyState::Unchanged);

        info.execution_mut().set_node(Some("n".into()));
        let current = info.execution().to_record().unwrap();
        assert_eq!(info.classify(&current), DirtyState::Modified);

        let terminated = info.execution().state().with(ExecutionState::TERMINATED);
        info.execution_mut().set_state(terminated);
        let current = info.execution().to_record().unwrap();
        assert_eq!(info.classify(&current), DirtyState::Removed);
    }

    #[test]
    fn never_persisted_and_terminated_reports_removed_without_baseline() {
        let execution = sample();
        let mut info = ExecutionInfo::new(execution, None);
        let terminated = info.execution().state().with(ExecutionState::TERMINATED);
        info.execution_mut().set_state(terminated);

        let current = info.execution().to_record().unwrap();
        assert_eq!(info.classify(&current), DirtyState::Removed);
        // The sync engine consults is_persisted() and skips the delete.
        assert!(!info.is_persisted());
    }
}

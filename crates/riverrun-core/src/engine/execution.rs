//! Live execution-tree node.
//!
//! Executions form an arena: the engine's tracked set maps ids to nodes, and
//! parent/child links are stored as ids rather than live pointers, so
//! ownership stays acyclic. Every node shares its process definition by
//! `Arc`; current node and transition are ids into that definition.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use riverrun_types::definition::ProcessDefinition;
use riverrun_types::error::ConsistencyError;
use riverrun_types::execution::{ExecutionRecord, ExecutionState};
use serde_json::Value;
use uuid::Uuid;

use super::binary;

/// One live node of a running process instance's tree.
#[derive(Debug, Clone)]
pub struct Execution {
    id: Uuid,
    parent: Option<Uuid>,
    children: Vec<Uuid>,
    process_id: Uuid,
    definition: Arc<ProcessDefinition>,
    state: ExecutionState,
    node: Option<String>,
    transition: Option<String>,
    business_key: Option<String>,
    variables: BTreeMap<String, Value>,
    active_at: f64,
}

fn now_seconds() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1_000_000.0
}

impl Execution {
    /// Create the root node of a new process instance. The root's id doubles
    /// as the process id.
    pub fn new_root(
        definition: Arc<ProcessDefinition>,
        business_key: Option<String>,
        variables: BTreeMap<String, Value>,
    ) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            parent: None,
            children: Vec::new(),
            process_id: id,
            definition,
            state: ExecutionState::default(),
            node: None,
            transition: None,
            business_key,
            variables,
            active_at: now_seconds(),
        }
    }

    /// Create a concurrent child branch under the given parent. The caller
    /// wires the id into the parent's child list.
    pub fn new_concurrent_child(parent: &Execution) -> Self {
        Self {
            id: Uuid::now_v7(),
            parent: Some(parent.id),
            children: Vec::new(),
            process_id: parent.process_id,
            definition: parent.definition.clone(),
            state: ExecutionState::default().with(ExecutionState::CONCURRENT),
            node: None,
            transition: None,
            business_key: parent.business_key.clone(),
            variables: BTreeMap::new(),
            active_at: now_seconds(),
        }
    }

    /// Rebuild a node from a persisted record during process reconstruction.
    /// Parent/child links are wired afterwards from the parent-id column.
    pub fn from_record(
        record: &ExecutionRecord,
        definition: Arc<ProcessDefinition>,
    ) -> Result<Self, ConsistencyError> {
        if let Some(node) = &record.node
            && definition.find_node(node).is_none()
        {
            return Err(ConsistencyError::UnknownNode(node.clone()));
        }
        if let Some(transition) = &record.transition
            && definition.find_transition(transition).is_none()
        {
            return Err(ConsistencyError::UnknownTransition(transition.clone()));
        }

        Ok(Self {
            id: record.id,
            parent: record.parent_id,
            children: Vec::new(),
            process_id: record.process_id,
            definition,
            state: record.state,
            node: record.node.clone(),
            transition: record.transition.clone(),
            business_key: record.business_key.clone(),
            variables: binary::decode(&record.variables)?,
            active_at: record.active_at,
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn children(&self) -> &[Uuid] {
        &self.children
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    pub fn definition(&self) -> &Arc<ProcessDefinition> {
        &self.definition
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn transition(&self) -> Option<&str> {
        self.transition.as_deref()
    }

    pub fn business_key(&self) -> Option<&str> {
        self.business_key.as_deref()
    }

    pub fn active_at(&self) -> f64 {
        self.active_at
    }

    /// Locally stored variable, without the parent lookup chain.
    pub fn local_variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    // -----------------------------------------------------------------------
    // Mutators (each touches the activity timestamp)
    // -----------------------------------------------------------------------

    pub fn touch(&mut self) {
        self.active_at = now_seconds();
    }

    pub fn set_state(&mut self, state: ExecutionState) {
        self.state = state;
        self.touch();
    }

    pub fn set_node(&mut self, node: Option<String>) {
        self.node = node;
        self.touch();
    }

    pub fn set_transition(&mut self, transition: Option<String>) {
        self.transition = transition;
        self.touch();
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
        self.touch();
    }

    /// Replace the whole local variable scope.
    pub fn set_variables(&mut self, variables: BTreeMap<String, Value>) {
        self.variables = variables;
        self.touch();
    }

    pub fn remove_variable(&mut self, name: &str) -> Option<Value> {
        let removed = self.variables.remove(name);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub(crate) fn add_child(&mut self, child: Uuid) {
        self.children.push(child);
    }

    pub(crate) fn remove_child(&mut self, child: Uuid) {
        self.children.retain(|c| *c != child);
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    /// Snapshot the node into its persisted record shape.
    pub fn to_record(&self) -> Result<ExecutionRecord, ConsistencyError> {
        Ok(ExecutionRecord {
            id: self.id,
            parent_id: self.parent,
            process_id: self.process_id,
            definition_id: self.definition.id,
            state: self.state,
            active_at: self.active_at,
            node: self.node.clone(),
            transition: self.transition.clone(),
            business_key: self.business_key.clone(),
            variables: binary::encode(&self.variables)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riverrun_types::definition::{Node, NodeBehavior, Transition};
    use serde_json::json;

    fn definition() -> Arc<ProcessDefinition> {
        Arc::new(ProcessDefinition::new(
            Uuid::now_v7(),
            "test",
            "start",
            vec![
                Node {
                    id: "start".into(),
                    name: None,
                    behavior: NodeBehavior::PassThrough,
                },
                Node {
                    id: "end".into(),
                    name: None,
                    behavior: NodeBehavior::End,
                },
            ],
            vec![Transition {
                id: "t0".into(),
                from: "start".into(),
                to: "end".into(),
            }],
        ))
    }

    #[test]
    fn root_id_equals_process_id() {
        let root = Execution::new_root(definition(), Some("order-7".into()), BTreeMap::new());
        assert_eq!(root.id(), root.process_id());
        assert!(root.parent().is_none());
        assert!(root.state().is_active());
    }

    #[test]
    fn child_inherits_process_and_definition() {
        let root = Execution::new_root(definition(), None, BTreeMap::new());
        let child = Execution::new_concurrent_child(&root);
        assert_eq!(child.process_id(), root.process_id());
        assert_eq!(child.parent(), Some(root.id()));
        assert!(child.state().is_concurrent());
    }

    #[test]
    fn record_round_trip_preserves_fields() {
        let mut vars = BTreeMap::new();
        vars.insert("x".to_string(), json!(1));
        let mut root = Execution::new_root(definition(), Some("bk".into()), vars);
        root.set_node(Some("start".into()));

        let record = root.to_record().unwrap();
        let rebuilt = Execution::from_record(&record, root.definition().clone()).unwrap();

        assert_eq!(rebuilt.id(), root.id());
        assert_eq!(rebuilt.node(), Some("start"));
        assert_eq!(rebuilt.business_key(), Some("bk"));
        assert_eq!(rebuilt.variables(), root.variables());
        assert_eq!(rebuilt.to_record().unwrap(), record);
    }

    #[test]
    fn from_record_rejects_unknown_node() {
        let root = Execution::new_root(definition(), None, BTreeMap::new());
        let mut record = root.to_record().unwrap();
        record.node = Some("nope".into());

        let err = Execution::from_record(&record, root.definition().clone()).unwrap_err();
        assert!(matches!(err, ConsistencyError::UnknownNode(_)));
    }

    #[test]
    fn mutation_touches_timestamp() {
        let mut root = Execution::new_root(definition(), None, BTreeMap::new());
        let before = root.active_at();
        std::thread::sleep(std::time::Duration::from_millis(2));
        root.set_variable("k", json!(1));
        assert!(root.active_at() > before);
    }
}

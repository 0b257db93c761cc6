//! Immutable process-definition graph.
//!
//! A `ProcessDefinition` is the shared graph of nodes and transitions that
//! executions traverse. Definitions are deployed once, cached by id, and
//! shared by reference (`Arc`) across every node of the same process; the
//! engine never mutates them. Authoring and validation of definitions
//! happen elsewhere; the engine only consumes the lookup interface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Expression
// ---------------------------------------------------------------------------

/// Value expression for human-readable attributes (names, documentation).
///
/// Resolved against an execution's variable chain at the point of use; this
/// is deliberately minimal, a full expression language is not part of the
/// execution-consistency core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    /// A fixed string.
    Literal { value: String },
    /// A reference to a variable, looked up along the parent chain.
    Variable { name: String },
}

impl Expression {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal {
            value: value.into(),
        }
    }

    pub fn variable(name: impl Into<String>) -> Self {
        Self::Variable { name: name.into() }
    }
}

// ---------------------------------------------------------------------------
// NodeBehavior
// ---------------------------------------------------------------------------

/// Behavior a node exhibits when an execution arrives on it.
///
/// Tagged variant rather than trait objects: the gateway's join-counting
/// state is explicit data on the execution, not hidden object identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeBehavior {
    /// Signals activity start/completion and takes the single outgoing
    /// transition.
    PassThrough,
    /// Creates a user task row and suspends until signaled.
    UserTask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        documentation: Option<Expression>,
    },
    /// Creates a message subscription and suspends until signaled.
    MessageCatch { message: String },
    /// Resolves a delegate task through the engine's factory and runs it
    /// synchronously, then takes the single outgoing transition.
    ServiceTask { task_type: String },
    /// Parallel gateway: forks into all outgoing transitions, or joins
    /// concurrent branches arriving over multiple incoming transitions.
    ParallelGateway,
    /// Ends the execution (terminates the branch, or the whole process when
    /// reached by the root).
    End,
}

// ---------------------------------------------------------------------------
// Node / Transition
// ---------------------------------------------------------------------------

/// One node of the process graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    /// Human-readable name, resolved per execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<Expression>,
    pub behavior: NodeBehavior,
}

/// A directed edge between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub id: String,
    pub from: String,
    pub to: String,
}

// ---------------------------------------------------------------------------
// ProcessDefinition
// ---------------------------------------------------------------------------

/// Immutable, shared graph of nodes and transitions.
///
/// Node and transition maps are ordered (`BTreeMap`) so that graph walks are
/// deterministic; fork order, for one, is the sorted order of the outgoing
/// transition ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: Uuid,
    pub name: String,
    /// Id of the node every new process instance starts on.
    pub start_node: String,
    nodes: BTreeMap<String, Node>,
    transitions: BTreeMap<String, Transition>,
}

impl ProcessDefinition {
    pub fn new(
        id: Uuid,
        name: impl Into<String>,
        start_node: impl Into<String>,
        nodes: Vec<Node>,
        transitions: Vec<Transition>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            start_node: start_node.into(),
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            transitions: transitions
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect(),
        }
    }

    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn find_transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.get(id)
    }

    /// Transitions leaving the given node, in transition-id order.
    pub fn outgoing(&self, node: &str) -> Vec<&Transition> {
        self.transitions.values().filter(|t| t.from == node).collect()
    }

    /// Transitions arriving at the given node, in transition-id order.
    pub fn incoming(&self, node: &str) -> Vec<&Transition> {
        self.transitions.values().filter(|t| t.to == node).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, behavior: NodeBehavior) -> Node {
        Node {
            id: id.into(),
            name: None,
            behavior,
        }
    }

    fn transition(id: &str, from: &str, to: &str) -> Transition {
        Transition {
            id: id.into(),
            from: from.into(),
            to: to.into(),
        }
    }

    #[test]
    fn lookup_and_edge_queries() {
        let def = ProcessDefinition::new(
            Uuid::now_v7(),
            "order",
            "start",
            vec![
                node("start", NodeBehavior::PassThrough),
                node("fork", NodeBehavior::ParallelGateway),
                node("a", NodeBehavior::PassThrough),
                node("b", NodeBehavior::PassThrough),
            ],
            vec![
                transition("t0", "start", "fork"),
                transition("t2", "fork", "b"),
                transition("t1", "fork", "a"),
            ],
        );

        assert!(def.find_node("fork").is_some());
        assert!(def.find_node("missing").is_none());
        assert_eq!(def.find_transition("t0").unwrap().to, "fork");

        // Outgoing edges come back in sorted transition-id order.
        let out: Vec<&str> = def.outgoing("fork").iter().map(|t| t.id.as_str()).collect();
        assert_eq!(out, vec!["t1", "t2"]);

        let inc: Vec<&str> = def.incoming("fork").iter().map(|t| t.id.as_str()).collect();
        assert_eq!(inc, vec!["t0"]);
    }
}

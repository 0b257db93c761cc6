//! Node behaviors.
//!
//! Dispatches on the tagged [`NodeBehavior`] variant of the node an
//! execution has arrived on. The parallel gateway implements fork/join:
//! forking creates concurrent sibling branches, joining retires arriving
//! branches until the last arrival reactivates the parent scope on the
//! merged continuation.

use riverrun_types::definition::NodeBehavior;
use riverrun_types::error::{ConsistencyError, EngineError};
use riverrun_types::event::EngineEvent;
use riverrun_types::execution::ExecutionState;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::command::{Command, CreateMessageSubscriptionCommand, CreateUserTaskCommand};
use crate::engine::execution::Execution;
use crate::engine::{EngineOp, ProcessEngine};
use crate::store::ExecutionStore;

/// Execute the behavior of the node the execution currently sits on.
pub(crate) async fn execute<S: ExecutionStore>(
    engine: &mut ProcessEngine<S>,
    id: Uuid,
) -> Result<(), EngineError> {
    let execution = engine.execution(id)?;
    let node_id = execution
        .node()
        .ok_or(ConsistencyError::NoCurrentNode(id))?
        .to_string();
    let definition = execution.definition().clone();
    let node = definition
        .find_node(&node_id)
        .ok_or_else(|| ConsistencyError::UnknownNode(node_id.clone()))?;
    let name = engine.string_value(id, node.name.as_ref());

    match node.behavior.clone() {
        NodeBehavior::PassThrough => {
            engine.notify(EngineEvent::ActivityStarted {
                execution_id: id,
                node: node_id.clone(),
                name,
            });
            engine.notify(EngineEvent::ActivityCompleted {
                execution_id: id,
                node: node_id.clone(),
            });
            continue_single(engine, id, &node_id)
        }
        NodeBehavior::UserTask { documentation } => {
            engine.notify(EngineEvent::ActivityStarted {
                execution_id: id,
                node: node_id,
                name: name.clone(),
            });
            let documentation = documentation
                .as_ref()
                .map(|expr| engine.string_value(id, Some(expr)));
            CreateUserTaskCommand {
                execution: id,
                name,
                documentation,
            }
            .execute(engine)
            .await?;
            wait(engine, id)
        }
        NodeBehavior::MessageCatch { message } => {
            engine.notify(EngineEvent::ActivityStarted {
                execution_id: id,
                node: node_id,
                name,
            });
            CreateMessageSubscriptionCommand {
                execution: id,
                message,
            }
            .execute(engine)
            .await?;
            wait(engine, id)
        }
        NodeBehavior::ServiceTask { task_type } => {
            engine.notify(EngineEvent::ActivityStarted {
                execution_id: id,
                node: node_id.clone(),
                name,
            });
            let task = engine.delegate_task(&task_type)?;
            let mut variables = engine.execution(id)?.variables().clone();
            task.run(&mut variables)?;
            if &variables != engine.execution(id)?.variables() {
                engine.execution_mut(id)?.set_variables(variables);
            }
            engine.notify(EngineEvent::ActivityCompleted {
                execution_id: id,
                node: node_id.clone(),
            });
            continue_single(engine, id, &node_id)
        }
        NodeBehavior::ParallelGateway => gateway(engine, id, &node_id, name).await,
        NodeBehavior::End => {
            engine.notify(EngineEvent::ActivityCompleted {
                execution_id: id,
                node: node_id,
            });
            engine.end_execution(id)
        }
    }
}

/// Suspend the execution until an external stimulus signals it.
fn wait<S: ExecutionStore>(engine: &mut ProcessEngine<S>, id: Uuid) -> Result<(), EngineError> {
    let execution = engine.execution_mut(id)?;
    let state = execution.state().with(ExecutionState::WAITING);
    execution.set_state(state);
    Ok(())
}

/// Continue over the node's single outgoing transition; no outgoing
/// transition ends the execution.
pub(crate) fn continue_single<S: ExecutionStore>(
    engine: &mut ProcessEngine<S>,
    id: Uuid,
    node: &str,
) -> Result<(), EngineError> {
    let definition = engine.execution(id)?.definition().clone();
    let outgoing = definition.outgoing(node);
    match outgoing.as_slice() {
        [] => engine.end_execution(id),
        [transition] => {
            engine.enqueue(EngineOp::TakeTransition {
                execution: id,
                transition: transition.id.clone(),
            });
            Ok(())
        }
        many => {
            Err(ConsistencyError::AmbiguousContinuation(node.to_string(), many.len()).into())
        }
    }
}

// ---------------------------------------------------------------------------
// Parallel gateway
// ---------------------------------------------------------------------------

async fn gateway<S: ExecutionStore>(
    engine: &mut ProcessEngine<S>,
    id: Uuid,
    node: &str,
    name: String,
) -> Result<(), EngineError> {
    engine.notify(EngineEvent::ActivityStarted {
        execution_id: id,
        node: node.to_string(),
        name,
    });

    let definition = engine.execution(id)?.definition().clone();
    let incoming = definition.incoming(node).len();
    if incoming > 1 {
        return join(engine, id, node, incoming);
    }

    let outgoing: Vec<String> = definition
        .outgoing(node)
        .iter()
        .map(|t| t.id.clone())
        .collect();
    if outgoing.len() > 1 {
        fork(engine, id, node, outgoing).await
    } else {
        engine.notify(EngineEvent::ActivityCompleted {
            execution_id: id,
            node: node.to_string(),
        });
        continue_single(engine, id, node)
    }
}

/// Fork: one concurrent child branch per outgoing transition, each
/// registered New (and therefore persisted immediately), drained in sorted
/// transition-id order. The parent waits at the gateway until the join.
async fn fork<S: ExecutionStore>(
    engine: &mut ProcessEngine<S>,
    id: Uuid,
    node: &str,
    outgoing: Vec<String>,
) -> Result<(), EngineError> {
    for transition in outgoing {
        let child = Execution::new_concurrent_child(engine.execution(id)?);
        let child_id = child.id();
        engine.execution_mut(id)?.add_child(child_id);
        engine.register_execution(child, None).await?;

        tracing::debug!(parent = %id, child = %child_id, transition, "forked branch");
        engine.enqueue(EngineOp::TakeTransition {
            execution: child_id,
            transition,
        });
    }

    let parent = engine.execution_mut(id)?;
    let state = parent
        .state()
        .with(ExecutionState::WAITING)
        .without(ExecutionState::ACTIVE);
    parent.set_state(state);

    engine.notify(EngineEvent::ActivityCompleted {
        execution_id: id,
        node: node.to_string(),
    });
    Ok(())
}

/// Join: count arrivals in the parent's variable scope so they survive
/// across unit-of-work batches. Every arrival but the last terminates its
/// branch; the last arrival clears the counter and reactivates the parent
/// on the gateway's continuation.
fn join<S: ExecutionStore>(
    engine: &mut ProcessEngine<S>,
    id: Uuid,
    node: &str,
    expected: usize,
) -> Result<(), EngineError> {
    let execution = engine.execution(id)?;
    if !execution.state().is_concurrent() {
        return Err(ConsistencyError::JoinOutsideFork(id, node.to_string()).into());
    }
    let Some(parent_id) = execution.parent() else {
        return Err(ConsistencyError::JoinOutsideFork(id, node.to_string()).into());
    };

    let counter = format!("join:{node}");
    let arrived = engine
        .execution(parent_id)?
        .local_variable(&counter)
        .and_then(Value::as_u64)
        .unwrap_or(0)
        + 1;
    if arrived as usize > expected {
        return Err(ConsistencyError::JoinArity {
            node: node.to_string(),
            expected,
            arrived,
        }
        .into());
    }

    tracing::debug!(execution = %id, node, arrived, expected, "join arrival");

    if (arrived as usize) < expected {
        engine
            .execution_mut(parent_id)?
            .set_variable(counter, json!(arrived));
        return engine.terminate(id);
    }

    // Last arrival: the merged continuation rides the parent scope.
    engine.execution_mut(parent_id)?.remove_variable(&counter);
    engine.terminate(id)?;

    let parent = engine.execution_mut(parent_id)?;
    parent.set_node(Some(node.to_string()));
    let state = parent
        .state()
        .with(ExecutionState::ACTIVE)
        .without(ExecutionState::WAITING);
    parent.set_state(state);

    engine.notify(EngineEvent::ActivityCompleted {
        execution_id: parent_id,
        node: node.to_string(),
    });
    continue_single(engine, parent_id, node)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use riverrun_types::definition::{Expression, Node, ProcessDefinition, Transition};
    use riverrun_types::execution::SUB_FLAG_MESSAGE;

    use super::*;
    use crate::event::bus::EventBus;
    use crate::store::memory::MemoryExecutionStore;

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

    fn engine() -> ProcessEngine<MemoryExecutionStore> {
        ProcessEngine::new(MemoryExecutionStore::new(), EventBus::new(64))
    }

    fn deploy(
        engine: &mut ProcessEngine<MemoryExecutionStore>,
        nodes: Vec<Node>,
        transitions: Vec<Transition>,
    ) -> Uuid {
        let id = Uuid::now_v7();
        engine.deploy(ProcessDefinition::new(id, "test", "start", nodes, transitions));
        id
    }

    #[tokio::test]
    async fn straight_through_process_runs_to_completion() {
        let mut engine = engine();
        let mut events = engine.events().subscribe();
        let definition_id = deploy(
            &mut engine,
            vec![
                node("start", NodeBehavior::PassThrough),
                node("step", NodeBehavior::PassThrough),
                node("end", NodeBehavior::End),
            ],
            vec![
                transition("t0", "start", "step"),
                transition("t1", "step", "end"),
            ],
        );

        engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap();

        // Started and ended inside one batch: nothing survives in storage.
        assert_eq!(engine.store().execution_count(), 0);
        assert_eq!(engine.tracked_count(), 0);

        let mut ended = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::ProcessEnded { .. }) {
                ended = true;
            }
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn single_path_gateway_passes_through() {
        let mut engine = engine();
        let definition_id = deploy(
            &mut engine,
            vec![
                node("start", NodeBehavior::PassThrough),
                node("gw", NodeBehavior::ParallelGateway),
                node("hold", NodeBehavior::UserTask { documentation: None }),
            ],
            vec![
                transition("t0", "start", "gw"),
                transition("t1", "gw", "hold"),
            ],
        );

        let root = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap();

        // One incoming and one outgoing: the gateway neither forks nor joins.
        assert_eq!(engine.store().execution_count(), 1);
        let row = engine.store().execution(root).unwrap();
        assert_eq!(row.node.as_deref(), Some("hold"));
        assert!(row.state.is_waiting());
        assert!(!row.state.is_concurrent());
    }

    #[tokio::test]
    async fn fan_out_without_gateway_is_ambiguous() {
        let mut engine = engine();
        let definition_id = deploy(
            &mut engine,
            vec![
                node("start", NodeBehavior::PassThrough),
                node("a", NodeBehavior::End),
                node("b", NodeBehavior::End),
            ],
            vec![
                transition("t0", "start", "a"),
                transition("t1", "start", "b"),
            ],
        );

        let err = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Consistency(ConsistencyError::AmbiguousContinuation(node, 2))
                if node == "start"
        ));
        assert_eq!(engine.store().execution_count(), 0);
    }

    #[tokio::test]
    async fn join_without_concurrent_branch_is_rejected() {
        let mut engine = engine();
        let definition_id = deploy(
            &mut engine,
            vec![
                node("start", NodeBehavior::PassThrough),
                node("other", NodeBehavior::End),
                node("gw", NodeBehavior::ParallelGateway),
                node("end", NodeBehavior::End),
            ],
            vec![
                transition("t0", "start", "gw"),
                transition("tx", "other", "gw"),
                transition("t1", "gw", "end"),
            ],
        );

        // Two incoming transitions make "gw" a join, but the arriving
        // execution is the plain root, not a forked branch.
        let err = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Consistency(ConsistencyError::JoinOutsideFork(_, node))
                if node == "gw"
        ));
    }

    #[tokio::test]
    async fn message_catch_subscribes_and_waits() {
        let mut engine = engine();
        let definition_id = deploy(
            &mut engine,
            vec![
                node("start", NodeBehavior::PassThrough),
                node(
                    "catch",
                    NodeBehavior::MessageCatch {
                        message: "orderShipped".into(),
                    },
                ),
                node("end", NodeBehavior::End),
            ],
            vec![
                transition("t0", "start", "catch"),
                transition("t1", "catch", "end"),
            ],
        );

        let root = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap();

        let row = engine.store().execution(root).unwrap();
        assert_eq!(row.node.as_deref(), Some("catch"));
        assert!(row.state.is_waiting());

        let subscriptions = engine.store().subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].execution_id, root);
        assert_eq!(subscriptions[0].name, "orderShipped");
        assert_eq!(subscriptions[0].flags, SUB_FLAG_MESSAGE);

        // The stimulus arrives: the subscription row goes with the execution.
        engine.signal(root, BTreeMap::new()).await.unwrap();
        assert_eq!(engine.store().execution_count(), 0);
        assert!(engine.store().subscriptions().is_empty());
    }

    #[tokio::test]
    async fn activity_name_resolves_through_variable_chain() {
        let mut engine = engine();
        let mut events = engine.events().subscribe();
        let definition_id = deploy(
            &mut engine,
            vec![
                node("start", NodeBehavior::PassThrough),
                Node {
                    id: "task".into(),
                    name: Some(Expression::variable("title")),
                    behavior: NodeBehavior::UserTask { documentation: None },
                },
            ],
            vec![transition("t0", "start", "task")],
        );

        let mut variables = BTreeMap::new();
        variables.insert("title".to_string(), json!("Approve invoice"));
        engine
            .start_process(definition_id, None, variables)
            .await
            .unwrap();

        let mut seen = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::ActivityStarted { node, name, .. } = event
                && node == "task"
            {
                seen = Some(name);
            }
        }
        assert_eq!(seen.as_deref(), Some("Approve invoice"));

        let tasks: Vec<_> = engine.store().user_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "Approve invoice");
    }
}

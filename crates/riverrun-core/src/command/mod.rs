//! Business command handlers.
//!
//! Each command performs exactly one logical business effect, runs strictly
//! inside an active unit of work, and rides the enclosing transaction
//! rather than beginning its own. Commands read and write through the
//! engine's tracked set and store.

use chrono::Utc;
use riverrun_types::error::{ConsistencyError, EngineError, StorageError};
use riverrun_types::event::EngineEvent;
use riverrun_types::execution::{
    EventSubscriptionRecord, SUB_FLAG_MESSAGE, SUB_FLAG_SIGNAL, UserTaskRecord,
};
use uuid::Uuid;

use crate::engine::ProcessEngine;
use crate::store::ExecutionStore;

/// A discrete business operation executed inside a unit of work.
pub trait Command<S: ExecutionStore> {
    type Output;

    fn execute(
        &self,
        engine: &mut ProcessEngine<S>,
    ) -> impl std::future::Future<Output = Result<Self::Output, EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// Event subscriptions
// ---------------------------------------------------------------------------

/// Subscribe an execution to a named message.
#[derive(Debug, Clone)]
pub struct CreateMessageSubscriptionCommand {
    pub execution: Uuid,
    pub message: String,
}

impl<S: ExecutionStore> Command<S> for CreateMessageSubscriptionCommand {
    type Output = Uuid;

    async fn execute(&self, engine: &mut ProcessEngine<S>) -> Result<Uuid, EngineError> {
        insert_subscription(engine, self.execution, SUB_FLAG_MESSAGE, &self.message).await
    }
}

/// Subscribe an execution to a named signal.
#[derive(Debug, Clone)]
pub struct CreateSignalSubscriptionCommand {
    pub execution: Uuid,
    pub signal: String,
}

impl<S: ExecutionStore> Command<S> for CreateSignalSubscriptionCommand {
    type Output = Uuid;

    async fn execute(&self, engine: &mut ProcessEngine<S>) -> Result<Uuid, EngineError> {
        insert_subscription(engine, self.execution, SUB_FLAG_SIGNAL, &self.signal).await
    }
}

async fn insert_subscription<S: ExecutionStore>(
    engine: &mut ProcessEngine<S>,
    execution_id: Uuid,
    flags: u32,
    name: &str,
) -> Result<Uuid, EngineError> {
    engine.require_active_batch()?;

    let execution = engine.find(execution_id).await?;
    let record = EventSubscriptionRecord {
        id: Uuid::now_v7(),
        execution_id: execution.id(),
        process_id: execution.process_id(),
        flags,
        name: name.to_string(),
        created_at: Utc::now().timestamp(),
    };
    engine.store_mut().insert_subscription(&record).await?;

    tracing::debug!(execution = %execution_id, flags, name, "created event subscription");
    Ok(record.id)
}

// ---------------------------------------------------------------------------
// User tasks
// ---------------------------------------------------------------------------

/// Create a user task referencing the execution's current node.
#[derive(Debug, Clone)]
pub struct CreateUserTaskCommand {
    pub execution: Uuid,
    pub name: String,
    pub documentation: Option<String>,
}

impl<S: ExecutionStore> Command<S> for CreateUserTaskCommand {
    type Output = UserTaskRecord;

    async fn execute(&self, engine: &mut ProcessEngine<S>) -> Result<UserTaskRecord, EngineError> {
        engine.require_active_batch()?;

        let execution = engine.find(self.execution).await?;
        let activity = execution
            .node()
            .ok_or(ConsistencyError::NoCurrentNode(self.execution))?
            .to_string();

        let id = Uuid::now_v7();
        let record = UserTaskRecord {
            id,
            execution_id: self.execution,
            name: self.name.clone(),
            documentation: self.documentation.clone(),
            activity,
            created_at: Utc::now().timestamp(),
        };
        engine.store_mut().insert_user_task(&record).await?;

        tracing::debug!(task = %id, name = self.name, "created user task");

        // Read back through the store so the caller sees the persisted row.
        let task = engine
            .store_mut()
            .find_user_task(id)
            .await?
            .ok_or(StorageError::NotFound)?;
        engine.notify(EngineEvent::UserTaskCreated { task: task.clone() });
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::bus::EventBus;
    use crate::store::memory::MemoryExecutionStore;
    use riverrun_types::definition::{Node, NodeBehavior, ProcessDefinition, Transition};
    use std::collections::BTreeMap;

    fn engine_with_waiting_task() -> (ProcessEngine<MemoryExecutionStore>, Uuid) {
        let mut engine = ProcessEngine::new(MemoryExecutionStore::new(), EventBus::new(16));
        let definition_id = Uuid::now_v7();
        engine.deploy(ProcessDefinition::new(
            definition_id,
            "tasks",
            "start",
            vec![
                Node {
                    id: "start".into(),
                    name: None,
                    behavior: NodeBehavior::PassThrough,
                },
                Node {
                    id: "review".into(),
                    name: Some(riverrun_types::definition::Expression::literal("Review")),
                    behavior: NodeBehavior::UserTask {
                        documentation: None,
                    },
                },
            ],
            vec![Transition {
                id: "t0".into(),
                from: "start".into(),
                to: "review".into(),
            }],
        ));
        (engine, definition_id)
    }

    #[tokio::test]
    async fn command_outside_batch_is_a_policy_error() {
        let (mut engine, definition_id) = engine_with_waiting_task();
        let process = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap();

        let command = CreateMessageSubscriptionCommand {
            execution: process,
            message: "orderReceived".into(),
        };
        // Bypassing execute_command means no active unit of work.
        let err = command.execute(&mut engine).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Policy(riverrun_types::error::PolicyError::CommandOutsideUnitOfWork)
        ));
    }

    #[tokio::test]
    async fn message_subscription_row_content() {
        let (mut engine, definition_id) = engine_with_waiting_task();
        let process = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap();

        engine
            .execute_command(CreateMessageSubscriptionCommand {
                execution: process,
                message: "orderReceived".into(),
            })
            .await
            .unwrap();

        let subscriptions = engine.store().subscriptions();
        assert_eq!(subscriptions.len(), 1);
        let sub = subscriptions[0];
        assert_eq!(sub.flags, SUB_FLAG_MESSAGE);
        assert_eq!(sub.execution_id, process);
        assert_eq!(sub.process_id, process);
        assert_eq!(sub.name, "orderReceived");
    }

    #[tokio::test]
    async fn signal_subscription_carries_signal_flag() {
        let (mut engine, definition_id) = engine_with_waiting_task();
        let process = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap();

        engine
            .execute_command(CreateSignalSubscriptionCommand {
                execution: process,
                signal: "shipmentReady".into(),
            })
            .await
            .unwrap();

        let subscriptions = engine.store().subscriptions();
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].flags, SUB_FLAG_SIGNAL);
        assert_eq!(subscriptions[0].name, "shipmentReady");
    }

    #[tokio::test]
    async fn user_task_created_through_behavior() {
        let (mut engine, definition_id) = engine_with_waiting_task();
        let mut events = engine.events().subscribe();

        let process = engine
            .start_process(definition_id, None, BTreeMap::new())
            .await
            .unwrap();

        // The execution parked on the user task node.
        let execution = engine.find(process).await.unwrap();
        assert!(execution.state().is_waiting());
        assert_eq!(execution.node(), Some("review"));

        let mut created = None;
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::UserTaskCreated { task } = event {
                created = Some(task);
            }
        }
        let task = created.expect("user task event");
        assert_eq!(task.execution_id, process);
        assert_eq!(task.name, "Review");
        assert_eq!(task.activity, "review");
    }
}

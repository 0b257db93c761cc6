//! Event types for the engine notification bus.
//!
//! `EngineEvent` is the unified event type broadcast while executions
//! advance. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::UserTaskRecord;

/// Events emitted during process execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new process instance has been started.
    ProcessStarted {
        process_id: Uuid,
        definition_id: Uuid,
        business_key: Option<String>,
    },

    /// A process instance has run to completion.
    ProcessEnded { process_id: Uuid },

    /// An execution has entered an activity node.
    ActivityStarted {
        execution_id: Uuid,
        node: String,
        name: String,
    },

    /// An execution has completed an activity node.
    ActivityCompleted { execution_id: Uuid, node: String },

    /// An activity has been canceled before completing.
    ActivityCanceled { execution_id: Uuid, node: String },

    /// A user task row has been created for an execution.
    UserTaskCreated { task: UserTaskRecord },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_round_trips_through_json() {
        let event = EngineEvent::ActivityStarted {
            execution_id: Uuid::now_v7(),
            node: "fork".into(),
            name: "Fork".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"activity_started\""));
        let back: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, EngineEvent::ActivityStarted { .. }));
    }
}

//! Events published to front ends

use serde::Serialize;

use super::types::{ExecutionResult, TaskId, TaskKind, TaskState};

/// Engine event, broadcast to every subscriber
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskCreated {
        task_id: TaskId,
        owner_id: String,
        kind: TaskKind,
    },
    TaskStateChanged {
        task_id: TaskId,
        owner_id: String,
        from: TaskState,
        to: TaskState,
    },
    ExecutionCompleted {
        result: ExecutionResult,
    },
}

impl EngineEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            EngineEvent::TaskCreated { task_id, .. } => *task_id,
            EngineEvent::TaskStateChanged { task_id, .. } => *task_id,
            EngineEvent::ExecutionCompleted { result } => result.task_id,
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            EngineEvent::TaskCreated { owner_id, .. } => owner_id,
            EngineEvent::TaskStateChanged { owner_id, .. } => owner_id,
            EngineEvent::ExecutionCompleted { result } => &result.owner_id,
        }
    }
}

//! Wire messages exchanged with observers and with workers.
//!
//! Each direction is a closed enum, adjacently tagged so that the JSON shape is
//! `{"command": ..., "payload": {...}}` for observer commands and
//! `{"type": ..., "payload": {...}}` for everything the engine emits.

use crate::types::{Agent, AssignmentMode, RunStatus, Task, WorkspaceInfo};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A request from an observer session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "payload", rename_all = "snake_case")]
pub enum Command {
    CreateAgent {
        #[serde(default)]
        config: String,
    },
    StartAgent {
        agent_id: Uuid,
    },
    StopAgent {
        agent_id: Uuid,
    },
    TerminateAgent {
        agent_id: Uuid,
    },
    AddTask {
        #[serde(default)]
        description: String,
    },
    DeleteTask {
        task_id: Uuid,
    },
    ManualAssignTask {
        task_id: Uuid,
        agent_id: Uuid,
    },
    SetAssignmentMode {
        mode: AssignmentMode,
    },
    GetProgress {
        task_id: Uuid,
    },
    UnsubscribeProgress {
        task_id: Uuid,
    },
    StartTask {
        task_id: Uuid,
        #[serde(default)]
        worker_config: String,
    },
    StopTask {
        task_id: Uuid,
    },
}

/// An event pushed to observer sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Full snapshot; replaces everything the observer knows.
    State {
        agents: Vec<Agent>,
        tasks: Vec<Task>,
        mode: AssignmentMode,
    },
    ModeUpdate {
        mode: AssignmentMode,
    },
    TaskCreated {
        task: Task,
    },
    TaskUpdate {
        task_id: Uuid,
        data: Task,
    },
    TaskDeleted {
        task_id: Uuid,
    },
    AgentCreated {
        agent: Agent,
    },
    AgentUpdate {
        agent_id: Uuid,
        data: Agent,
    },
    AgentRemoved {
        agent_id: Uuid,
    },
    WorkspacesUpdated {
        workspaces: Vec<WorkspaceInfo>,
    },
    TaskProgressFull {
        task_id: Uuid,
        history: String,
    },
    TaskProgressDelta {
        task_id: Uuid,
        token: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    /// The wire name of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::State { .. } => "state",
            Self::ModeUpdate { .. } => "mode_update",
            Self::TaskCreated { .. } => "task_created",
            Self::TaskUpdate { .. } => "task_update",
            Self::TaskDeleted { .. } => "task_deleted",
            Self::AgentCreated { .. } => "agent_created",
            Self::AgentUpdate { .. } => "agent_update",
            Self::AgentRemoved { .. } => "agent_removed",
            Self::WorkspacesUpdated { .. } => "workspaces_updated",
            Self::TaskProgressFull { .. } => "task_progress_full",
            Self::TaskProgressDelta { .. } => "task_progress_delta",
            Self::Error { .. } => "error",
        }
    }
}

/// A directive from the engine to a worker over its link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerDirective {
    AssignTask {
        task_id: Uuid,
        description: String,
        workspace: PathBuf,
    },
    CancelTask {
        task_id: Uuid,
    },
}

/// A report from a worker about the task it holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WorkerReport {
    ProgressUpdate {
        task_id: Uuid,
        token: String,
    },
    TaskResult {
        task_id: Uuid,
        status: RunStatus,
        #[serde(default)]
        result: serde_json::Value,
    },
    CancelAck {
        task_id: Uuid,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let raw = r#"{"command":"add_task","payload":{"description":"write docs"}}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cmd,
            Command::AddTask {
                description: "write docs".into()
            }
        );

        let raw = r#"{"command":"set_assignment_mode","payload":{"mode":"manual"}}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cmd,
            Command::SetAssignmentMode {
                mode: AssignmentMode::Manual
            }
        );
    }

    #[test]
    fn test_missing_description_defaults_to_empty() {
        let raw = r#"{"command":"add_task","payload":{}}"#;
        let cmd: Command = serde_json::from_str(raw).unwrap();
        assert_eq!(
            cmd,
            Command::AddTask {
                description: String::new()
            }
        );
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let raw = r#"{"command":"reboot_universe","payload":{}}"#;
        assert!(serde_json::from_str::<Command>(raw).is_err());
        let raw = r#"{"command":"start_agent","payload":{"agent_id":"not-a-uuid"}}"#;
        assert!(serde_json::from_str::<Command>(raw).is_err());
    }

    #[test]
    fn test_event_wire_shape() {
        let id = Uuid::new_v4();
        let event = ServerEvent::TaskProgressDelta {
            task_id: id,
            token: "abc".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "task_progress_delta");
        assert_eq!(json["payload"]["task_id"], id.to_string());
        assert_eq!(json["payload"]["token"], "abc");
        assert_eq!(event.kind(), "task_progress_delta");
    }

    #[test]
    fn test_worker_report_parsing() {
        let id = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"task_result","payload":{{"task_id":"{id}","status":"completed","result":{{"files":2}}}}}}"#
        );
        let report: WorkerReport = serde_json::from_str(&raw).unwrap();
        match report {
            WorkerReport::TaskResult {
                task_id,
                status,
                result,
            } => {
                assert_eq!(task_id, id);
                assert_eq!(status, RunStatus::Completed);
                assert_eq!(result["files"], 2);
            }
            other => panic!("unexpected report: {other:?}"),
        }
    }

    #[test]
    fn test_directive_serialization() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(WorkerDirective::CancelTask { task_id: id }).unwrap();
        assert_eq!(json["type"], "cancel_task");
        assert_eq!(json["payload"]["task_id"], id.to_string());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between the prompt and the worker output inside a task history.
pub const HISTORY_SEPARATOR: &str = "\n|||\n";

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Created,
    Starting,
    Idle,
    Busy,
    Stopping,
    Stopped,
    Terminating,
    ExitedNormally,
    ExitedUnexpectedly,
    Error,
}

impl AgentStatus {
    /// States that accept a `start` command.
    pub fn accepts_start(self) -> bool {
        matches!(self, Self::Created | Self::Stopped | Self::Error)
    }

    /// States that accept a `stop` command.
    pub fn accepts_stop(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }

    /// Every state except `terminating` accepts `terminate`.
    pub fn accepts_terminate(self) -> bool {
        self != Self::Terminating
    }

    /// States in which a worker process is expected to be alive.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Idle | Self::Busy | Self::Stopping | Self::Terminating
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Terminating => "terminating",
            Self::ExitedNormally => "exited_normally",
            Self::ExitedUnexpectedly => "exited_unexpectedly",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a task.
///
/// The aliases accept the names older observers still send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[serde(alias = "new")]
    Pending,
    #[serde(alias = "running")]
    Processing,
    #[serde(alias = "completed")]
    Complete,
    Incomplete,
}

impl TaskStatus {
    /// Whether a task in this state may be paired with an agent.
    pub fn is_assignable(self) -> bool {
        matches!(self, Self::Pending | Self::Incomplete)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Incomplete => "incomplete",
        };
        f.write_str(s)
    }
}

/// How pending tasks are paired with idle agents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentMode {
    #[default]
    Auto,
    Manual,
}

impl std::fmt::Display for AssignmentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A managed worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub status: AgentStatus,
    /// Name of the worker configuration this agent was created from.
    pub config: String,
    pub assigned_task_id: Option<Uuid>,
    /// Workspace number held while the agent is busy.
    pub workspace: Option<u32>,
    pub created_at: DateTime<Utc>,
    /// Registry insertion order.
    #[serde(skip)]
    pub(crate) seq: u64,
    /// Bumped on every handshake transition so stale timers can be recognised.
    #[serde(skip)]
    pub(crate) epoch: u64,
}

impl Agent {
    pub fn new(config: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: AgentStatus::Created,
            config: config.into(),
            assigned_task_id: None,
            workspace: None,
            created_at: Utc::now(),
            seq: 0,
            epoch: 0,
        }
    }
}

/// A unit of work.
///
/// The accumulated `history` is not serialized with the task; observers fetch it
/// through the progress stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_agent_id: Option<Uuid>,
    /// Set only when a run completes.
    pub result: Option<serde_json::Value>,
    /// Why the last run ended without completing.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) history: String,
    #[serde(skip)]
    output_started: bool,
    /// Agent reserved for this task by `start_task`.
    #[serde(skip)]
    pub(crate) pinned_agent: Option<Uuid>,
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Task {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.into(),
            status: TaskStatus::Pending,
            assigned_agent_id: None,
            result: None,
            last_error: None,
            created_at: Utc::now(),
            history: String::new(),
            output_started: false,
            pinned_agent: None,
            seq: 0,
        }
    }

    /// The history accumulated by the current (or last) run.
    pub fn history(&self) -> &str {
        &self.history
    }

    /// Reset the history at the start of a run.
    pub(crate) fn begin_run(&mut self) {
        self.history = format!("user{HISTORY_SEPARATOR}{}", self.description);
        self.output_started = false;
        self.last_error = None;
    }

    /// Append an output token, inserting the reply separator before the first one.
    pub(crate) fn append_output(&mut self, token: &str) {
        if !self.output_started {
            self.history.push_str(HISTORY_SEPARATOR);
            self.output_started = true;
        }
        self.history.push_str(token);
    }
}

/// How a worker reports the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Public view of one workspace slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub id: u32,
    pub path: std::path::PathBuf,
    pub is_occupied: bool,
    pub task_id: Option<Uuid>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_creation() {
        let agent = Agent::new("claude");
        assert_eq!(agent.status, AgentStatus::Created);
        assert_eq!(agent.config, "claude");
        assert!(agent.assigned_task_id.is_none());
        assert!(agent.workspace.is_none());
    }

    #[test]
    fn test_agent_status_acceptance() {
        assert!(AgentStatus::Created.accepts_start());
        assert!(AgentStatus::Stopped.accepts_start());
        assert!(AgentStatus::Error.accepts_start());
        assert!(!AgentStatus::Idle.accepts_start());

        assert!(AgentStatus::Idle.accepts_stop());
        assert!(AgentStatus::Busy.accepts_stop());
        assert!(!AgentStatus::Starting.accepts_stop());

        assert!(AgentStatus::ExitedNormally.accepts_terminate());
        assert!(!AgentStatus::Terminating.accepts_terminate());
    }

    #[test]
    fn test_task_history_format() {
        let mut task = Task::new("fix bug");
        assert_eq!(task.history(), "");

        task.begin_run();
        assert_eq!(task.history(), "user\n|||\nfix bug");

        task.append_output("Look");
        task.append_output("ing");
        assert_eq!(task.history(), "user\n|||\nfix bug\n|||\nLooking");
    }

    #[test]
    fn test_task_history_resets_per_run() {
        let mut task = Task::new("fix bug");
        task.begin_run();
        task.append_output("first attempt");
        task.last_error = Some("worker crashed".into());

        task.begin_run();
        assert_eq!(task.history(), "user\n|||\nfix bug");
        assert!(task.last_error.is_none());
    }

    #[test]
    fn test_task_status_aliases() {
        let parsed: TaskStatus = serde_json::from_str("\"new\"").unwrap();
        assert_eq!(parsed, TaskStatus::Pending);
        let parsed: TaskStatus = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, TaskStatus::Processing);
        let parsed: TaskStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(parsed, TaskStatus::Complete);
        assert_eq!(
            serde_json::to_string(&TaskStatus::Processing).unwrap(),
            "\"processing\""
        );
    }

    #[test]
    fn test_task_serialization_skips_history() {
        let mut task = Task::new("secret history");
        task.begin_run();
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("history").is_none());
        assert_eq!(json["status"], "pending");
        assert!(json["assigned_agent_id"].is_null());
    }

    #[test]
    fn test_display_matches_wire_names() {
        for status in [
            AgentStatus::Created,
            AgentStatus::ExitedUnexpectedly,
            AgentStatus::Terminating,
        ] {
            let wire = serde_json::to_string(&status).unwrap();
            assert_eq!(wire, format!("\"{status}\""));
        }
        assert_eq!(AssignmentMode::Manual.to_string(), "manual");
    }
}

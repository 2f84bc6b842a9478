//! Orchestration engine for a pool of worker agents and a queue of tasks.
//!
//! The [`Engine`] owns the agent and task registry, the workspace pool, the
//! assignment scheduler, the observer broadcast hub and the progress stream
//! multiplexer behind a single lock. Transports (see `overseer-gateway`) feed it
//! [`Command`]s from observers and [`WorkerReport`]s from workers; it answers with
//! [`ServerEvent`]s and [`WorkerDirective`]s.
//!
//! # Main types
//!
//! - [`Engine`]: the serialization point and public API.
//! - [`WorkerSupervisor`]: the seam to whatever runs worker processes, with
//!   [`ProcessSupervisor`] as the OS-process implementation.
//! - [`WorkspaceManager`]: numbered working directories handed to running tasks.
//! - [`Registry`]: the agent and task tables.

mod agents;
/// The engine facade.
pub mod engine;
/// Observer session fan-out.
pub mod hub;
/// OS-process worker supervisor.
pub mod process;
/// Per-task output subscriptions.
pub mod progress;
/// Wire messages for observers and workers.
pub mod protocol;
/// Agent and task tables.
pub mod registry;
mod scheduler;
mod state;
mod tasks;
/// Agents, tasks, statuses.
pub mod types;
/// Supervisor trait and worker configurations.
pub mod worker;
/// Workspace directory pool.
pub mod workspace;

pub use engine::{Engine, EngineSettings, Snapshot};
pub use process::ProcessSupervisor;
pub use protocol::{Command, ServerEvent, WorkerDirective, WorkerReport};
pub use registry::Registry;
pub use types::{
    Agent, AgentStatus, AssignmentMode, RunStatus, Task, TaskStatus, WorkspaceInfo,
    HISTORY_SEPARATOR,
};
pub use worker::{AgentConfig, ConfigCatalog, SupervisorEvent, WorkerHandle, WorkerSupervisor};
pub use workspace::WorkspaceManager;

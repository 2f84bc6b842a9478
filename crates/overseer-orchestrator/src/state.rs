//! Everything the engine guards with its single lock, plus the bookkeeping that
//! turns one locked mutation into broadcasts and deferred side effects.

use crate::engine::EngineSettings;
use crate::hub::Hub;
use crate::progress::ProgressMux;
use crate::protocol::{ServerEvent, WorkerDirective};
use crate::registry::Registry;
use crate::types::{AgentStatus, AssignmentMode, TaskStatus};
use crate::worker::{AgentConfig, ConfigCatalog, WorkerHandle};
use crate::workspace::WorkspaceManager;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// The engine side of a connected worker.
pub(crate) struct WorkerLink {
    pub(crate) link_id: Uuid,
    pub(crate) tx: mpsc::UnboundedSender<WorkerDirective>,
}

/// A cancel sent by `stop_task` or `delete_task` that has not been acknowledged yet.
pub(crate) struct PendingStop {
    pub(crate) agent_id: Uuid,
    pub(crate) epoch: u64,
    /// Remove the task once the agent lets go of it.
    pub(crate) delete_on_release: bool,
}

/// A handshake bound. Carries the epoch it was armed under so that a timer which
/// outlives its transition does nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deadline {
    AgentStop { agent_id: Uuid, epoch: u64 },
    AgentTerminate { agent_id: Uuid, epoch: u64 },
    TaskStop { task_id: Uuid, epoch: u64 },
}

/// Work that must happen after the lock is released.
#[derive(Debug)]
pub(crate) enum Effect {
    Launch {
        agent_id: Uuid,
        epoch: u64,
        config: AgentConfig,
        handle: Option<WorkerHandle>,
    },
    Stop {
        agent_id: Uuid,
        epoch: u64,
        handle: WorkerHandle,
    },
    Terminate {
        agent_id: Uuid,
        epoch: u64,
        handle: WorkerHandle,
    },
    Arm {
        deadline: Deadline,
        after: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    Created,
    Updated,
    Removed,
}

/// Entities changed by the mutation in progress.
#[derive(Default)]
pub(crate) struct Touched {
    agents: Vec<(Uuid, Change)>,
    tasks: Vec<(Uuid, Change)>,
    mode: bool,
    workspaces: bool,
}

fn merge(entries: &mut Vec<(Uuid, Change)>, id: Uuid, change: Change) {
    match entries.iter_mut().find(|(existing, _)| *existing == id) {
        Some((_, current)) => {
            *current = match (*current, change) {
                (_, Change::Removed) => Change::Removed,
                (Change::Created, _) => Change::Created,
                (_, next) => next,
            };
        }
        None => entries.push((id, change)),
    }
}

impl Touched {
    fn is_empty(&self) -> bool {
        self.agents.is_empty() && self.tasks.is_empty() && !self.mode && !self.workspaces
    }
}

pub(crate) struct EngineState {
    pub(crate) registry: Registry,
    pub(crate) workspaces: WorkspaceManager,
    pub(crate) catalog: ConfigCatalog,
    pub(crate) mode: AssignmentMode,
    pub(crate) hub: Hub,
    pub(crate) progress: ProgressMux,
    pub(crate) links: HashMap<Uuid, WorkerLink>,
    pub(crate) handles: HashMap<Uuid, WorkerHandle>,
    pub(crate) pending_stops: HashMap<Uuid, PendingStop>,
    pub(crate) settings: EngineSettings,
    epoch: u64,
    touched: Touched,
    effects: Vec<Effect>,
}

impl EngineState {
    pub(crate) fn new(
        settings: EngineSettings,
        catalog: ConfigCatalog,
        workspaces: WorkspaceManager,
    ) -> Self {
        Self {
            registry: Registry::new(),
            workspaces,
            catalog,
            mode: settings.default_mode,
            hub: Hub::new(),
            progress: ProgressMux::new(),
            links: HashMap::new(),
            handles: HashMap::new(),
            pending_stops: HashMap::new(),
            settings,
            epoch: 0,
            touched: Touched::default(),
            effects: Vec::new(),
        }
    }

    pub(crate) fn next_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    pub(crate) fn touch_agent(&mut self, id: Uuid, change: Change) {
        merge(&mut self.touched.agents, id, change);
    }

    pub(crate) fn touch_task(&mut self, id: Uuid, change: Change) {
        merge(&mut self.touched.tasks, id, change);
    }

    pub(crate) fn touch_mode(&mut self) {
        self.touched.mode = true;
    }

    pub(crate) fn touch_workspaces(&mut self) {
        self.touched.workspaces = true;
    }

    pub(crate) fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    pub(crate) fn snapshot_event(&self) -> ServerEvent {
        ServerEvent::State {
            agents: self.registry.agents().into_iter().cloned().collect(),
            tasks: self.registry.tasks().into_iter().cloned().collect(),
            mode: self.mode,
        }
    }

    pub(crate) fn workspaces_event(&self) -> ServerEvent {
        ServerEvent::WorkspacesUpdated {
            workspaces: self.workspaces.list(),
        }
    }

    /// Send to one session, forgetting its subscriptions if it had to be dropped.
    pub(crate) fn send_to(&mut self, session_id: Uuid, event: ServerEvent) -> bool {
        let delivered = self.hub.send_to(session_id, event);
        if !delivered {
            self.progress.remove_session(session_id);
        }
        delivered
    }

    fn broadcast(&mut self, event: &ServerEvent) {
        for dropped in self.hub.broadcast(event) {
            self.progress.remove_session(dropped);
        }
    }

    /// Publish everything touched since the last flush.
    ///
    /// One changed agent or task goes out as its delta. More than one goes out as a
    /// single snapshot so that observers never see a half-applied pairing.
    pub(crate) fn flush(&mut self) {
        if self.touched.is_empty() {
            return;
        }
        let touched = std::mem::take(&mut self.touched);

        if touched.mode {
            self.broadcast(&ServerEvent::ModeUpdate { mode: self.mode });
        }

        let entity_event = match (touched.agents.as_slice(), touched.tasks.as_slice()) {
            ([], []) => None,
            ([(id, change)], []) => self.agent_delta(*id, *change),
            ([], [(id, change)]) => self.task_delta(*id, *change),
            _ => Some(self.snapshot_event()),
        };
        if let Some(event) = entity_event {
            debug!(event = event.kind(), "Publishing state change");
            self.broadcast(&event);
        }

        if touched.workspaces {
            let event = self.workspaces_event();
            self.broadcast(&event);
        }
    }

    fn agent_delta(&self, id: Uuid, change: Change) -> Option<ServerEvent> {
        match change {
            Change::Removed => Some(ServerEvent::AgentRemoved { agent_id: id }),
            Change::Created => self
                .registry
                .agent(id)
                .ok()
                .map(|agent| ServerEvent::AgentCreated {
                    agent: agent.clone(),
                }),
            Change::Updated => self
                .registry
                .agent(id)
                .ok()
                .map(|agent| ServerEvent::AgentUpdate {
                    agent_id: id,
                    data: agent.clone(),
                }),
        }
    }

    fn task_delta(&self, id: Uuid, change: Change) -> Option<ServerEvent> {
        match change {
            Change::Removed => Some(ServerEvent::TaskDeleted { task_id: id }),
            Change::Created => self
                .registry
                .task(id)
                .ok()
                .map(|task| ServerEvent::TaskCreated { task: task.clone() }),
            Change::Updated => self
                .registry
                .task(id)
                .ok()
                .map(|task| ServerEvent::TaskUpdate {
                    task_id: id,
                    data: task.clone(),
                }),
        }
    }

    /// Deliver a directive over the agent's worker link.
    pub(crate) fn send_directive(&self, agent_id: Uuid, directive: WorkerDirective) -> bool {
        match self.links.get(&agent_id) {
            Some(link) => link.tx.send(directive).is_ok(),
            None => false,
        }
    }

    /// Verify the pairing, busy/processing and workspace occupancy invariants.
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        self.registry.check_consistency()?;

        for agent in self.registry.agents() {
            match (agent.assigned_task_id, agent.workspace) {
                (Some(task_id), Some(ws)) => {
                    if self.workspaces.owner(ws) != Some(task_id) {
                        return Err(format!(
                            "agent {} uses workspace {ws} which is not held by task {task_id}",
                            agent.id
                        ));
                    }
                }
                (Some(task_id), None) => {
                    return Err(format!(
                        "agent {} runs task {task_id} without a workspace",
                        agent.id
                    ));
                }
                (None, Some(ws)) => {
                    return Err(format!(
                        "agent {} holds workspace {ws} without a task",
                        agent.id
                    ));
                }
                (None, None) => {}
            }
        }

        for ws in self.workspaces.list() {
            let Some(task_id) = ws.task_id else { continue };
            let task = self
                .registry
                .task(task_id)
                .map_err(|_| format!("workspace {} held by missing task {task_id}", ws.id))?;
            if task.status != TaskStatus::Processing {
                return Err(format!(
                    "workspace {} held by task {task_id} which is {}",
                    ws.id, task.status
                ));
            }
        }

        for (task_id, stop) in &self.pending_stops {
            let task = self
                .registry
                .task(*task_id)
                .map_err(|_| format!("pending stop for missing task {task_id}"))?;
            if task.assigned_agent_id != Some(stop.agent_id) {
                return Err(format!(
                    "pending stop for task {task_id} names agent {} which does not hold it",
                    stop.agent_id
                ));
            }
        }

        for agent_id in self.links.keys() {
            let agent = self
                .registry
                .agent(*agent_id)
                .map_err(|_| format!("worker link for missing agent {agent_id}"))?;
            if !agent.status.is_active() {
                return Err(format!(
                    "worker link kept for agent {agent_id} while {}",
                    agent.status
                ));
            }
        }

        if self
            .registry
            .agents()
            .iter()
            .any(|a| a.status == AgentStatus::Busy && !self.links.contains_key(&a.id))
        {
            return Err("busy agent without a worker link".into());
        }
        Ok(())
    }
}

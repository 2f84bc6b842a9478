//! Agent lifecycle transitions.
//!
//! Methods here run under the engine lock. Supervisor work is queued as
//! [`Effect`]s and handshake bounds as [`Deadline`]s; nothing here awaits.

use crate::protocol::WorkerDirective;
use crate::state::{Change, Deadline, Effect, EngineState, WorkerLink};
use crate::types::{Agent, AgentStatus};
use crate::worker::WorkerHandle;
use overseer_core::{OverseerError, OverseerResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What to do with a worker once `spawn` has returned its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LaunchOutcome {
    /// The agent is still waiting on this start.
    Proceed,
    /// The agent moved on; the handle is kept for a later start.
    Superseded,
    /// The agent is gone and the supervisor should forget the worker.
    Orphaned,
}

impl EngineState {
    pub(crate) fn create_agent(&mut self, config: &str) -> OverseerResult<Agent> {
        if config.trim().is_empty() {
            return Err(OverseerError::MissingField("config"));
        }
        if !self.catalog.contains(config) {
            return Err(OverseerError::UnknownConfig(config.to_string()));
        }
        let agent = Agent::new(config);
        let id = self.registry.add_agent(agent);
        self.touch_agent(id, Change::Created);
        info!(agent_id = %id, config, "Agent created");
        Ok(self.registry.agent(id)?.clone())
    }

    pub(crate) fn start_agent(&mut self, agent_id: Uuid) -> OverseerResult<()> {
        let agent = self.registry.agent(agent_id)?;
        if !agent.status.accepts_start() {
            return Err(OverseerError::invalid_state(
                "agent",
                agent_id,
                agent.status,
                "start",
            ));
        }
        let config = self
            .catalog
            .get(&agent.config)
            .cloned()
            .ok_or_else(|| OverseerError::UnknownConfig(agent.config.clone()))?;

        let epoch = self.next_epoch();
        let agent = self.registry.agent_mut(agent_id)?;
        agent.status = AgentStatus::Starting;
        agent.epoch = epoch;
        self.touch_agent(agent_id, Change::Updated);
        self.push_effect(Effect::Launch {
            agent_id,
            epoch,
            config,
            handle: self.handles.get(&agent_id).cloned(),
        });
        info!(agent_id = %agent_id, "Agent starting");
        Ok(())
    }

    pub(crate) fn stop_agent(&mut self, agent_id: Uuid) -> OverseerResult<()> {
        let agent = self.registry.agent(agent_id)?;
        if !agent.status.accepts_stop() {
            return Err(OverseerError::invalid_state(
                "agent",
                agent_id,
                agent.status,
                "stop",
            ));
        }

        if let Some(task_id) = agent.assigned_task_id {
            self.send_directive(agent_id, WorkerDirective::CancelTask { task_id });
            self.release_task(agent_id, "agent stopped");
        }
        self.drop_pins(agent_id);
        self.links.remove(&agent_id);

        let epoch = self.next_epoch();
        let agent = self.registry.agent_mut(agent_id)?;
        agent.epoch = epoch;
        match self.handles.get(&agent_id).cloned() {
            Some(handle) => {
                agent.status = AgentStatus::Stopping;
                self.push_effect(Effect::Stop {
                    agent_id,
                    epoch,
                    handle,
                });
                self.push_effect(Effect::Arm {
                    deadline: Deadline::AgentStop { agent_id, epoch },
                    after: self.settings.stop_timeout,
                });
            }
            None => agent.status = AgentStatus::Stopped,
        }
        self.touch_agent(agent_id, Change::Updated);
        info!(agent_id = %agent_id, "Agent stopping");
        Ok(())
    }

    pub(crate) fn terminate_agent(&mut self, agent_id: Uuid) -> OverseerResult<()> {
        let agent = self.registry.agent(agent_id)?;
        let status = agent.status;
        if !status.accepts_terminate() {
            return Err(OverseerError::invalid_state(
                "agent", agent_id, status, "terminate",
            ));
        }

        let handle = self.handles.get(&agent_id).cloned();
        let live = status.is_active() || (status == AgentStatus::Error && handle.is_some());
        match handle {
            Some(handle) if live => {
                if let Some(task_id) = agent.assigned_task_id {
                    self.send_directive(agent_id, WorkerDirective::CancelTask { task_id });
                    self.release_task(agent_id, "agent terminated");
                }
                self.drop_pins(agent_id);
                self.links.remove(&agent_id);

                let epoch = self.next_epoch();
                let agent = self.registry.agent_mut(agent_id)?;
                agent.status = AgentStatus::Terminating;
                agent.epoch = epoch;
                self.touch_agent(agent_id, Change::Updated);
                self.push_effect(Effect::Terminate {
                    agent_id,
                    epoch,
                    handle,
                });
                self.push_effect(Effect::Arm {
                    deadline: Deadline::AgentTerminate { agent_id, epoch },
                    after: self.settings.terminate_timeout,
                });
                info!(agent_id = %agent_id, "Agent terminating");
            }
            _ => {
                self.remove_agent(agent_id);
                info!(agent_id = %agent_id, status = %status, "Agent removed without a live worker");
            }
        }
        Ok(())
    }

    /// Register the worker link for an agent. Connecting is the readiness signal.
    pub(crate) fn attach_worker(
        &mut self,
        agent_id: Uuid,
        tx: mpsc::UnboundedSender<WorkerDirective>,
    ) -> OverseerResult<Uuid> {
        let agent = self.registry.agent(agent_id)?;
        if agent.status != AgentStatus::Starting {
            return Err(OverseerError::invalid_state(
                "agent",
                agent_id,
                agent.status,
                "attach a worker to",
            ));
        }
        if self.links.contains_key(&agent_id) {
            return Err(OverseerError::Validation(format!(
                "agent {agent_id} already has a worker link"
            )));
        }

        let link_id = Uuid::new_v4();
        self.links.insert(agent_id, WorkerLink { link_id, tx });
        let epoch = self.next_epoch();
        let agent = self.registry.agent_mut(agent_id)?;
        agent.status = AgentStatus::Idle;
        agent.epoch = epoch;
        self.touch_agent(agent_id, Change::Updated);
        info!(agent_id = %agent_id, link_id = %link_id, "Worker ready");
        Ok(link_id)
    }

    /// A worker link closed. Only the link that is currently registered counts.
    pub(crate) fn detach_worker(&mut self, agent_id: Uuid, link_id: Uuid) {
        match self.links.get(&agent_id) {
            Some(link) if link.link_id == link_id => {}
            _ => {
                debug!(agent_id = %agent_id, link_id = %link_id, "Stale worker link closed");
                return;
            }
        }
        self.links.remove(&agent_id);

        let Ok(agent) = self.registry.agent(agent_id) else {
            return;
        };
        if matches!(
            agent.status,
            AgentStatus::Starting | AgentStatus::Idle | AgentStatus::Busy
        ) {
            warn!(agent_id = %agent_id, status = %agent.status, "Worker link lost");
            self.fail_agent(agent_id, "worker link lost");
        }
    }

    /// The supervisor reported that the worker process ended.
    pub(crate) fn worker_exited(&mut self, agent_id: Uuid, normal: bool) {
        let Ok(agent) = self.registry.agent(agent_id) else {
            debug!(agent_id = %agent_id, "Exit reported for unknown agent");
            return;
        };
        let status = agent.status;
        match status {
            AgentStatus::Stopping => {
                let epoch = self.next_epoch();
                if let Ok(agent) = self.registry.agent_mut(agent_id) {
                    agent.status = AgentStatus::Stopped;
                    agent.epoch = epoch;
                }
                self.touch_agent(agent_id, Change::Updated);
                info!(agent_id = %agent_id, "Agent stopped");
            }
            AgentStatus::Terminating => {
                self.remove_agent(agent_id);
                info!(agent_id = %agent_id, "Agent terminated");
            }
            AgentStatus::Starting | AgentStatus::Idle | AgentStatus::Busy => {
                let (status, reason) = if normal {
                    (AgentStatus::ExitedNormally, "worker exited")
                } else {
                    (AgentStatus::ExitedUnexpectedly, "worker exited unexpectedly")
                };
                warn!(agent_id = %agent_id, normal, "Worker exited without being asked");
                self.settle_agent(agent_id, status, reason);
            }
            other => {
                debug!(agent_id = %agent_id, status = %other, "Exit ignored");
            }
        }
    }

    /// Remember the handle returned by `spawn` and decide what becomes of the launch.
    pub(crate) fn record_handle(
        &mut self,
        agent_id: Uuid,
        epoch: u64,
        handle: WorkerHandle,
    ) -> LaunchOutcome {
        let Ok(agent) = self.registry.agent(agent_id) else {
            return LaunchOutcome::Orphaned;
        };
        let current = agent.status == AgentStatus::Starting && agent.epoch == epoch;
        self.handles.insert(agent_id, handle);
        if current {
            LaunchOutcome::Proceed
        } else {
            LaunchOutcome::Superseded
        }
    }

    /// A supervisor request issued under `epoch` failed.
    pub(crate) fn supervisor_failed(&mut self, agent_id: Uuid, epoch: u64, error: &OverseerError) {
        let Ok(agent) = self.registry.agent(agent_id) else {
            return;
        };
        if agent.epoch != epoch {
            debug!(agent_id = %agent_id, error = %error, "Supervisor failure for an old transition");
            return;
        }
        let status = agent.status;
        warn!(agent_id = %agent_id, status = %status, error = %error, "Supervisor request failed");
        match status {
            AgentStatus::Terminating => self.remove_agent(agent_id),
            AgentStatus::Starting | AgentStatus::Stopping => {
                self.fail_agent(agent_id, &error.to_string());
            }
            _ => {}
        }
    }

    pub(crate) fn agent_deadline(&mut self, deadline: Deadline) {
        match deadline {
            Deadline::AgentStop { agent_id, epoch } => {
                if self.agent_at(agent_id, AgentStatus::Stopping, epoch) {
                    warn!(agent_id = %agent_id, "Stop timed out");
                    self.fail_agent(agent_id, "stop timed out");
                }
            }
            Deadline::AgentTerminate { agent_id, epoch } => {
                if self.agent_at(agent_id, AgentStatus::Terminating, epoch) {
                    warn!(agent_id = %agent_id, "Terminate timed out, removing agent");
                    self.remove_agent(agent_id);
                }
            }
            Deadline::TaskStop { .. } => {}
        }
    }

    fn agent_at(&self, agent_id: Uuid, status: AgentStatus, epoch: u64) -> bool {
        matches!(
            self.registry.agent(agent_id),
            Ok(agent) if agent.status == status && agent.epoch == epoch
        )
    }

    /// Move an agent to `error`, releasing anything it held.
    pub(crate) fn fail_agent(&mut self, agent_id: Uuid, reason: &str) {
        self.settle_agent(agent_id, AgentStatus::Error, reason);
    }

    /// Park an agent in a terminal-ish status (`error`, `exited_*`).
    fn settle_agent(&mut self, agent_id: Uuid, status: AgentStatus, reason: &str) {
        self.release_task(agent_id, reason);
        self.drop_pins(agent_id);
        self.links.remove(&agent_id);
        let epoch = self.next_epoch();
        if let Ok(agent) = self.registry.agent_mut(agent_id) {
            agent.status = status;
            agent.epoch = epoch;
        }
        self.touch_agent(agent_id, Change::Updated);
    }

    /// Destroy an agent, releasing anything it held.
    pub(crate) fn remove_agent(&mut self, agent_id: Uuid) {
        self.release_task(agent_id, "agent removed");
        self.drop_pins(agent_id);
        self.links.remove(&agent_id);
        self.handles.remove(&agent_id);
        if self.registry.remove_agent(agent_id).is_some() {
            self.touch_agent(agent_id, Change::Removed);
        }
    }

    /// Forget reservations made for an agent that will not become idle.
    fn drop_pins(&mut self, agent_id: Uuid) {
        for task_id in self.registry.pinned_to(agent_id) {
            if let Ok(task) = self.registry.task_mut(task_id) {
                task.pinned_agent = None;
                debug!(task_id = %task_id, agent_id = %agent_id, "Pin dropped");
            }
        }
    }
}

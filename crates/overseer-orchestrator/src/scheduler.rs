//! Pairing of idle agents with assignable tasks.
//!
//! A pass runs after every engine mutation. Pinned tasks go to their agent in
//! either mode; in auto mode the oldest pending tasks then go to idle agents in
//! creation order until one side runs out.

use crate::protocol::WorkerDirective;
use crate::state::{Change, EngineState};
use crate::types::{AgentStatus, AssignmentMode, TaskStatus};
use overseer_core::{OverseerError, OverseerResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

impl EngineState {
    pub(crate) fn set_mode(&mut self, mode: AssignmentMode) {
        if self.mode != mode {
            info!(from = %self.mode, to = %mode, "Assignment mode changed");
        }
        self.mode = mode;
        self.touch_mode();
    }

    /// Assign a specific task to a specific agent, accepted in both modes.
    pub(crate) fn manual_assign(&mut self, task_id: Uuid, agent_id: Uuid) -> OverseerResult<()> {
        self.assign(agent_id, task_id)
    }

    /// Run one scheduling pass. Returns the number of assignments made.
    pub(crate) fn schedule(&mut self) -> usize {
        let mut assigned = 0;
        while let Some((agent_id, task_id)) = self.next_pair() {
            match self.assign(agent_id, task_id) {
                Ok(()) => assigned += 1,
                Err(e) => {
                    // next_pair only yields valid pairs, so this is a workspace failure.
                    warn!(agent_id = %agent_id, task_id = %task_id, error = %e, "Assignment failed");
                    break;
                }
            }
        }
        if assigned > 0 {
            debug!(assigned, mode = %self.mode, "Scheduling pass");
        }
        assigned
    }

    /// The next pairing a pass should make.
    ///
    /// Auto mode only draws from `pending` tasks. A released task is `incomplete`
    /// and runs again only through `manual_assign`; releasing it still frees its
    /// agent for the next pending task.
    fn next_pair(&self) -> Option<(Uuid, Uuid)> {
        let idle = self.registry.idle_agents();
        for agent_id in &idle {
            if let Some(task_id) = self.registry.pinned_to(*agent_id).first() {
                return Some((*agent_id, *task_id));
            }
        }
        if self.mode != AssignmentMode::Auto {
            return None;
        }
        let task_id = self.registry.pending_queue().into_iter().next()?;
        let agent_id = idle.into_iter().next()?;
        Some((agent_id, task_id))
    }

    /// Pair `agent_id` with `task_id` and dispatch the task to the worker.
    ///
    /// Validation happens before anything changes. If the directive cannot be
    /// delivered the pairing is undone and the agent goes to `error`.
    pub(crate) fn assign(&mut self, agent_id: Uuid, task_id: Uuid) -> OverseerResult<()> {
        let task = self.registry.task(task_id)?;
        if !task.status.is_assignable() {
            return Err(OverseerError::invalid_state(
                "task",
                task_id,
                task.status,
                "assign",
            ));
        }
        let agent = self.registry.agent(agent_id)?;
        if agent.status != AgentStatus::Idle {
            return Err(OverseerError::invalid_state(
                "agent",
                agent_id,
                agent.status,
                "assign a task to",
            ));
        }

        let workspace = self.workspaces.alloc(task_id)?;
        if let Err(e) = self.registry.bind(agent_id, task_id) {
            self.workspaces.free(workspace);
            return Err(e);
        }

        let agent = self.registry.agent_mut(agent_id)?;
        agent.status = AgentStatus::Busy;
        agent.workspace = Some(workspace);

        let task = self.registry.task_mut(task_id)?;
        task.status = TaskStatus::Processing;
        task.result = None;
        task.pinned_agent = None;
        task.begin_run();
        let description = task.description.clone();

        self.touch_agent(agent_id, Change::Updated);
        self.touch_task(task_id, Change::Updated);
        self.touch_workspaces();

        let directive = WorkerDirective::AssignTask {
            task_id,
            description,
            workspace: self.workspaces.path(workspace),
        };
        if !self.send_directive(agent_id, directive) {
            warn!(agent_id = %agent_id, task_id = %task_id, "Task could not be dispatched");
            self.fail_agent(agent_id, "dispatch failed");
            return Ok(());
        }
        info!(task_id = %task_id, agent_id = %agent_id, workspace, "Task assigned");
        Ok(())
    }
}

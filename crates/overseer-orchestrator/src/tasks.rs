//! Task lifecycle transitions and worker reports.

use crate::protocol::{ServerEvent, WorkerDirective};
use crate::state::{Change, Deadline, Effect, EngineState, PendingStop};
use crate::types::{AgentStatus, RunStatus, Task, TaskStatus};
use overseer_core::{OverseerError, OverseerResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

impl EngineState {
    pub(crate) fn add_task(&mut self, description: &str) -> OverseerResult<Task> {
        if description.trim().is_empty() {
            return Err(OverseerError::MissingField("description"));
        }
        let id = self.registry.add_task(Task::new(description));
        self.touch_task(id, Change::Created);
        info!(task_id = %id, "Task added");
        Ok(self.registry.task(id)?.clone())
    }

    /// Delete a task. A processing task is cancelled first and only removed once
    /// its agent acknowledges, reports a result, or the stop bound runs out.
    pub(crate) fn delete_task(&mut self, task_id: Uuid) -> OverseerResult<()> {
        let task = self.registry.task(task_id)?;
        let Some(agent_id) = task.assigned_agent_id else {
            self.purge_task(task_id);
            return Ok(());
        };
        if let Some(stop) = self.pending_stops.get_mut(&task_id) {
            stop.delete_on_release = true;
            info!(task_id = %task_id, "Task will be deleted once its stop completes");
            return Ok(());
        }
        info!(task_id = %task_id, agent_id = %agent_id, "Task deletion waits for the worker to cancel");
        self.request_stop(task_id, agent_id, true);
        Ok(())
    }

    /// Ask the worker running a task to cancel it.
    pub(crate) fn stop_task(&mut self, task_id: Uuid) -> OverseerResult<()> {
        let task = self.registry.task(task_id)?;
        if task.status != TaskStatus::Processing {
            return Err(OverseerError::invalid_state(
                "task",
                task_id,
                task.status,
                "stop",
            ));
        }
        if self.pending_stops.contains_key(&task_id) {
            return Err(OverseerError::Validation(format!(
                "a stop is already pending for task {task_id}"
            )));
        }
        let Some(agent_id) = task.assigned_agent_id else {
            return Err(OverseerError::invalid_state(
                "task",
                task_id,
                "unassigned",
                "stop",
            ));
        };
        info!(task_id = %task_id, agent_id = %agent_id, "Task stop requested");
        self.request_stop(task_id, agent_id, false);
        Ok(())
    }

    /// Send the cancel directive and bound the wait for its acknowledgement.
    fn request_stop(&mut self, task_id: Uuid, agent_id: Uuid, delete_on_release: bool) {
        let epoch = self.next_epoch();
        self.pending_stops.insert(
            task_id,
            PendingStop {
                agent_id,
                epoch,
                delete_on_release,
            },
        );
        if !self.send_directive(agent_id, WorkerDirective::CancelTask { task_id }) {
            warn!(task_id = %task_id, agent_id = %agent_id, "Cancel could not be delivered");
            self.fail_agent(agent_id, "cancel could not be delivered");
            return;
        }
        self.push_effect(Effect::Arm {
            deadline: Deadline::TaskStop { task_id, epoch },
            after: self.settings.stop_timeout,
        });
    }

    /// Drop a task that no agent holds.
    fn purge_task(&mut self, task_id: Uuid) {
        self.progress.remove_task(task_id);
        if self.registry.remove_task(task_id).is_some() {
            self.touch_task(task_id, Change::Removed);
            info!(task_id = %task_id, "Task deleted");
        }
    }

    /// Run a task on an agent of the named worker configuration, creating and
    /// starting a dedicated agent when no idle one exists.
    pub(crate) fn start_task(&mut self, task_id: Uuid, worker_config: &str) -> OverseerResult<()> {
        let task = self.registry.task(task_id)?;
        if !task.status.is_assignable() {
            return Err(OverseerError::invalid_state(
                "task",
                task_id,
                task.status,
                "start",
            ));
        }
        if worker_config.trim().is_empty() {
            return Err(OverseerError::MissingField("worker_config"));
        }
        if !self.catalog.contains(worker_config) {
            return Err(OverseerError::UnknownConfig(worker_config.to_string()));
        }

        let idle = self
            .registry
            .agents()
            .into_iter()
            .find(|a| a.status == AgentStatus::Idle && a.config == worker_config)
            .map(|a| a.id);
        if let Some(agent_id) = idle {
            return self.assign(agent_id, task_id);
        }

        let agent = self.create_agent(worker_config)?;
        self.start_agent(agent.id)?;
        self.registry.task_mut(task_id)?.pinned_agent = Some(agent.id);
        info!(task_id = %task_id, agent_id = %agent.id, "Task pinned to a dedicated agent");
        Ok(())
    }

    /// Subscribe a session to a task's output, replaying the history first.
    pub(crate) fn subscribe_progress(&mut self, session_id: Uuid, task_id: Uuid) -> OverseerResult<()> {
        let history = self.registry.task(task_id)?.history().to_string();
        let full = ServerEvent::TaskProgressFull { task_id, history };
        if self.send_to(session_id, full) {
            self.progress.subscribe(task_id, session_id);
        }
        Ok(())
    }

    pub(crate) fn unsubscribe_progress(&mut self, session_id: Uuid, task_id: Uuid) {
        if !self.progress.unsubscribe(task_id, session_id) {
            debug!(task_id = %task_id, session_id = %session_id, "No subscription to remove");
        }
    }

    /// Whether `agent_id` currently holds `task_id`. Reports failing this check are stale.
    fn holds(&self, agent_id: Uuid, task_id: Uuid) -> bool {
        matches!(
            self.registry.agent(agent_id),
            Ok(agent) if agent.assigned_task_id == Some(task_id)
        )
    }

    pub(crate) fn worker_progress(&mut self, agent_id: Uuid, task_id: Uuid, token: &str) {
        if !self.holds(agent_id, task_id) {
            warn!(agent_id = %agent_id, task_id = %task_id, "Ignoring output for a task the agent does not hold");
            return;
        }
        if let Ok(task) = self.registry.task_mut(task_id) {
            task.append_output(token);
        }
        for session_id in self.progress.subscribers(task_id).to_vec() {
            self.send_to(
                session_id,
                ServerEvent::TaskProgressDelta {
                    task_id,
                    token: token.to_string(),
                },
            );
        }
    }

    pub(crate) fn worker_result(
        &mut self,
        agent_id: Uuid,
        task_id: Uuid,
        status: RunStatus,
        result: serde_json::Value,
    ) {
        if !self.holds(agent_id, task_id) {
            warn!(agent_id = %agent_id, task_id = %task_id, "Ignoring result for a task the agent does not hold");
            return;
        }

        if self.pending_stops.contains_key(&task_id) {
            info!(task_id = %task_id, "Result arrived while a stop was pending");
            self.release_task(agent_id, "stopped");
            self.idle_agent(agent_id);
            return;
        }

        match status {
            RunStatus::Completed => {
                self.finish_run(agent_id);
                if let Ok(task) = self.registry.task_mut(task_id) {
                    task.status = TaskStatus::Complete;
                    task.result = Some(result);
                }
                info!(task_id = %task_id, agent_id = %agent_id, "Task complete");
            }
            RunStatus::Failed => {
                let reason = match &result {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => "worker reported failure".to_string(),
                    other => other.to_string(),
                };
                warn!(task_id = %task_id, agent_id = %agent_id, reason = %reason, "Task failed");
                self.release_task(agent_id, &reason);
            }
        }
        self.idle_agent(agent_id);
    }

    pub(crate) fn worker_cancel_ack(&mut self, agent_id: Uuid, task_id: Uuid) {
        match self.pending_stops.get(&task_id) {
            Some(stop) if stop.agent_id == agent_id => {}
            _ => {
                debug!(agent_id = %agent_id, task_id = %task_id, "Unsolicited cancel acknowledgement");
                return;
            }
        }
        info!(task_id = %task_id, agent_id = %agent_id, "Task stopped");
        self.release_task(agent_id, "stopped");
        self.idle_agent(agent_id);
    }

    pub(crate) fn task_deadline(&mut self, deadline: Deadline) {
        let Deadline::TaskStop { task_id, epoch } = deadline else {
            return;
        };
        let agent_id = match self.pending_stops.get(&task_id) {
            Some(stop) if stop.epoch == epoch => stop.agent_id,
            _ => return,
        };
        warn!(task_id = %task_id, agent_id = %agent_id, "Stop was not acknowledged in time");
        self.release_task(agent_id, "stop timed out");
        self.fail_agent(agent_id, "stop timed out");
    }

    /// Unpair the task `agent_id` holds, returning the workspace and marking the
    /// task `incomplete` with `reason`. A task awaiting deletion is removed instead.
    /// The agent's own status is left to the caller.
    pub(crate) fn release_task(&mut self, agent_id: Uuid, reason: &str) -> Option<Uuid> {
        let (task_id, stop) = self.finish_run(agent_id)?;
        if stop.is_some_and(|stop| stop.delete_on_release) {
            self.purge_task(task_id);
            return Some(task_id);
        }
        if let Ok(task) = self.registry.task_mut(task_id) {
            task.status = TaskStatus::Incomplete;
            task.last_error = Some(reason.to_string());
        }
        debug!(task_id = %task_id, agent_id = %agent_id, reason, "Task released");
        Some(task_id)
    }

    /// Break the pairing and free the workspace without deciding the task's outcome.
    fn finish_run(&mut self, agent_id: Uuid) -> Option<(Uuid, Option<PendingStop>)> {
        let task_id = self.registry.unbind_agent(agent_id)?;
        let stop = self.pending_stops.remove(&task_id);
        if let Some(ws) = self
            .registry
            .agent_mut(agent_id)
            .ok()
            .and_then(|agent| agent.workspace.take())
        {
            self.workspaces.free(ws);
            self.touch_workspaces();
        }
        self.touch_agent(agent_id, Change::Updated);
        self.touch_task(task_id, Change::Updated);
        Some((task_id, stop))
    }

    fn idle_agent(&mut self, agent_id: Uuid) {
        if let Ok(agent) = self.registry.agent_mut(agent_id) {
            if agent.status == AgentStatus::Busy {
                agent.status = AgentStatus::Idle;
            }
        }
        self.touch_agent(agent_id, Change::Updated);
    }
}

use crate::agents::LaunchOutcome;
use crate::protocol::{Command, ServerEvent, WorkerDirective, WorkerReport};
use crate::state::{Deadline, Effect, EngineState};
use crate::types::{Agent, AssignmentMode, Task, WorkspaceInfo};
use crate::worker::{AgentConfig, ConfigCatalog, SupervisorEvent, WorkerSupervisor};
use crate::workspace::WorkspaceManager;
use overseer_core::{OverseerError, OverseerResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tunables for an [`Engine`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Mode the engine starts in.
    pub default_mode: AssignmentMode,
    /// Bound on agent stop and task cancel handshakes.
    pub stop_timeout: Duration,
    /// Bound on agent termination before the agent is removed anyway.
    pub terminate_timeout: Duration,
    /// Capacity of each observer's outbound queue.
    pub observer_queue: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_mode: AssignmentMode::Auto,
            stop_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(5),
            observer_queue: 256,
        }
    }
}

/// Self-consistent copy of the agent and task tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub mode: AssignmentMode,
}

/// The orchestration engine.
///
/// All state sits behind one mutex that is never held across an await. Every
/// public operation locks, mutates, runs a scheduling pass, publishes what changed
/// and releases the lock; supervisor calls and handshake timers queued during the
/// mutation are then spawned as tokio tasks whose outcomes come back through the
/// same path.
pub struct Engine {
    state: Mutex<EngineState>,
    supervisor: Arc<dyn WorkerSupervisor>,
    observer_queue: usize,
}

impl Engine {
    /// Create an engine and start pumping `events` from the supervisor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        settings: EngineSettings,
        catalog: ConfigCatalog,
        workspaces: WorkspaceManager,
        supervisor: Arc<dyn WorkerSupervisor>,
        events: mpsc::UnboundedReceiver<SupervisorEvent>,
    ) -> Arc<Self> {
        // The snapshot and the workspace list are both queued on connect.
        let observer_queue = settings.observer_queue.max(2);
        info!(
            mode = %settings.default_mode,
            configs = catalog.configs().len(),
            workspaces = workspaces.len(),
            "Engine created"
        );
        let engine = Arc::new(Self {
            state: Mutex::new(EngineState::new(settings, catalog, workspaces)),
            supervisor,
            observer_queue,
        });
        tokio::spawn(pump_supervisor_events(Arc::downgrade(&engine), events));
        engine
    }

    /// Lock, mutate, schedule, publish, unlock, then run queued effects.
    ///
    /// Debug builds check every cross-entity invariant before the lock is released.
    fn apply<R>(
        self: &Arc<Self>,
        f: impl FnOnce(&mut EngineState) -> OverseerResult<R>,
    ) -> OverseerResult<R> {
        let (result, effects) = {
            let mut state = self.state.lock();
            let result = f(&mut state);
            state.schedule();
            state.flush();
            debug_assert!(
                state.check_invariants().is_ok(),
                "engine invariant violated: {:?}",
                state.check_invariants()
            );
            (result, state.take_effects())
        };
        for effect in effects {
            tokio::spawn(Arc::clone(self).perform(effect));
        }
        result
    }

    async fn perform(self: Arc<Self>, effect: Effect) {
        match effect {
            Effect::Launch {
                agent_id,
                epoch,
                config,
                handle,
            } => {
                let handle = match handle {
                    Some(handle) => handle,
                    None => match self.supervisor.spawn(agent_id, &config).await {
                        Ok(handle) => {
                            let recorded = handle.clone();
                            let outcome = self
                                .apply(|state| Ok(state.record_handle(agent_id, epoch, recorded)))
                                .unwrap_or(LaunchOutcome::Orphaned);
                            match outcome {
                                LaunchOutcome::Proceed => handle,
                                LaunchOutcome::Superseded => {
                                    debug!(agent_id = %agent_id, "Launch abandoned after spawn");
                                    return;
                                }
                                LaunchOutcome::Orphaned => {
                                    debug!(agent_id = %agent_id, "Agent removed during spawn, releasing worker");
                                    if let Err(e) = self.supervisor.release(&handle).await {
                                        warn!(agent_id = %agent_id, error = %e, "Failed to release worker");
                                    }
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            self.supervisor_failed(agent_id, epoch, e);
                            return;
                        }
                    },
                };
                if let Err(e) = self.supervisor.signal_start(&handle).await {
                    self.supervisor_failed(agent_id, epoch, e);
                }
            }
            Effect::Stop {
                agent_id,
                epoch,
                handle,
            } => {
                if let Err(e) = self.supervisor.signal_stop(&handle).await {
                    self.supervisor_failed(agent_id, epoch, e);
                }
            }
            Effect::Terminate {
                agent_id,
                epoch,
                handle,
            } => {
                if let Err(e) = self.supervisor.signal_terminate(&handle).await {
                    self.supervisor_failed(agent_id, epoch, e);
                }
            }
            Effect::Arm { deadline, after } => {
                tokio::time::sleep(after).await;
                self.deadline_elapsed(deadline);
            }
        }
    }

    fn supervisor_failed(self: &Arc<Self>, agent_id: Uuid, epoch: u64, error: OverseerError) {
        let _ = self.apply(|state| {
            state.supervisor_failed(agent_id, epoch, &error);
            Ok(())
        });
    }

    fn deadline_elapsed(self: &Arc<Self>, deadline: Deadline) {
        debug!(?deadline, "Deadline elapsed");
        let _ = self.apply(|state| {
            match deadline {
                Deadline::TaskStop { .. } => state.task_deadline(deadline),
                Deadline::AgentStop { .. } | Deadline::AgentTerminate { .. } => {
                    state.agent_deadline(deadline);
                }
            }
            Ok(())
        });
    }

    // --- Observers -------------------------------------------------------

    /// Register a new observer session.
    ///
    /// The returned queue already holds a `state` snapshot followed by the
    /// workspace list; deltas follow from the next mutation on.
    pub fn connect_observer(&self) -> (Uuid, mpsc::Receiver<ServerEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.observer_queue);
        let mut state = self.state.lock();
        let _ = tx.try_send(state.snapshot_event());
        let _ = tx.try_send(state.workspaces_event());
        state.hub.register(session_id, tx);
        (session_id, rx)
    }

    /// Forget a session and all of its progress subscriptions.
    pub fn disconnect_observer(&self, session_id: Uuid) {
        let mut state = self.state.lock();
        state.hub.remove(session_id);
        state.progress.remove_session(session_id);
    }

    /// Drop every observer session. Their sockets close and clients must reconnect.
    pub fn disconnect_all_observers(&self) {
        let mut state = self.state.lock();
        state.hub.clear();
        state.progress.clear();
    }

    pub fn observer_count(&self) -> usize {
        self.state.lock().hub.session_count()
    }

    /// Send an `error` event to one session only.
    pub fn report_error(&self, session_id: Uuid, message: impl Into<String>) {
        let mut state = self.state.lock();
        state.send_to(
            session_id,
            ServerEvent::Error {
                message: message.into(),
            },
        );
    }

    /// Execute an observer command, reporting a rejection back to that session.
    pub fn dispatch(self: &Arc<Self>, session_id: Uuid, command: Command) {
        if let Err(e) = self.execute(session_id, command) {
            warn!(session_id = %session_id, error = %e, "Command rejected");
            self.report_error(session_id, e.to_string());
        }
    }

    /// Execute an observer command.
    pub fn execute(self: &Arc<Self>, session_id: Uuid, command: Command) -> OverseerResult<()> {
        match command {
            Command::CreateAgent { config } => self.create_agent(&config).map(drop),
            Command::StartAgent { agent_id } => self.start_agent(agent_id),
            Command::StopAgent { agent_id } => self.stop_agent(agent_id),
            Command::TerminateAgent { agent_id } => self.terminate_agent(agent_id),
            Command::AddTask { description } => self.add_task(&description).map(drop),
            Command::DeleteTask { task_id } => self.delete_task(task_id),
            Command::ManualAssignTask { task_id, agent_id } => self.manual_assign(task_id, agent_id),
            Command::SetAssignmentMode { mode } => {
                self.set_mode(mode);
                Ok(())
            }
            Command::GetProgress { task_id } => self.get_progress(session_id, task_id),
            Command::UnsubscribeProgress { task_id } => {
                self.unsubscribe_progress(session_id, task_id);
                Ok(())
            }
            Command::StartTask {
                task_id,
                worker_config,
            } => self.start_task(task_id, &worker_config),
            Command::StopTask { task_id } => self.stop_task(task_id),
        }
    }

    // --- Agents ----------------------------------------------------------

    pub fn create_agent(self: &Arc<Self>, config: &str) -> OverseerResult<Agent> {
        self.apply(|state| state.create_agent(config))
    }

    pub fn start_agent(self: &Arc<Self>, agent_id: Uuid) -> OverseerResult<()> {
        self.apply(|state| state.start_agent(agent_id))
    }

    pub fn stop_agent(self: &Arc<Self>, agent_id: Uuid) -> OverseerResult<()> {
        self.apply(|state| state.stop_agent(agent_id))
    }

    pub fn terminate_agent(self: &Arc<Self>, agent_id: Uuid) -> OverseerResult<()> {
        self.apply(|state| state.terminate_agent(agent_id))
    }

    pub fn agent(&self, agent_id: Uuid) -> OverseerResult<Agent> {
        self.state.lock().registry.agent(agent_id).cloned()
    }

    // --- Tasks -----------------------------------------------------------

    pub fn add_task(self: &Arc<Self>, description: &str) -> OverseerResult<Task> {
        self.apply(|state| state.add_task(description))
    }

    pub fn delete_task(self: &Arc<Self>, task_id: Uuid) -> OverseerResult<()> {
        self.apply(|state| state.delete_task(task_id))
    }

    pub fn start_task(self: &Arc<Self>, task_id: Uuid, worker_config: &str) -> OverseerResult<()> {
        self.apply(|state| state.start_task(task_id, worker_config))
    }

    pub fn stop_task(self: &Arc<Self>, task_id: Uuid) -> OverseerResult<()> {
        self.apply(|state| state.stop_task(task_id))
    }

    pub fn manual_assign(self: &Arc<Self>, task_id: Uuid, agent_id: Uuid) -> OverseerResult<()> {
        self.apply(|state| state.manual_assign(task_id, agent_id))
    }

    pub fn set_mode(self: &Arc<Self>, mode: AssignmentMode) {
        let _ = self.apply(|state| {
            state.set_mode(mode);
            Ok(())
        });
    }

    pub fn mode(&self) -> AssignmentMode {
        self.state.lock().mode
    }

    pub fn task(&self, task_id: Uuid) -> OverseerResult<Task> {
        self.state.lock().registry.task(task_id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state
            .lock()
            .registry
            .tasks()
            .into_iter()
            .cloned()
            .collect()
    }

    /// The execution history of a task's current or last run.
    pub fn history(&self, task_id: Uuid) -> OverseerResult<String> {
        Ok(self
            .state
            .lock()
            .registry
            .task(task_id)?
            .history()
            .to_string())
    }

    pub fn get_progress(&self, session_id: Uuid, task_id: Uuid) -> OverseerResult<()> {
        self.state.lock().subscribe_progress(session_id, task_id)
    }

    pub fn unsubscribe_progress(&self, session_id: Uuid, task_id: Uuid) {
        self.state.lock().unsubscribe_progress(session_id, task_id);
    }

    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            agents: state.registry.agents().into_iter().cloned().collect(),
            tasks: state.registry.tasks().into_iter().cloned().collect(),
            mode: state.mode,
        }
    }

    // --- Workers ---------------------------------------------------------

    /// Register a worker link. This is the worker's readiness signal.
    pub fn attach_worker(
        self: &Arc<Self>,
        agent_id: Uuid,
        tx: mpsc::UnboundedSender<WorkerDirective>,
    ) -> OverseerResult<Uuid> {
        self.apply(|state| state.attach_worker(agent_id, tx))
    }

    pub fn detach_worker(self: &Arc<Self>, agent_id: Uuid, link_id: Uuid) {
        let _ = self.apply(|state| {
            state.detach_worker(agent_id, link_id);
            Ok(())
        });
    }

    /// Apply a report received over a worker link.
    pub fn worker_report(self: &Arc<Self>, agent_id: Uuid, report: WorkerReport) {
        let _ = self.apply(|state| {
            match report {
                WorkerReport::ProgressUpdate { task_id, token } => {
                    state.worker_progress(agent_id, task_id, &token);
                }
                WorkerReport::TaskResult {
                    task_id,
                    status,
                    result,
                } => state.worker_result(agent_id, task_id, status, result),
                WorkerReport::CancelAck { task_id } => state.worker_cancel_ack(agent_id, task_id),
            }
            Ok(())
        });
    }

    pub fn handle_supervisor_event(self: &Arc<Self>, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Exited { agent_id, normal } => {
                let _ = self.apply(|state| {
                    state.worker_exited(agent_id, normal);
                    Ok(())
                });
            }
        }
    }

    pub fn worker_configs(&self) -> Vec<AgentConfig> {
        self.state.lock().catalog.configs().to_vec()
    }

    // --- Workspaces ------------------------------------------------------

    pub fn workspaces(&self) -> Vec<WorkspaceInfo> {
        self.state.lock().workspaces.list()
    }

    pub fn create_workspace(self: &Arc<Self>) -> OverseerResult<WorkspaceInfo> {
        self.apply(|state| {
            let id = state.workspaces.create()?;
            state.touch_workspaces();
            state
                .workspaces
                .list()
                .into_iter()
                .find(|w| w.id == id)
                .ok_or(OverseerError::UnknownWorkspace(id))
        })
    }

    pub fn delete_workspace(self: &Arc<Self>, id: u32) -> OverseerResult<()> {
        self.apply(|state| {
            state.workspaces.delete(id)?;
            state.touch_workspaces();
            Ok(())
        })
    }

    pub fn set_workspace_count(self: &Arc<Self>, count: usize) -> OverseerResult<()> {
        self.apply(|state| {
            state.workspaces.set_count(count)?;
            state.touch_workspaces();
            Ok(())
        })
    }

    // --- Lifecycle -------------------------------------------------------

    /// Check every cross-entity invariant. Intended for tests and diagnostics.
    pub fn verify_invariants(&self) -> Result<(), String> {
        self.state.lock().check_invariants()
    }

    /// Terminate every agent and wait for the supervisor to be signalled.
    pub async fn shutdown(self: &Arc<Self>) {
        let effects = {
            let mut state = self.state.lock();
            let ids: Vec<Uuid> = state
                .registry
                .agents()
                .into_iter()
                .filter(|a| a.status.accepts_terminate())
                .map(|a| a.id)
                .collect();
            for id in &ids {
                if let Err(e) = state.terminate_agent(*id) {
                    warn!(agent_id = %id, error = %e, "Terminate during shutdown failed");
                }
            }
            state.flush();
            state.take_effects()
        };
        info!(pending = effects.len(), "Engine shutting down");
        for effect in effects {
            if let Effect::Terminate { .. } = effect {
                Arc::clone(self).perform(effect).await;
            }
        }
        self.disconnect_all_observers();
    }
}

async fn pump_supervisor_events(
    engine: Weak<Engine>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(engine) = engine.upgrade() else {
            break;
        };
        debug!(?event, "Supervisor event");
        engine.handle_supervisor_event(event);
    }
    debug!("Supervisor event stream closed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::state::PendingStop;
    use crate::worker::WorkerHandle;
    use async_trait::async_trait;

    struct IdleSupervisor;

    #[async_trait]
    impl WorkerSupervisor for IdleSupervisor {
        async fn spawn(&self, agent_id: Uuid, _config: &AgentConfig) -> OverseerResult<WorkerHandle> {
            Ok(WorkerHandle { agent_id })
        }

        async fn signal_start(&self, _handle: &WorkerHandle) -> OverseerResult<()> {
            Ok(())
        }

        async fn signal_stop(&self, _handle: &WorkerHandle) -> OverseerResult<()> {
            Ok(())
        }

        async fn signal_terminate(&self, _handle: &WorkerHandle) -> OverseerResult<()> {
            Ok(())
        }
    }

    fn engine(root: &std::path::Path) -> Arc<Engine> {
        let workspaces = WorkspaceManager::open(root).unwrap();
        let (_events, rx) = mpsc::unbounded_channel();
        Engine::new(
            EngineSettings::default(),
            ConfigCatalog::default(),
            workspaces,
            Arc::new(IdleSupervisor),
            rx,
        )
    }

    #[tokio::test]
    async fn test_commands_keep_invariants() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        let task = engine.add_task("consistent").unwrap();
        engine.delete_task(task.id).unwrap();
        engine.verify_invariants().unwrap();
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "engine invariant violated")]
    async fn test_violation_is_caught_when_the_command_finishes() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = engine(tmp.path());
        engine.state.lock().pending_stops.insert(
            Uuid::new_v4(),
            PendingStop {
                agent_id: Uuid::new_v4(),
                epoch: 0,
                delete_on_release: false,
            },
        );
        let _ = engine.add_task("anything");
    }
}

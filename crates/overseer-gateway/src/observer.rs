//! Client side of the observer socket.
//!
//! An [`ObserverSession`] keeps a local mirror of the engine's agents, tasks, mode and
//! workspaces. Every connection starts from the `state` snapshot the server sends first,
//! so a reconnect always resynchronizes from scratch. Consecutive failed connection
//! attempts are bounded by a [`ReconnectPolicy`].

use futures_util::{SinkExt, StreamExt};
use overseer_core::{OverseerError, OverseerResult};
use overseer_orchestrator::{Agent, AssignmentMode, Command, ServerEvent, Task, WorkspaceInfo};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How hard an [`ObserverSession`] tries to get a connection back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Consecutive failed connection attempts before giving up.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

/// What an observer currently believes the engine looks like.
#[derive(Debug, Clone, Default)]
pub struct ObservedState {
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub mode: AssignmentMode,
    pub workspaces: Vec<WorkspaceInfo>,
}

impl ObservedState {
    /// Fold one server event into the mirror.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::State {
                agents,
                tasks,
                mode,
            } => {
                self.agents = agents.clone();
                self.tasks = tasks.clone();
                self.mode = *mode;
            }
            ServerEvent::ModeUpdate { mode } => self.mode = *mode,
            ServerEvent::TaskCreated { task } => upsert(&mut self.tasks, task.id, task, |t| t.id),
            ServerEvent::TaskUpdate { task_id, data } => {
                upsert(&mut self.tasks, *task_id, data, |t| t.id);
            }
            ServerEvent::TaskDeleted { task_id } => self.tasks.retain(|t| t.id != *task_id),
            ServerEvent::AgentCreated { agent } => {
                upsert(&mut self.agents, agent.id, agent, |a| a.id);
            }
            ServerEvent::AgentUpdate { agent_id, data } => {
                upsert(&mut self.agents, *agent_id, data, |a| a.id);
            }
            ServerEvent::AgentRemoved { agent_id } => self.agents.retain(|a| a.id != *agent_id),
            ServerEvent::WorkspacesUpdated { workspaces } => self.workspaces = workspaces.clone(),
            ServerEvent::TaskProgressFull { .. }
            | ServerEvent::TaskProgressDelta { .. }
            | ServerEvent::Error { .. } => {}
        }
    }

    pub fn agent(&self, agent_id: Uuid) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn task(&self, task_id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }
}

fn upsert<T: Clone>(items: &mut Vec<T>, id: Uuid, item: &T, key: impl Fn(&T) -> Uuid) {
    match items.iter_mut().find(|existing| key(existing) == id) {
        Some(existing) => *existing = item.clone(),
        None => items.push(item.clone()),
    }
}

/// A reconnecting observer connection.
pub struct ObserverSession {
    url: String,
    policy: ReconnectPolicy,
    state: ObservedState,
    connections: u32,
    outbound_tx: mpsc::UnboundedSender<Command>,
    outbound_rx: mpsc::UnboundedReceiver<Command>,
}

impl ObserverSession {
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            url: url.into(),
            policy,
            state: ObservedState::default(),
            connections: 0,
            outbound_tx,
            outbound_rx,
        }
    }

    pub fn state(&self) -> &ObservedState {
        &self.state
    }

    /// Number of successful connections made so far.
    pub fn connections(&self) -> u32 {
        self.connections
    }

    /// A handle for sending commands. Commands queued while disconnected are sent
    /// after the next successful connection.
    pub fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.outbound_tx.clone()
    }

    /// Run until `on_event` breaks or the reconnect policy is exhausted.
    ///
    /// `on_event` sees each event after it has been folded into the mirror.
    pub async fn run<F>(&mut self, mut on_event: F) -> OverseerResult<()>
    where
        F: FnMut(&ServerEvent, &ObservedState) -> ControlFlow<()>,
    {
        let Self {
            url,
            policy,
            state,
            connections,
            outbound_rx,
            ..
        } = self;
        let mut failures = 0u32;

        loop {
            let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
                Ok((ws, _)) => ws,
                Err(e) => {
                    failures += 1;
                    warn!(url = %url, attempt = failures, error = %e, "Observer connection failed");
                    if failures >= policy.max_attempts {
                        return Err(OverseerError::Gateway(format!(
                            "gave up on {url} after {failures} attempts: {e}"
                        )));
                    }
                    tokio::time::sleep(policy.delay).await;
                    continue;
                }
            };
            failures = 0;
            *connections += 1;
            info!(url = %url, connection = *connections, "Observer connected");

            let (mut sink, mut stream) = ws.split();
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        let text = match msg {
                            Some(Ok(Message::Text(text))) => text,
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                warn!(error = %e, "Observer stream error");
                                break;
                            }
                        };
                        let event: ServerEvent = match serde_json::from_str(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "Undecodable server event ignored");
                                continue;
                            }
                        };
                        state.apply(&event);
                        if on_event(&event, state).is_break() {
                            let _ = sink.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                    Some(command) = outbound_rx.recv() => {
                        let json = serde_json::to_string(&command)?;
                        debug!(?command, "Sending command");
                        if sink.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
            }

            info!(url = %url, "Observer connection lost, reconnecting");
            tokio::time::sleep(policy.delay).await;
        }
    }
}

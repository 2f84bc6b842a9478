use overseer_orchestrator::{Command, Engine, WorkerReport};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Decodes inbound socket text and hands it to the engine.
pub struct MessageRouter {
    engine: Arc<Engine>,
}

impl MessageRouter {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Handle one text frame from an observer.
    ///
    /// Frames that are not a known command are answered with an `error` event to
    /// that session only.
    pub fn handle_observer_message(&self, session_id: Uuid, text: &str) {
        let command: Command = match serde_json::from_str(text) {
            Ok(c) => c,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Malformed observer message");
                self.engine
                    .report_error(session_id, format!("Invalid message: {e}"));
                return;
            }
        };
        debug!(session_id = %session_id, ?command, "Routing observer command");
        self.engine.dispatch(session_id, command);
    }

    /// Handle one text frame from a worker link. Undecodable reports are logged and dropped.
    pub fn handle_worker_message(&self, agent_id: Uuid, text: &str) {
        match serde_json::from_str::<WorkerReport>(text) {
            Ok(report) => self.engine.worker_report(agent_id, report),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "Malformed worker report ignored");
            }
        }
    }
}

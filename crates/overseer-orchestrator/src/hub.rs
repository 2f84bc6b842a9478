use crate::protocol::ServerEvent;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connected observer sessions and their outbound queues.
///
/// Delivery never waits: a session whose queue is full or whose receiver is gone
/// is dropped, and the ids of dropped sessions are returned so that the caller can
/// clear anything else keyed by them.
pub struct Hub {
    sessions: HashMap<Uuid, mpsc::Sender<ServerEvent>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub fn register(&mut self, session_id: Uuid, tx: mpsc::Sender<ServerEvent>) {
        self.sessions.insert(session_id, tx);
        info!(session_id = %session_id, "Observer session registered");
    }

    pub fn remove(&mut self, session_id: Uuid) -> bool {
        let removed = self.sessions.remove(&session_id).is_some();
        if removed {
            info!(session_id = %session_id, "Observer session removed");
        }
        removed
    }

    /// Drop every session, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        if count > 0 {
            info!(count, "All observer sessions removed");
        }
        count
    }

    pub fn contains(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Send to one session. Returns false (and drops the session) on failure.
    pub fn send_to(&mut self, session_id: Uuid, event: ServerEvent) -> bool {
        let Some(tx) = self.sessions.get(&session_id) else {
            debug!(session_id = %session_id, "Send to unknown session ignored");
            return false;
        };
        if let Err(e) = tx.try_send(event) {
            warn!(session_id = %session_id, error = %e, "Dropping slow or closed observer");
            self.sessions.remove(&session_id);
            return false;
        }
        true
    }

    /// Send to every session, returning the ids that had to be dropped.
    pub fn broadcast(&mut self, event: &ServerEvent) -> Vec<Uuid> {
        let mut dropped = Vec::new();
        for (id, tx) in &self.sessions {
            if let Err(e) = tx.try_send(event.clone()) {
                warn!(session_id = %id, error = %e, "Dropping slow or closed observer");
                dropped.push(*id);
            }
        }
        for id in &dropped {
            self.sessions.remove(id);
        }
        dropped
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::AssignmentMode;

    fn mode_event() -> ServerEvent {
        ServerEvent::ModeUpdate {
            mode: AssignmentMode::Auto,
        }
    }

    #[test]
    fn test_broadcast_reaches_every_session() {
        let mut hub = Hub::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        hub.register(Uuid::new_v4(), tx1);
        hub.register(Uuid::new_v4(), tx2);

        assert!(hub.broadcast(&mode_event()).is_empty());
        assert_eq!(rx1.try_recv().unwrap().kind(), "mode_update");
        assert_eq!(rx2.try_recv().unwrap().kind(), "mode_update");
    }

    #[test]
    fn test_full_queue_drops_session() {
        let mut hub = Hub::new();
        let slow = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(1);
        hub.register(slow, tx);

        assert!(hub.broadcast(&mode_event()).is_empty());
        assert_eq!(hub.broadcast(&mode_event()), vec![slow]);
        assert!(!hub.contains(slow));
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn test_closed_receiver_drops_session() {
        let mut hub = Hub::new();
        let gone = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(4);
        hub.register(gone, tx);
        drop(rx);

        assert!(!hub.send_to(gone, mode_event()));
        assert!(!hub.contains(gone));
    }
}

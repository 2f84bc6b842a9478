use std::collections::HashMap;
use uuid::Uuid;

/// Which observer sessions follow the output of which task.
///
/// Routing is by exact task id. Subscribers of a task are kept in subscription order.
#[derive(Default)]
pub struct ProgressMux {
    subscribers: HashMap<Uuid, Vec<Uuid>>,
}

impl ProgressMux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `session_id` to `task_id`. Subscribing twice is a no-op.
    pub fn subscribe(&mut self, task_id: Uuid, session_id: Uuid) {
        let sessions = self.subscribers.entry(task_id).or_default();
        if !sessions.contains(&session_id) {
            sessions.push(session_id);
        }
    }

    /// Returns true if the subscription existed.
    pub fn unsubscribe(&mut self, task_id: Uuid, session_id: Uuid) -> bool {
        let Some(sessions) = self.subscribers.get_mut(&task_id) else {
            return false;
        };
        let before = sessions.len();
        sessions.retain(|s| *s != session_id);
        let removed = sessions.len() != before;
        if sessions.is_empty() {
            self.subscribers.remove(&task_id);
        }
        removed
    }

    /// Drop every subscription held by a session.
    pub fn remove_session(&mut self, session_id: Uuid) {
        self.subscribers.retain(|_, sessions| {
            sessions.retain(|s| *s != session_id);
            !sessions.is_empty()
        });
    }

    /// Drop every subscription to a task.
    pub fn remove_task(&mut self, task_id: Uuid) {
        self.subscribers.remove(&task_id);
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub fn subscribers(&self, task_id: Uuid) -> &[Uuid] {
        self.subscribers
            .get(&task_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_is_idempotent_and_ordered() {
        let mut mux = ProgressMux::new();
        let task = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        mux.subscribe(task, a);
        mux.subscribe(task, b);
        mux.subscribe(task, a);
        assert_eq!(mux.subscribers(task), &[a, b]);
    }

    #[test]
    fn test_routing_is_exact() {
        let mut mux = ProgressMux::new();
        let task = Uuid::new_v4();
        let session = Uuid::new_v4();
        mux.subscribe(task, session);
        assert!(mux.subscribers(Uuid::new_v4()).is_empty());
    }

    #[test]
    fn test_unsubscribe_and_cleanup() {
        let mut mux = ProgressMux::new();
        let (t1, t2) = (Uuid::new_v4(), Uuid::new_v4());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        mux.subscribe(t1, a);
        mux.subscribe(t1, b);
        mux.subscribe(t2, a);

        assert!(mux.unsubscribe(t1, b));
        assert!(!mux.unsubscribe(t1, b));

        mux.remove_session(a);
        assert!(mux.subscribers(t1).is_empty());
        assert!(mux.subscribers(t2).is_empty());

        mux.subscribe(t2, b);
        mux.remove_task(t2);
        assert!(mux.subscribers(t2).is_empty());
    }
}

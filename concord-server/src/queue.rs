//! Offline delivery queue: per-user pending messages, drained when the
//! user reconnects.
//!
//! Unbounded for now. TODO: cap per-user queues and drop oldest once the
//! client backlog protocol settles.

use std::collections::HashMap;

use parking_lot::Mutex;

pub struct MessageQueue<M> {
    pending: Mutex<HashMap<String, Vec<M>>>,
}

impl<M> MessageQueue<M> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Append a message to the user's inbox.
    pub fn enqueue(&self, user: &str, message: M) {
        self.pending
            .lock()
            .entry(user.to_string())
            .or_default()
            .push(message);
    }

    /// Take everything pending for the user in one atomic swap.
    pub fn drain(&self, user: &str) -> Vec<M> {
        self.pending.lock().remove(user).unwrap_or_default()
    }

    /// Number of messages waiting for the user.
    pub fn pending(&self, user: &str) -> usize {
        self.pending.lock().get(user).map_or(0, Vec::len)
    }
}

impl<M> Default for MessageQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

//! Capped in-memory session store
//!
//! Holds the most recent captured sessions, newest first, de-duplicated by
//! id. WebSocket sessions are written twice (at upgrade and at completion),
//! so insertion is an upsert: an existing id is replaced in place and keeps
//! its position in the insertion order.

use crate::models::CapturedSession;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Maximum number of retained sessions.
pub const SESSION_CAPACITY: usize = 500;

pub struct SessionStore {
    capacity: usize,
    inner: Mutex<VecDeque<CapturedSession>>,
    events: broadcast::Sender<CapturedSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_capacity(SESSION_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(512);
        Self {
            capacity,
            inner: Mutex::new(VecDeque::new()),
            events,
        }
    }

    /// Insert or update a session. New sessions go to the front; the oldest
    /// entry is evicted once the cap is exceeded.
    pub fn upsert(&self, session: CapturedSession) {
        {
            let mut sessions = self.inner.lock().expect("session store lock poisoned");
            if let Some(existing) = sessions.iter_mut().find(|s| s.id == session.id) {
                *existing = session.clone();
            } else {
                sessions.push_front(session.clone());
                while sessions.len() > self.capacity {
                    sessions.pop_back();
                }
            }
        }
        let _ = self.events.send(session);
    }

    /// Snapshot of all retained sessions, most recent first.
    pub fn snapshot(&self) -> Vec<CapturedSession> {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<CapturedSession> {
        self.inner
            .lock()
            .expect("session store lock poisoned")
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().expect("session store lock poisoned").clear();
    }

    /// Observe sessions as they are appended or updated.
    pub fn subscribe(&self) -> broadcast::Receiver<CapturedSession> {
        self.events.subscribe()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

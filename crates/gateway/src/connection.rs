//! Connection manager: owns the socket-session → outbound-channel map.
//!
//! Each accepted socket gets a writer task draining an mpsc channel into
//! the WebSocket sink, so frames from concurrent turn tasks serialize
//! through one write path per connection. A failed send means the
//! connection is dead — the session is silently dropped.

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use weft_domain::frame::Frame;

pub struct ConnectionManager {
    connections: RwLock<HashMap<String, mpsc::Sender<Frame>>>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Track a new socket session.
    pub fn register(&self, session_id: &str, sender: mpsc::Sender<Frame>) {
        self.connections
            .write()
            .insert(session_id.to_owned(), sender);
        tracing::info!(session_id, total = self.count(), "websocket connected");
    }

    /// Send a frame to a session. On failure the session is disconnected.
    pub async fn send(&self, session_id: &str, frame: Frame) -> bool {
        let sender = match self.connections.read().get(session_id) {
            Some(s) => s.clone(),
            None => return false,
        };
        if sender.send(frame).await.is_err() {
            tracing::warn!(session_id, "send failed, disconnecting session");
            self.remove(session_id);
            return false;
        }
        true
    }

    /// The outbound channel for a session, for handing to a turn task.
    pub fn sender(&self, session_id: &str) -> Option<mpsc::Sender<Frame>> {
        self.connections.read().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &str) {
        if self.connections.write().remove(session_id).is_some() {
            tracing::info!(session_id, total = self.count(), "websocket disconnected");
        }
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }
}

//! In-memory registry of live WebSocket sessions
//!
//! Maps an identity (user or printer UUID) to its active sessions. Multiple
//! concurrent sessions per identity are allowed (web + mobile, or a printer
//! reconnecting before its old socket times out). The registry is the only
//! component that writes to sockets: every session owns one mpsc channel
//! consumed by a single writer task, which serializes frame writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::CoreError;
use crate::wire::ServerFrame;

/// Handle to one session's serialized write path
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    tx: mpsc::Sender<String>,
    send_timeout: Duration,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a frame on this session's write path
    ///
    /// A full queue past the send timeout or a closed channel counts as a
    /// delivery failure.
    pub async fn send(&self, frame: &ServerFrame) -> Result<(), CoreError> {
        let text = serde_json::to_string(frame)
            .map_err(|e| CoreError::SendFailed(format!("frame encoding: {e}")))?;
        self.send_text(text).await
    }

    async fn send_text(&self, text: String) -> Result<(), CoreError> {
        self.tx
            .send_timeout(text, self.send_timeout)
            .await
            .map_err(|e| CoreError::SendFailed(e.to_string()))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Registry of active sessions keyed by identity
#[derive(Debug)]
pub struct ConnectionRegistry {
    sessions: RwLock<HashMap<Uuid, Vec<SessionHandle>>>,
    next_session_id: AtomicU64,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            send_timeout,
        }
    }

    /// Register a session under an identity and return its handle
    pub async fn attach(&self, identity: Uuid, tx: mpsc::Sender<String>) -> SessionHandle {
        let handle = SessionHandle {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            tx,
            send_timeout: self.send_timeout,
        };

        let mut sessions = self.sessions.write().await;
        sessions.entry(identity).or_default().push(handle.clone());
        debug!(%identity, session = handle.id, "Session attached");
        handle
    }

    /// Remove a session; returns true when it was the identity's last one
    pub async fn detach(&self, identity: Uuid, session_id: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(list) = sessions.get_mut(&identity) else {
            return false;
        };
        list.retain(|s| s.id != session_id);
        debug!(%identity, session = session_id, "Session detached");

        if list.is_empty() {
            sessions.remove(&identity);
            true
        } else {
            false
        }
    }

    /// Deliver a frame to every active session of an identity
    ///
    /// Returns the number of sessions the frame was handed to. Sessions whose
    /// write path is gone are pruned along the way.
    pub async fn broadcast(&self, identity: Uuid, frame: &ServerFrame) -> usize {
        let text = match serde_json::to_string(frame) {
            Ok(text) => text,
            Err(e) => {
                debug!(%identity, error = %e, "Failed to encode frame for broadcast");
                return 0;
            }
        };

        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            match sessions.get(&identity) {
                Some(list) => list.clone(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dead: Vec<u64> = Vec::new();
        for handle in &handles {
            match handle.send_text(text.clone()).await {
                Ok(()) => delivered += 1,
                Err(_) if handle.is_closed() => dead.push(handle.id),
                Err(_) => {}
            }
        }

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().await;
            if let Some(list) = sessions.get_mut(&identity) {
                list.retain(|s| !dead.contains(&s.id));
                if list.is_empty() {
                    sessions.remove(&identity);
                }
            }
        }

        delivered
    }

    pub async fn is_connected(&self, identity: Uuid) -> bool {
        let sessions = self.sessions.read().await;
        sessions.get(&identity).is_some_and(|list| !list.is_empty())
    }

    pub async fn session_count(&self, identity: Uuid) -> usize {
        let sessions = self.sessions.read().await;
        sessions.get(&identity).map_or(0, |list| list.len())
    }

    /// Identities with at least one live session
    pub async fn connected_identities(&self) -> Vec<Uuid> {
        let sessions = self.sessions.read().await;
        sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::StatusLevel;

    fn frame() -> ServerFrame {
        ServerFrame::status(StatusLevel::Info, "ping")
    }

    #[tokio::test]
    async fn test_attach_detach() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let identity = Uuid::new_v4();
        let (tx, _rx) = mpsc::channel(8);

        let handle = registry.attach(identity, tx).await;
        assert!(registry.is_connected(identity).await);
        assert_eq!(registry.session_count(identity).await, 1);

        assert!(registry.detach(identity, handle.id()).await);
        assert!(!registry.is_connected(identity).await);
    }

    #[tokio::test]
    async fn test_multiple_sessions_per_identity() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        let identity = Uuid::new_v4();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);

        let h1 = registry.attach(identity, tx1).await;
        let h2 = registry.attach(identity, tx2).await;

        assert_eq!(registry.broadcast(identity, &frame()).await, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx2.recv().await.is_some());

        // Detaching one session is not final
        assert!(!registry.detach(identity, h1.id()).await);
        assert!(registry.is_connected(identity).await);
        assert!(registry.detach(identity, h2.id()).await);
    }

    #[tokio::test]
    async fn test_broadcast_to_absent_identity() {
        let registry = ConnectionRegistry::new(Duration::from_secs(1));
        assert_eq!(registry.broadcast(Uuid::new_v4(), &frame()).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_prunes_closed_sessions() {
        let registry = ConnectionRegistry::new(Duration::from_millis(50));
        let identity = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(8);

        registry.attach(identity, tx).await;
        drop(rx);

        assert_eq!(registry.broadcast(identity, &frame()).await, 0);
        assert!(!registry.is_connected(identity).await);
    }

    #[tokio::test]
    async fn test_session_send_failure_on_closed_channel() {
        let registry = ConnectionRegistry::new(Duration::from_millis(50));
        let (tx, rx) = mpsc::channel(1);
        let handle = registry.attach(Uuid::new_v4(), tx).await;
        drop(rx);

        assert!(handle.send(&frame()).await.is_err());
    }
}

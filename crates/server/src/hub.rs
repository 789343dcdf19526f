use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

use shared::{domain::UserId, protocol::ServerFrame};
use tokio::sync::{mpsc, RwLock};

struct Session {
    seq: u64,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

/// Outbound queue handed to a freshly registered connection.
pub(crate) struct Registration {
    pub(crate) seq: u64,
    pub(crate) rx: mpsc::UnboundedReceiver<ServerFrame>,
}

/// Live connections, one per user. Registering again replaces the previous
/// connection; its queue closes, which ends that socket.
pub(crate) struct Hub {
    sessions: RwLock<HashMap<UserId, Session>>,
    seq: AtomicU64,
}

impl Hub {
    pub(crate) fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(1),
        }
    }

    pub(crate) async fn register(&self, user_id: UserId) -> Registration {
        let (tx, rx) = mpsc::unbounded_channel();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let replaced = self
            .sessions
            .write()
            .await
            .insert(user_id, Session { seq, tx });
        if let Some(old) = replaced {
            tracing::info!(user_id = user_id.0, old_seq = old.seq, seq, "replacing existing connection");
        }
        Registration { seq, rx }
    }

    /// Removes the entry only if it still belongs to connection `seq`.
    pub(crate) async fn unregister(&self, user_id: UserId, seq: u64) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&user_id) {
            Some(session) if session.seq == seq => {
                sessions.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    /// Queues a frame for the user's live connection. Returns `false` if the
    /// user is offline.
    pub(crate) async fn deliver(&self, user_id: UserId, frame: ServerFrame) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(&user_id)
            .is_some_and(|session| session.tx.send(frame).is_ok())
    }

    /// Queues a frame only if connection `seq` is still the registered one.
    pub(crate) async fn deliver_to_session(&self, user_id: UserId, seq: u64, frame: ServerFrame) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(&user_id)
            .filter(|session| session.seq == seq)
            .is_some_and(|session| session.tx.send(frame).is_ok())
    }

    pub(crate) async fn is_online(&self, user_id: UserId) -> bool {
        self.sessions.read().await.contains_key(&user_id)
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;

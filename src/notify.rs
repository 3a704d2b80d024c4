use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// One message on a session's change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A committed mutation touching this session.
    Change(Event),
    /// The lock cutoff passed; voluntary leaves are closed.
    Locked,
}

/// Broadcast hub for LISTEN/NOTIFY per session.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a session's feed. Creates the channel if needed.
    pub fn subscribe(&self, session_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, session_id: Ulid, notice: &Notice) {
        if let Some(sender) = self.channels.get(&session_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Remove a channel (when the session is deleted).
    pub fn remove(&self, session_id: &Ulid) {
        self.channels.remove(session_id);
    }
}

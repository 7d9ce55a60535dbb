use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use super::SessionInbox;
use crate::error::TunnelError;
use crate::proto::{IceCandidate, SessionDescription};

struct SessionEntry {
    descriptions: Option<mpsc::Sender<SessionDescription>>,
    candidates: Option<mpsc::UnboundedSender<IceCandidate>>,
    inbox: Option<SessionInbox>,
    closed: bool,
}

impl SessionEntry {
    fn new() -> Self {
        // One pending description per session; candidates trickle in unbounded.
        let (desc_tx, desc_rx) = mpsc::channel(1);
        let (cand_tx, cand_rx) = mpsc::unbounded_channel();
        Self {
            descriptions: Some(desc_tx),
            candidates: Some(cand_tx),
            inbox: Some(SessionInbox {
                descriptions: desc_rx,
                candidates: cand_rx,
            }),
            closed: false,
        }
    }
}

/// Per-session queues shared by every signaling binding.
///
/// Entries are created on first reference. Closing drops both senders once and
/// keeps a tombstone for `grace` so in-flight deliveries are discarded rather
/// than recreating the session.
pub(crate) struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    grace: Duration,
}

impl SessionRegistry {
    pub(crate) fn new(grace: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            grace,
        }
    }

    /// Returns `true` when this call created the session.
    pub(crate) fn ensure(&self, id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(id) {
            return false;
        }
        sessions.insert(id.to_string(), SessionEntry::new());
        true
    }

    /// Known sessions, including closed ones still inside their grace period.
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub(crate) fn open_sessions(&self) -> Vec<String> {
        self.sessions
            .lock()
            .iter()
            .filter(|(_, entry)| !entry.closed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn take_inbox(&self, id: &str) -> Result<SessionInbox, TunnelError> {
        let mut sessions = self.sessions.lock();
        let entry = sessions
            .entry(id.to_string())
            .or_insert_with(SessionEntry::new);
        if entry.closed {
            return Err(TunnelError::Closed("session"));
        }
        entry
            .inbox
            .take()
            .ok_or_else(|| TunnelError::NotFound(format!("queues of session {id} already taken")))
    }

    pub(crate) fn deliver_description(&self, id: &str, desc: SessionDescription) -> bool {
        let sessions = self.sessions.lock();
        let Some(sender) = sessions.get(id).and_then(|entry| entry.descriptions.as_ref()) else {
            tracing::trace!(target = "tunnel", session = id, "dropping description for unknown session");
            return false;
        };
        match sender.try_send(desc) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(target = "tunnel", session = id, "session already has a pending description");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn deliver_candidate(&self, id: &str, candidate: IceCandidate) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(id).and_then(|entry| entry.candidates.as_ref()) {
            Some(sender) => sender.send(candidate).is_ok(),
            None => {
                tracing::trace!(target = "tunnel", session = id, "dropping candidate for unknown session");
                false
            }
        }
    }

    /// Closes the session's queues. Returns `false` if it was already closed
    /// or never existed.
    pub(crate) fn close(&self, id: &str) -> bool {
        {
            let mut sessions = self.sessions.lock();
            let Some(entry) = sessions.get_mut(id) else {
                return false;
            };
            if entry.closed {
                return false;
            }
            entry.closed = true;
            entry.descriptions = None;
            entry.candidates = None;
            entry.inbox = None;
        }
        self.schedule_removal(id.to_string());
        true
    }

    pub(crate) fn close_all(&self) {
        let ids: Vec<String> = self.open_sessions();
        for id in ids {
            self.close(&id);
        }
    }

    fn schedule_removal(&self, id: String) {
        let sessions = Arc::clone(&self.sessions);
        let remove = move || {
            let mut sessions = sessions.lock();
            if sessions.get(&id).is_some_and(|entry| entry.closed) {
                sessions.remove(&id);
            }
        };
        match Handle::try_current() {
            Ok(handle) => {
                let grace = self.grace;
                handle.spawn(async move {
                    tokio::time::sleep(grace).await;
                    remove();
                });
            }
            Err(_) => remove(),
        }
    }
}

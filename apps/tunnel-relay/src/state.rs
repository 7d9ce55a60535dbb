//! Session store for the polling endpoints and client registry for the duplex
//! endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};
use transport_tunnel::proto::{FetchResponse, IceCandidate, SdpType, SessionDescription};

use crate::config::Config;

/// `(service name, session id)`.
type SessionKey = (String, String);

#[derive(Debug)]
struct Session {
    offer: Option<SessionDescription>,
    answer: Option<SessionDescription>,
    /// Candidates published by the initiator, waiting for the responder.
    offer_ices: Vec<IceCandidate>,
    /// Candidates published by the responder, waiting for the initiator.
    answer_ices: Vec<IceCandidate>,
    touched: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            offer: None,
            answer: None,
            offer_ices: Vec::new(),
            answer_ices: Vec::new(),
            touched: Instant::now(),
        }
    }

    /// Takes what is pending for a fetcher on `side`.
    fn take_for(&mut self, side: SdpType) -> (Option<SessionDescription>, Vec<IceCandidate>) {
        self.touched = Instant::now();
        match side {
            SdpType::Offer => (self.answer.take(), std::mem::take(&mut self.answer_ices)),
            SdpType::Answer => (self.offer.take(), std::mem::take(&mut self.offer_ices)),
        }
    }
}

/// A duplex client: its side and the queue its socket writer drains.
#[derive(Clone)]
pub(crate) struct DuplexClient {
    pub(crate) side: SdpType,
    pub(crate) tx: mpsc::UnboundedSender<String>,
}

#[derive(Clone)]
pub struct RelayState {
    inner: Arc<StateInner>,
}

struct StateInner {
    config: Config,
    sessions: DashMap<SessionKey, Session>,
    /// Bumped on every publish so waiting fetches re-check.
    changes: watch::Sender<u64>,
    /// Duplex clients keyed by `(service, client id)`.
    clients: DashMap<(String, String), DuplexClient>,
    /// Responder chosen for each duplex session, keyed by `(service, session id)`.
    routes: DashMap<SessionKey, String>,
}

impl RelayState {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(StateInner {
                config,
                sessions: DashMap::new(),
                changes: watch::channel(0).0,
                clients: DashMap::new(),
                routes: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Drops idle sessions every `ttl / 4` until the state is dropped.
    pub fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = (self.inner.config.session_ttl / 4).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let ttl = inner.config.session_ttl;
                let before = inner.sessions.len();
                inner.sessions.retain(|_, session| session.touched.elapsed() < ttl);
                let reaped = before.saturating_sub(inner.sessions.len());
                if reaped > 0 {
                    info!(reaped, "expired idle sessions");
                }
            }
        })
    }

    pub fn publish_description(&self, name: &str, id: &str, desc: SessionDescription) {
        {
            let mut session = self.session(name, id);
            match desc.sdp_type {
                SdpType::Offer => session.offer = Some(desc),
                SdpType::Answer => session.answer = Some(desc),
            }
        }
        self.bump();
    }

    /// `from` is the publisher's side.
    pub fn publish_candidate(&self, name: &str, id: &str, from: SdpType, ice: IceCandidate) {
        {
            let mut session = self.session(name, id);
            match from {
                SdpType::Offer => session.offer_ices.push(ice),
                SdpType::Answer => session.answer_ices.push(ice),
            }
        }
        self.bump();
    }

    /// Waits up to the configured window for material addressed to a fetcher
    /// on `side`. Without an id, an answer-side fetch picks a session of the
    /// service whose offer nobody has taken yet.
    pub async fn fetch(&self, name: &str, side: SdpType, id: Option<&str>) -> Option<FetchResponse> {
        let mut changes = self.inner.changes.subscribe();
        let deadline = tokio::time::Instant::now() + self.inner.config.fetch_wait;
        loop {
            changes.borrow_and_update();
            if let Some(response) = self.try_take(name, side, id) {
                return Some(response);
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return None,
            }
        }
    }

    fn try_take(&self, name: &str, side: SdpType, id: Option<&str>) -> Option<FetchResponse> {
        let id = match id {
            Some(id) => id.to_string(),
            None if side == SdpType::Answer => self
                .inner
                .sessions
                .iter()
                .find(|entry| entry.key().0 == name && entry.value().offer.is_some())
                .map(|entry| entry.key().1.clone())?,
            None => return None,
        };
        let mut session = self.inner.sessions.get_mut(&(name.to_string(), id.clone()))?;
        let (sdp, ices) = session.take_for(side);
        let response = FetchResponse { id, sdp, ices };
        if response.is_empty() {
            return None;
        }
        Some(response)
    }

    /// Returns whether the session existed.
    pub fn remove_session(&self, name: &str, id: &str) -> bool {
        let key = (name.to_string(), id.to_string());
        self.inner.routes.remove(&key);
        let removed = self.inner.sessions.remove(&key).is_some();
        debug!(name, id, removed, "session offline");
        removed
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    fn session(&self, name: &str, id: &str) -> dashmap::mapref::one::RefMut<'_, SessionKey, Session> {
        let mut session = self
            .inner
            .sessions
            .entry((name.to_string(), id.to_string()))
            .or_insert_with(Session::new);
        session.touched = Instant::now();
        session
    }

    fn bump(&self) {
        self.inner.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    pub(crate) fn register_client(&self, name: &str, client_id: &str, client: DuplexClient) {
        self.inner
            .clients
            .insert((name.to_string(), client_id.to_string()), client);
    }

    pub(crate) fn unregister_client(&self, name: &str, client_id: &str) {
        self.inner
            .clients
            .remove(&(name.to_string(), client_id.to_string()));
        self.inner
            .routes
            .retain(|key, responder| !(key.0 == name && responder == client_id));
    }

    pub(crate) fn client(&self, name: &str, client_id: &str) -> Option<DuplexClient> {
        self.inner
            .clients
            .get(&(name.to_string(), client_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// The responder serving a duplex session, chosen on first use.
    pub(crate) fn route_to_responder(&self, name: &str, session: &str) -> Option<String> {
        let key = (name.to_string(), session.to_string());
        if let Some(existing) = self.inner.routes.get(&key) {
            if self.client(name, existing.value()).is_some() {
                return Some(existing.value().clone());
            }
        }
        let responder = self
            .inner
            .clients
            .iter()
            .find(|entry| entry.key().0 == name && entry.value().side == SdpType::Answer)
            .map(|entry| entry.key().1.clone())?;
        self.inner.routes.insert(key, responder.clone());
        Some(responder)
    }

    /// Connected duplex responders of a service.
    pub fn responder_count(&self, name: &str) -> usize {
        self.inner
            .clients
            .iter()
            .filter(|entry| entry.key().0 == name && entry.value().side == SdpType::Answer)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(wait_ms: u64) -> RelayState {
        RelayState::new(Config {
            fetch_wait: Duration::from_millis(wait_ms),
            ..Config::default()
        })
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn anonymous_fetch_claims_offer_once() {
        let state = state(20);
        state.publish_description("n", "s1", SessionDescription::offer("o"));
        let first = state.fetch("n", SdpType::Answer, None).await.expect("offer");
        assert_eq!(first.id, "s1");
        assert_eq!(first.sdp.map(|d| d.sdp).as_deref(), Some("o"));
        assert!(state.fetch("n", SdpType::Answer, None).await.is_none());
        assert!(state.fetch("other", SdpType::Answer, None).await.is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn fetch_wakes_on_publish() {
        let state = state(2_000);
        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.fetch("n", SdpType::Offer, Some("s1")).await })
        };
        tokio::task::yield_now().await;
        state.publish_candidate(
            "n",
            "s1",
            SdpType::Answer,
            IceCandidate {
                candidate: "c".into(),
                sdp_mid: None,
                sdp_mline_index: None,
                username_fragment: None,
            },
        );
        let response = waiter.await.expect("join").expect("candidates");
        assert_eq!(response.ices.len(), 1);
        assert!(response.sdp.is_none());
    }

    #[test_timeout::tokio_timeout_test(5)]
    async fn reaper_drops_idle_sessions() {
        let state = RelayState::new(Config {
            session_ttl: Duration::from_millis(200),
            ..Config::default()
        });
        let reaper = state.spawn_reaper();
        state.publish_description("n", "s1", SessionDescription::offer("o"));
        assert_eq!(state.session_count(), 1);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(state.session_count(), 0);
        reaper.abort();
    }
}

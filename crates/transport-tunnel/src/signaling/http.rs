use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{SessionInbox, SessionRegistry, Signaling, endpoint};
use crate::config::SignalingConfig;
use crate::error::{TunnelError, to_signaling_error};
use crate::proto::{
    FetchQuery, FetchResponse, IceCandidate, OfflineQuery, PostCandidateRequest, PostSdpRequest,
    SdpType, SessionDescription,
};

/// Polling binding: every tick fetches pending material for each open session
/// and, on a responder, once more without a session id to discover new
/// initiators.
pub struct HttpSignaling {
    inner: Arc<HttpInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct HttpInner {
    client: Client,
    base: String,
    service: String,
    identity: String,
    side: SdpType,
    registry: SessionRegistry,
    incoming_tx: mpsc::UnboundedSender<String>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    cancel: CancellationToken,
}

impl HttpSignaling {
    pub fn connect(
        config: &SignalingConfig,
        service: &str,
        side: SdpType,
    ) -> Result<Arc<Self>, TunnelError> {
        url::Url::parse(&config.url)
            .map_err(|err| TunnelError::Parse(format!("invalid signaling url {}: {err}", config.url)))?;
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(HttpInner {
            client: Client::new(),
            base: config.url.trim_end_matches('/').to_string(),
            service: service.to_string(),
            identity: Uuid::new_v4().to_string(),
            side,
            registry: SessionRegistry::new(config.session_grace),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            cancel: CancellationToken::new(),
        });

        let poller = Arc::clone(&inner);
        let interval = config.poll_interval;
        let handle = tokio::spawn(async move {
            poller.run_poll_loop(interval).await;
        });

        Ok(Arc::new(Self {
            inner,
            tasks: Mutex::new(vec![handle]),
        }))
    }
}

impl HttpInner {
    async fn run_poll_loop(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let mut targets: Vec<Option<String>> =
                self.registry.open_sessions().into_iter().map(Some).collect();
            if self.side == SdpType::Answer {
                targets.insert(0, None);
            }
            let fetches = targets
                .into_iter()
                .map(|id| self.fetch_and_dispatch(id));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = join_all(fetches) => {}
            }
        }
        tracing::debug!(target = "tunnel", service = %self.service, "signaling poll loop stopped");
    }

    async fn fetch_and_dispatch(&self, id: Option<String>) {
        match self.fetch(id.as_deref()).await {
            Ok(Some(response)) => self.dispatch(response),
            Ok(None) => {
                tracing::trace!(target = "tunnel", session = ?id, "nothing pending");
            }
            Err(err) => {
                tracing::warn!(
                    target = "tunnel",
                    service = %self.service,
                    session = ?id,
                    error = %err,
                    "signaling fetch failed; retrying"
                );
            }
        }
    }

    async fn fetch(&self, id: Option<&str>) -> Result<Option<FetchResponse>, TunnelError> {
        let query = FetchQuery {
            name: self.service.clone(),
            sdp_type: self.side,
            id: id.map(str::to_string),
        };
        let response = self
            .client
            .get(endpoint(&self.base, "api/fetch"))
            .query(&query)
            .send()
            .await
            .map_err(to_signaling_error)?;

        match response.status() {
            StatusCode::OK => {
                let payload = response
                    .json::<FetchResponse>()
                    .await
                    .map_err(|err| TunnelError::Parse(err.to_string()))?;
                Ok(Some(payload))
            }
            StatusCode::NON_AUTHORITATIVE_INFORMATION => Ok(None),
            status => Err(TunnelError::Signaling(format!(
                "unexpected fetch status {status}"
            ))),
        }
    }

    fn dispatch(&self, response: FetchResponse) {
        let FetchResponse { id, sdp, ices } = response;
        if id.is_empty() {
            return;
        }
        if self.side == SdpType::Answer && !self.registry.contains(&id) {
            if sdp.is_none() {
                tracing::debug!(target = "tunnel", session = %id, "candidates for unknown session");
                return;
            }
            self.registry.ensure(&id);
            tracing::debug!(target = "tunnel", session = %id, "incoming session");
            let _ = self.incoming_tx.send(id.clone());
        }
        if let Some(desc) = sdp {
            self.registry.deliver_description(&id, desc);
        }
        for candidate in ices {
            self.registry.deliver_candidate(&id, candidate);
        }
    }

    async fn post_json<T: Serialize>(&self, suffix: &str, body: &T) -> Result<(), TunnelError> {
        let response = self
            .client
            .post(endpoint(&self.base, suffix))
            .json(body)
            .send()
            .await
            .map_err(to_signaling_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TunnelError::Signaling(format!(
                "unexpected signaling status {}",
                response.status()
            )))
        }
    }
}

#[async_trait]
impl Signaling for HttpSignaling {
    fn identity(&self) -> &str {
        &self.inner.identity
    }

    fn service(&self) -> &str {
        &self.inner.service
    }

    async fn send_description(
        &self,
        session_id: &str,
        desc: SessionDescription,
    ) -> Result<(), TunnelError> {
        let body = PostSdpRequest {
            name: self.inner.service.clone(),
            id: session_id.to_string(),
            sdp: desc,
        };
        self.inner.post_json("api/sdp", &body).await
    }

    async fn send_candidate(
        &self,
        session_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), TunnelError> {
        let body = PostCandidateRequest {
            name: self.inner.service.clone(),
            id: session_id.to_string(),
            sdp_type: self.inner.side,
            ice: candidate,
        };
        self.inner.post_json("api/candidate", &body).await
    }

    fn open_session(&self, session_id: &str) -> Result<SessionInbox, TunnelError> {
        self.inner.registry.take_inbox(session_id)
    }

    async fn notify_offline(&self, session_id: &str) -> Result<(), TunnelError> {
        self.inner.registry.close(session_id);
        let query = OfflineQuery {
            name: self.inner.service.clone(),
            id: session_id.to_string(),
        };
        let response = self
            .inner
            .client
            .head(endpoint(&self.inner.base, "api/offline"))
            .query(&query)
            .send()
            .await
            .map_err(to_signaling_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(TunnelError::Signaling(format!(
                "unexpected offline status {}",
                response.status()
            )))
        }
    }

    fn incoming_sessions(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        if self.inner.side != SdpType::Answer {
            return None;
        }
        self.inner.incoming_rx.lock().take()
    }

    fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.registry.close_all();
    }
}

impl Drop for HttpSignaling {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

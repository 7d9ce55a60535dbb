//! Rendezvous signaling: moves descriptions and candidates between two named
//! parties through a relay and fans them into per-session queues.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{SignalingConfig, SignalingMode};
use crate::error::TunnelError;
use crate::proto::{IceCandidate, SdpType, SessionDescription};

mod http;
mod memory;
mod session;
mod ws;

pub use self::http::HttpSignaling;
pub use self::memory::{MemoryRelay, MemorySignaling};
pub use self::ws::WsSignaling;

pub(crate) use self::session::SessionRegistry;

/// Remote material for one session: descriptions and reachability candidates.
#[derive(Debug)]
pub struct SessionInbox {
    pub descriptions: mpsc::Receiver<SessionDescription>,
    pub candidates: mpsc::UnboundedReceiver<IceCandidate>,
}

#[async_trait]
pub trait Signaling: Send + Sync {
    /// Client id of this endpoint.
    fn identity(&self) -> &str;

    /// Service name both parties rendezvous under.
    fn service(&self) -> &str;

    async fn send_description(
        &self,
        session_id: &str,
        desc: SessionDescription,
    ) -> Result<(), TunnelError>;

    async fn send_candidate(
        &self,
        session_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), TunnelError>;

    /// Takes the remote description and candidate queues of a session,
    /// creating the session if needed. Each session's queues are handed out
    /// once.
    fn open_session(&self, session_id: &str) -> Result<SessionInbox, TunnelError>;

    async fn notify_offline(&self, session_id: &str) -> Result<(), TunnelError>;

    /// Ids of sessions started by remote initiators. Responders only; the
    /// queue is handed out once.
    fn incoming_sessions(&self) -> Option<mpsc::UnboundedReceiver<String>>;

    fn close(&self);
}

/// Connects the binding selected by `config.mode`. `side` is `Offer` for an
/// initiator and `Answer` for a responder.
pub fn connect(
    config: &SignalingConfig,
    service: &str,
    side: SdpType,
) -> Result<Arc<dyn Signaling>, TunnelError> {
    let signaling: Arc<dyn Signaling> = match config.mode {
        SignalingMode::Polling => HttpSignaling::connect(config, service, side)?,
        SignalingMode::Duplex => WsSignaling::connect(config, service, side)?,
    };
    tracing::debug!(
        target = "tunnel",
        service,
        side = side.as_str(),
        mode = ?config.mode,
        identity = signaling.identity(),
        "signaling connected"
    );
    Ok(signaling)
}

pub(crate) fn endpoint(base: &str, suffix: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), suffix)
}

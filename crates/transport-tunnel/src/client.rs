//! Dial side: one connected initiator peer per service, shared by every
//! channel dialed to that service.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;

use crate::channel::ChannelConn;
use crate::config::{PeerConfig, TunnelConfig};
use crate::error::TunnelError;
use crate::label::{ChannelKind, Label};
use crate::peer::Peer;
use crate::proto::SdpType;
use crate::rtc::RtcApi;
use crate::signaling::{self, Signaling};

/// Builds the initiator-side signaling endpoint for a service.
pub type SignalingConnector =
    Arc<dyn Fn(&str) -> Result<Arc<dyn Signaling>, TunnelError> + Send + Sync>;

pub struct TunnelClient {
    api: Arc<dyn RtcApi>,
    connector: SignalingConnector,
    config: PeerConfig,
    peers: Mutex<HashMap<String, Peer>>,
}

impl TunnelClient {
    /// A client that reaches services through the relay in `config`.
    pub fn new(api: Arc<dyn RtcApi>, config: &TunnelConfig) -> Self {
        let signaling_config = config.signaling.clone();
        let connector: SignalingConnector = Arc::new(move |service: &str| {
            signaling::connect(&signaling_config, service, SdpType::Offer)
        });
        Self::with_connector(api, connector, &config.peer)
    }

    pub fn with_connector(
        api: Arc<dyn RtcApi>,
        connector: SignalingConnector,
        config: &PeerConfig,
    ) -> Self {
        Self {
            api,
            connector,
            config: config.clone(),
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a channel of `kind` to `service`, connecting a peer first if
    /// there is none.
    pub async fn dial(&self, service: &str, kind: ChannelKind) -> Result<ChannelConn, TunnelError> {
        self.dial_label(service, kind, None).await
    }

    /// Like [`TunnelClient::dial`], asking for a specific label.
    pub async fn dial_label(
        &self,
        service: &str,
        kind: ChannelKind,
        label: Option<Label>,
    ) -> Result<ChannelConn, TunnelError> {
        let mut replaced = false;
        loop {
            let peer = self.peer(service).await?;
            match peer.get(kind, label).await {
                Err(TunnelError::Closed(_)) if !replaced => {
                    tracing::info!(target = "tunnel", service, "peer closed; reconnecting");
                    self.forget(service, &peer).await;
                    replaced = true;
                }
                result => return result,
            }
        }
    }

    async fn peer(&self, service: &str) -> Result<Peer, TunnelError> {
        // Held across the handshake so concurrent dials share one peer.
        let mut peers = self.peers.lock().await;
        if let Some(peer) = peers.get(service) {
            if !peer.is_closed() {
                return Ok(peer.clone());
            }
            peers.remove(service);
        }
        let signaling = (self.connector)(service)?;
        let peer = Peer::dial(self.api.as_ref(), Arc::clone(&signaling), &self.config)
            .await
            .inspect_err(|_| signaling.close())?;
        tracing::info!(target = "tunnel", service, session = peer.session_id(), "connected to service");
        peers.insert(service.to_string(), peer.clone());
        Ok(peer)
    }

    async fn forget(&self, service: &str, peer: &Peer) {
        let mut peers = self.peers.lock().await;
        if peers
            .get(service)
            .is_some_and(|current| current.session_id() == peer.session_id())
        {
            peers.remove(service);
        }
    }

    /// Services with a live peer.
    pub async fn services(&self) -> Vec<String> {
        let peers = self.peers.lock().await;
        let mut services: Vec<String> = peers
            .iter()
            .filter(|(_, peer)| !peer.is_closed())
            .map(|(service, _)| service.clone())
            .collect();
        services.sort();
        services
    }

    /// Closes every peer.
    pub async fn close(&self) {
        let peers: Vec<Peer> = self.peers.lock().await.drain().map(|(_, peer)| peer).collect();
        join_all(peers.iter().map(|peer| peer.close())).await;
    }
}

//! Accept side of a tunnel service.
//!
//! A [`Listener`] answers every session its signaling endpoint announces with
//! a responder [`Peer`], and fans the channels those peers accept into one
//! bounded queue per kind. Servers for each kind call [`Listener::accept`]
//! independently.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::addr::TunnelAddr;
use crate::channel::ChannelConn;
use crate::config::PeerConfig;
use crate::error::TunnelError;
use crate::label::ChannelKind;
use crate::peer::Peer;
use crate::rtc::RtcApi;
use crate::signaling::Signaling;

const ACCEPTED_KINDS: [ChannelKind; 4] = [
    ChannelKind::Web,
    ChannelKind::Ssh,
    ChannelKind::File,
    ChannelKind::Proxy,
];

/// Peers by session id. `None` marks a session whose responder is still being
/// built.
type PeerTable = Arc<Mutex<HashMap<String, Option<Peer>>>>;

pub struct Listener {
    addr: TunnelAddr,
    signaling: Arc<dyn Signaling>,
    queues: HashMap<ChannelKind, tokio::sync::Mutex<mpsc::Receiver<ChannelConn>>>,
    peers: PeerTable,
    done: CancellationToken,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

struct Dispatch {
    api: Arc<dyn RtcApi>,
    signaling: Arc<dyn Signaling>,
    config: PeerConfig,
    peers: PeerTable,
    queues: HashMap<ChannelKind, mpsc::Sender<ChannelConn>>,
    accepted_tx: mpsc::UnboundedSender<ChannelConn>,
    teardown_tx: mpsc::UnboundedSender<String>,
    done: CancellationToken,
}

impl Listener {
    /// Starts serving the sessions of a responder-side signaling endpoint.
    pub fn bind(
        api: Arc<dyn RtcApi>,
        signaling: Arc<dyn Signaling>,
        config: &PeerConfig,
    ) -> Result<Listener, TunnelError> {
        let incoming = signaling.incoming_sessions().ok_or_else(|| {
            TunnelError::NotFound(format!(
                "no incoming sessions for service {}",
                signaling.service()
            ))
        })?;

        let backlog = config.accept_backlog.max(1);
        let mut senders = HashMap::new();
        let mut queues = HashMap::new();
        for kind in ACCEPTED_KINDS {
            let (tx, rx) = mpsc::channel(backlog);
            senders.insert(kind, tx);
            queues.insert(kind, tokio::sync::Mutex::new(rx));
        }

        let peers: PeerTable = Arc::default();
        let done = CancellationToken::new();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let (teardown_tx, teardown_rx) = mpsc::unbounded_channel();
        let dispatch = Dispatch {
            api,
            signaling: Arc::clone(&signaling),
            config: config.clone(),
            peers: Arc::clone(&peers),
            queues: senders,
            accepted_tx,
            teardown_tx,
            done: done.clone(),
        };
        let handle = tokio::spawn(dispatch.run(incoming, accepted_rx, teardown_rx));

        tracing::info!(target = "tunnel", service = signaling.service(), "listener bound");
        Ok(Listener {
            addr: TunnelAddr::service(signaling.service()),
            signaling,
            queues,
            peers,
            done,
            dispatch: Mutex::new(Some(handle)),
        })
    }

    /// Waits for the next channel of `kind` that a remote party started using.
    pub async fn accept(&self, kind: ChannelKind) -> Result<ChannelConn, TunnelError> {
        let queue = self
            .queues
            .get(&kind)
            .ok_or_else(|| TunnelError::NotFound(format!("{kind} channels are not accepted")))?;
        if self.done.is_cancelled() {
            return Err(TunnelError::Closed("listener"));
        }
        let mut queue = queue.lock().await;
        tokio::select! {
            biased;
            _ = self.done.cancelled() => Err(TunnelError::Closed("listener")),
            conn = queue.recv() => conn.ok_or(TunnelError::Closed("listener")),
        }
    }

    pub fn addr(&self) -> &TunnelAddr {
        &self.addr
    }

    /// Number of sessions with a live or connecting peer.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    /// Stops accepting, closes every peer and the signaling endpoint. Pending
    /// and later `accept` calls fail with `Closed`.
    pub async fn close(&self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        if let Some(handle) = self.dispatch.lock().take() {
            handle.abort();
        }
        let peers: Vec<Peer> = self.peers.lock().drain().filter_map(|(_, peer)| peer).collect();
        join_all(peers.iter().map(|peer| peer.close())).await;
        self.signaling.close();
        tracing::info!(target = "tunnel", service = self.signaling.service(), "listener closed");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.done.is_cancelled() {
            return;
        }
        self.done.cancel();
        if let Some(handle) = self.dispatch.get_mut().take() {
            handle.abort();
        }
        let peers: Vec<Peer> = self.peers.lock().drain().filter_map(|(_, peer)| peer).collect();
        if !peers.is_empty() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        join_all(peers.iter().map(|peer| peer.close())).await;
                    });
                }
                Err(_) => {
                    tracing::warn!(target = "tunnel", peers = peers.len(), "listener dropped outside a runtime; peers left open");
                }
            }
        }
        self.signaling.close();
        tracing::debug!(target = "tunnel", service = self.signaling.service(), "listener dropped");
    }
}

impl Dispatch {
    async fn run(
        self,
        mut incoming: mpsc::UnboundedReceiver<String>,
        mut accepted: mpsc::UnboundedReceiver<ChannelConn>,
        mut teardown: mpsc::UnboundedReceiver<String>,
    ) {
        let mut incoming_open = true;
        loop {
            tokio::select! {
                _ = self.done.cancelled() => break,
                session = incoming.recv(), if incoming_open => match session {
                    Some(session) => self.start_peer(session),
                    None => {
                        tracing::warn!(target = "tunnel", "signaling stopped announcing sessions");
                        incoming_open = false;
                    }
                },
                conn = accepted.recv() => {
                    if let Some(conn) = conn {
                        self.route(conn);
                    }
                }
                session = teardown.recv() => {
                    if let Some(session) = session {
                        self.peers.lock().remove(&session);
                        tracing::debug!(target = "tunnel", %session, "peer removed");
                    }
                }
            }
        }
    }

    fn start_peer(&self, session: String) {
        {
            let mut peers = self.peers.lock();
            if peers.contains_key(&session) {
                tracing::debug!(target = "tunnel", %session, "duplicate session announcement");
                return;
            }
            peers.insert(session.clone(), None);
        }

        let api = Arc::clone(&self.api);
        let signaling = Arc::clone(&self.signaling);
        let config = self.config.clone();
        let peers = Arc::clone(&self.peers);
        let accepted_tx = self.accepted_tx.clone();
        let teardown_tx = self.teardown_tx.clone();
        tokio::spawn(async move {
            match Peer::responder(api.as_ref(), signaling, &session, accepted_tx, &config).await {
                Ok(peer) => {
                    let tracked = match peers.lock().get_mut(&session) {
                        Some(slot) => {
                            *slot = Some(peer.clone());
                            true
                        }
                        None => false,
                    };
                    if !tracked {
                        // The listener closed while the peer was being built.
                        peer.close().await;
                    } else if peer.handshake().await.is_ok() {
                        peer.closed().await;
                    }
                }
                Err(err) => {
                    tracing::warn!(target = "tunnel", %session, error = %err, "failed to create responder");
                }
            }
            let _ = teardown_tx.send(session);
        });
    }

    fn route(&self, conn: ChannelConn) {
        let label = conn.label();
        let Some(queue) = self.queues.get(&label.kind()) else {
            tracing::warn!(target = "tunnel", %label, "no accept queue for channel");
            return;
        };
        match queue.try_send(conn) {
            Ok(()) => tracing::trace!(target = "tunnel", %label, "channel queued"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(target = "tunnel", %label, "accept queue full; dropping channel");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(target = "tunnel", %label, "accept queue closed");
            }
        }
    }
}

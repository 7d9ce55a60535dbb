use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use super::{SessionInbox, SessionRegistry, Signaling, endpoint};
use crate::config::SignalingConfig;
use crate::error::TunnelError;
use crate::proto::{IceCandidate, SdpType, SessionDescription, WsEndpoint, WsHeader, WsPacket};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Duplex binding over one websocket to the relay's `api/signalling` route.
///
/// The socket is re-dialed every `reconnect_interval` after it drops. Packets
/// submitted while disconnected wait in the outbound queue; a packet whose
/// write failed is retried first on the next connection.
pub struct WsSignaling {
    inner: Arc<WsInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct WsInner {
    url: Url,
    service: String,
    identity: String,
    side: SdpType,
    reconnect_interval: Duration,
    registry: SessionRegistry,
    /// Remote client id per session, learned from the first inbound packet.
    remote_clients: Mutex<HashMap<String, String>>,
    outbound_tx: mpsc::UnboundedSender<WsPacket>,
    incoming_tx: mpsc::UnboundedSender<String>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    cancel: CancellationToken,
}

enum DriveOutcome {
    Reconnect,
    Stop,
}

impl WsSignaling {
    pub fn connect(
        config: &SignalingConfig,
        service: &str,
        side: SdpType,
    ) -> Result<Arc<Self>, TunnelError> {
        let url = derive_websocket_url(&config.url)?;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(WsInner {
            url,
            service: service.to_string(),
            identity: Uuid::new_v4().to_string(),
            side,
            reconnect_interval: config.reconnect_interval,
            registry: SessionRegistry::new(config.session_grace),
            remote_clients: Mutex::new(HashMap::new()),
            outbound_tx,
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
            cancel: CancellationToken::new(),
        });

        let runner = Arc::clone(&inner);
        let handle = tokio::spawn(async move {
            runner.run(outbound_rx).await;
        });

        Ok(Arc::new(Self {
            inner,
            tasks: Mutex::new(vec![handle]),
        }))
    }
}

impl WsInner {
    async fn run(&self, mut outbound: mpsc::UnboundedReceiver<WsPacket>) {
        let mut unsent: Option<WsPacket> = None;
        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };
            match connected {
                Ok((stream, _)) => {
                    tracing::debug!(target = "tunnel", url = %self.url, "signaling websocket connected");
                    match self.drive(stream, &mut outbound, &mut unsent).await {
                        DriveOutcome::Stop => break,
                        DriveOutcome::Reconnect => {
                            tracing::debug!(target = "tunnel", url = %self.url, "signaling websocket dropped");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "tunnel",
                        url = %self.url,
                        error = %err,
                        "signaling websocket connect failed"
                    );
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.reconnect_interval) => {}
            }
        }
        tracing::debug!(target = "tunnel", service = %self.service, "signaling websocket loop stopped");
    }

    async fn drive(
        &self,
        stream: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<WsPacket>,
        unsent: &mut Option<WsPacket>,
    ) -> DriveOutcome {
        let (mut write, mut read) = stream.split();

        let header = WsHeader {
            sdp_type: self.side,
            id: self.identity.clone(),
            name: self.service.clone(),
        };
        let Some(text) = encode(&header) else {
            return DriveOutcome::Stop;
        };
        if write.send(Message::Text(text)).await.is_err() {
            return DriveOutcome::Reconnect;
        }
        if let Some(packet) = unsent.take() {
            if let Some(text) = encode(&packet) {
                if write.send(Message::Text(text)).await.is_err() {
                    *unsent = Some(packet);
                    return DriveOutcome::Reconnect;
                }
            }
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return DriveOutcome::Stop;
                }
                packet = outbound.recv() => {
                    let Some(packet) = packet else {
                        return DriveOutcome::Stop;
                    };
                    let Some(text) = encode(&packet) else {
                        continue;
                    };
                    if let Err(err) = write.send(Message::Text(text)).await {
                        tracing::debug!(target = "tunnel", error = %err, "signaling write failed; keeping packet");
                        *unsent = Some(packet);
                        return DriveOutcome::Reconnect;
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.handle_text(&text),
                        Err(_) => {
                            tracing::warn!(target = "tunnel", "ignoring non-utf8 signaling frame");
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return DriveOutcome::Reconnect,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(target = "tunnel", error = %err, "signaling websocket error");
                        return DriveOutcome::Reconnect;
                    }
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let packet: WsPacket = match serde_json::from_str(text) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::warn!(target = "tunnel", error = %err, "malformed signaling packet");
                return;
            }
        };
        let WsPacket { from, to, sdp, ice } = packet;
        let session = to.peer_id;
        if session.is_empty() {
            return;
        }

        if self.side == SdpType::Answer && !self.registry.contains(&session) {
            if sdp.is_none() {
                tracing::debug!(target = "tunnel", session = %session, "candidate for unknown session");
                return;
            }
            self.registry.ensure(&session);
            tracing::debug!(target = "tunnel", session = %session, "incoming session");
            let _ = self.incoming_tx.send(session.clone());
        }
        if !from.client_id.is_empty() {
            self.remote_clients
                .lock()
                .entry(session.clone())
                .or_insert(from.client_id);
        }

        if let Some(desc) = sdp {
            self.registry.deliver_description(&session, desc);
        }
        if let Some(candidate) = ice {
            self.registry.deliver_candidate(&session, candidate);
        }
    }

    fn submit(
        &self,
        session_id: &str,
        sdp: Option<SessionDescription>,
        ice: Option<IceCandidate>,
    ) -> Result<(), TunnelError> {
        let remote = self
            .remote_clients
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        let packet = WsPacket {
            from: WsEndpoint {
                client_id: self.identity.clone(),
                peer_id: session_id.to_string(),
            },
            to: WsEndpoint {
                client_id: remote,
                peer_id: session_id.to_string(),
            },
            sdp,
            ice,
        };
        self.outbound_tx
            .send(packet)
            .map_err(|_| TunnelError::Closed("signaling"))
    }
}

#[async_trait]
impl Signaling for WsSignaling {
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
        self.inner.submit(session_id, Some(desc), None)
    }

    async fn send_candidate(
        &self,
        session_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), TunnelError> {
        self.inner.submit(session_id, None, Some(candidate))
    }

    fn open_session(&self, session_id: &str) -> Result<SessionInbox, TunnelError> {
        self.inner.registry.take_inbox(session_id)
    }

    async fn notify_offline(&self, session_id: &str) -> Result<(), TunnelError> {
        self.inner.registry.close(session_id);
        self.inner.remote_clients.lock().remove(session_id);
        Ok(())
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

impl Drop for WsSignaling {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Option<String> {
    match serde_json::to_string(value) {
        Ok(text) => Some(text),
        Err(err) => {
            tracing::warn!(target = "tunnel", error = %err, "failed to encode signaling frame");
            None
        }
    }
}

fn derive_websocket_url(signaling_url: &str) -> Result<Url, TunnelError> {
    let base = Url::parse(signaling_url).map_err(|err| {
        TunnelError::Parse(format!("invalid signaling url {signaling_url}: {err}"))
    })?;
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TunnelError::Parse(format!(
                "unsupported signaling scheme {other}"
            )));
        }
    };
    let mut ws = Url::parse(&endpoint(base.as_str(), "api/signalling"))
        .map_err(|err| TunnelError::Parse(err.to_string()))?;
    ws.set_scheme(scheme)
        .map_err(|_| TunnelError::Parse("invalid websocket scheme".into()))?;
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::extract::State;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[derive(Clone)]
    struct StubState {
        frames: mpsc::UnboundedSender<(usize, String)>,
        connections: Arc<std::sync::atomic::AtomicUsize>,
        offer: Option<String>,
        drop_first: bool,
    }

    async fn upgrade(State(state): State<StubState>, ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(move |socket| serve(socket, state))
    }

    async fn serve(mut socket: WebSocket, state: StubState) {
        let n = state
            .connections
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let Some(Ok(AxumMessage::Text(header))) = socket.recv().await else {
            return;
        };
        let _ = state.frames.send((n, header));
        if state.drop_first && n == 0 {
            return;
        }
        if let Some(offer) = state.offer.clone() {
            if socket.send(AxumMessage::Text(offer)).await.is_err() {
                return;
            }
        }
        while let Some(Ok(message)) = socket.recv().await {
            if let AxumMessage::Text(text) = message {
                let _ = state.frames.send((n, text));
            }
        }
    }

    async fn spawn_stub(
        offer: Option<String>,
        drop_first: bool,
    ) -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let state = StubState {
            frames,
            connections: Arc::default(),
            offer,
            drop_first,
        };
        let router = Router::new()
            .route("/api/signalling", get(upgrade))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        (format!("http://{addr}"), frames_rx)
    }

    #[test_timeout::timeout]
    fn websocket_url_follows_base_scheme() {
        let url = derive_websocket_url("https://relay.example.com/").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/api/signalling");
        let url = derive_websocket_url("http://127.0.0.1:8080").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/api/signalling");
        assert!(derive_websocket_url("ftp://relay").is_err());
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn responder_learns_session_and_replies_to_its_client() {
        let offer = serde_json::to_string(&WsPacket {
            from: WsEndpoint {
                client_id: "initiator-1".into(),
                peer_id: "s9".into(),
            },
            to: WsEndpoint {
                client_id: String::new(),
                peer_id: "s9".into(),
            },
            sdp: Some(SessionDescription::offer("v=0")),
            ice: None,
        })
        .unwrap();
        let (url, mut frames) = spawn_stub(Some(offer), false).await;

        let config = SignalingConfig {
            url,
            ..SignalingConfig::default()
        };
        let signaling = WsSignaling::connect(&config, "svc", SdpType::Answer).expect("connect");
        let mut incoming = signaling.incoming_sessions().expect("incoming");

        let (_, header) = frames.recv().await.expect("header");
        let header: WsHeader = serde_json::from_str(&header).unwrap();
        assert_eq!(header.sdp_type, SdpType::Answer);
        assert_eq!(header.name, "svc");
        assert_eq!(header.id, signaling.identity());

        let session = timeout(Duration::from_secs(5), incoming.recv())
            .await
            .expect("session in time")
            .expect("incoming open");
        assert_eq!(session, "s9");
        let mut inbox = signaling.open_session("s9").expect("inbox");
        assert_eq!(inbox.descriptions.recv().await.unwrap().sdp, "v=0");

        signaling
            .send_description("s9", SessionDescription::answer("v=1"))
            .await
            .expect("send");
        let (_, reply) = frames.recv().await.expect("reply");
        let reply: WsPacket = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply.to.client_id, "initiator-1");
        assert_eq!(reply.to.peer_id, "s9");
        assert_eq!(reply.from.client_id, signaling.identity());
        assert_eq!(reply.sdp.unwrap().sdp_type, SdpType::Answer);
        signaling.close();
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn reconnects_and_resends_header() {
        let (url, mut frames) = spawn_stub(None, true).await;
        let config = SignalingConfig {
            url,
            reconnect_interval: Duration::from_millis(50),
            ..SignalingConfig::default()
        };
        let signaling = WsSignaling::connect(&config, "svc", SdpType::Offer).expect("connect");

        let (first, _) = frames.recv().await.expect("first header");
        assert_eq!(first, 0);
        let (second, header) = frames.recv().await.expect("second header");
        assert_eq!(second, 1);
        assert!(header.contains("\"offer\""));

        signaling
            .send_candidate(
                "s1",
                IceCandidate {
                    candidate: "candidate:7".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                    username_fragment: None,
                },
            )
            .await
            .expect("send");
        let (conn, packet) = frames.recv().await.expect("packet");
        assert_eq!(conn, 1);
        let packet: WsPacket = serde_json::from_str(&packet).unwrap();
        assert_eq!(packet.to.client_id, "");
        assert_eq!(packet.ice.unwrap().candidate, "candidate:7");
        signaling.close();
    }
}

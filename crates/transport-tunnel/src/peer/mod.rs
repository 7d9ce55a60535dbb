//! One end of a tunnel: a transport connection, the handshake that brings it
//! up, and the pool of channels multiplexed over it.

mod control;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::control::Control;
use crate::addr::Endpoints;
use crate::channel::ChannelConn;
use crate::config::PeerConfig;
use crate::error::TunnelError;
use crate::label::{ChannelKind, Label};
use crate::pool::ChannelPool;
use crate::proto::{IceCandidate, SdpType, SessionDescription};
use crate::rtc::{ConnectionEvent, ConnectionState, DataChannel, RtcApi, RtcConnection};
use crate::signaling::{SessionInbox, Signaling};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn sdp_type(self) -> SdpType {
        match self {
            Role::Initiator => SdpType::Offer,
            Role::Responder => SdpType::Answer,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Role::Initiator => "initiator",
            Role::Responder => "responder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Closed,
}

struct PeerInner {
    role: Role,
    session_id: String,
    conn: Arc<dyn RtcConnection>,
    signaling: Arc<dyn Signaling>,
    pool: ChannelPool,
    config: PeerConfig,
    state: watch::Sender<PeerState>,
    /// Set once our description is published; local candidates wait for it.
    local_sent: watch::Sender<bool>,
    closing: AtomicBool,
    done: CancellationToken,
    control: Control,
    inbox: Mutex<Option<SessionInbox>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        self.done.cancel();
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Handle to a peer. Clones share the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("role", &self.inner.role)
            .field("session", &self.inner.session_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Peer {
    /// Connects to the responder behind `signaling` under a fresh session id
    /// and waits for the handshake to finish.
    pub async fn dial(
        api: &dyn RtcApi,
        signaling: Arc<dyn Signaling>,
        config: &PeerConfig,
    ) -> Result<Peer, TunnelError> {
        let session_id = Uuid::new_v4().to_string();
        let conn = api.new_connection().await?;
        let peer = Peer::build(
            Role::Initiator,
            session_id,
            Arc::clone(&conn),
            signaling,
            config.clone(),
            None,
        )?;

        if let Err(err) = peer.publish_offer().await {
            tracing::warn!(target = "tunnel", session = %peer.inner.session_id, error = %err, "failed to start handshake");
            peer.close().await;
            return Err(err);
        }
        peer.handshake().await?;
        Ok(peer)
    }

    /// Builds the responder for a session announced by `signaling`. Channels
    /// the remote side starts using are sent to `accept_tx`. Call
    /// [`Peer::handshake`] to bring it up.
    pub async fn responder(
        api: &dyn RtcApi,
        signaling: Arc<dyn Signaling>,
        session_id: &str,
        accept_tx: mpsc::UnboundedSender<ChannelConn>,
        config: &PeerConfig,
    ) -> Result<Peer, TunnelError> {
        let conn = api.new_connection().await?;
        Peer::build(
            Role::Responder,
            session_id.to_string(),
            conn,
            signaling,
            config.clone(),
            Some(accept_tx),
        )
    }

    fn build(
        role: Role,
        session_id: String,
        conn: Arc<dyn RtcConnection>,
        signaling: Arc<dyn Signaling>,
        config: PeerConfig,
        accept_tx: Option<mpsc::UnboundedSender<ChannelConn>>,
    ) -> Result<Peer, TunnelError> {
        let inbox = signaling.open_session(&session_id)?;
        let events = conn
            .take_events()
            .ok_or_else(|| TunnelError::Transport("connection events already taken".into()))?;

        // The relay knows an initiator by its session id, so both ends name it
        // that way.
        let endpoints = match role {
            Role::Initiator => Endpoints::initiator(session_id.as_str(), signaling.service()),
            Role::Responder => Endpoints::responder(signaling.service(), session_id.as_str()),
        };
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let pool = ChannelPool::new(
            Arc::clone(&conn),
            endpoints,
            commands_tx,
            accept_tx,
            config.create_attempts,
        );

        let inner = Arc::new(PeerInner {
            role,
            session_id,
            conn,
            signaling,
            pool: pool.clone(),
            config,
            state: watch::channel(PeerState::Connecting).0,
            local_sent: watch::channel(false).0,
            closing: AtomicBool::new(false),
            done: CancellationToken::new(),
            control: Control::new(),
            inbox: Mutex::new(Some(inbox)),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let handles = vec![
            tokio::spawn(run_events(weak.clone(), events, candidates_tx)),
            tokio::spawn(run_local_candidates(
                inner.signaling.clone(),
                inner.session_id.clone(),
                inner.local_sent.subscribe(),
                candidates_rx,
                inner.done.clone(),
            )),
            tokio::spawn(control::run_keepalive(weak)),
            tokio::spawn(control::run_commands(
                inner.control.command.subscribe(),
                commands_rx,
                pool,
                inner.done.clone(),
            )),
        ];
        inner.tasks.lock().extend(handles);

        tracing::debug!(
            target = "tunnel",
            role = role.as_str(),
            session = %inner.session_id,
            "peer created"
        );
        Ok(Peer { inner })
    }

    async fn publish_offer(&self) -> Result<(), TunnelError> {
        let inner = &self.inner;
        for kind in [ChannelKind::Keepalive, ChannelKind::Command] {
            let dc = inner
                .conn
                .create_data_channel(&Label::singleton(kind).to_string())
                .await?;
            self.attach_control(kind, dc);
        }
        let offer = inner.conn.create_offer().await?;
        inner
            .signaling
            .send_description(&inner.session_id, offer)
            .await?;
        inner.local_sent.send_replace(true);
        Ok(())
    }

    /// Runs the offer/answer exchange until the transport reports connected,
    /// the peer closes, or the handshake timeout passes. Any failure closes
    /// the peer.
    pub async fn handshake(&self) -> Result<(), TunnelError> {
        let inbox = self.inner.inbox.lock().take();
        let Some(SessionInbox {
            mut descriptions,
            mut candidates,
        }) = inbox
        else {
            return Err(TunnelError::Closed("handshake"));
        };

        let deadline = Instant::now() + self.inner.config.handshake_timeout;
        let mut state = self.inner.state.subscribe();
        let mut applied = false;
        let mut candidates_open = true;
        let mut early: Vec<IceCandidate> = Vec::new();

        let result = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break Err(TunnelError::DeadlineExceeded),
                _ = self.inner.done.cancelled() => break Err(TunnelError::Closed("peer")),
                connected = settled(&mut state) => {
                    break if connected { Ok(()) } else { Err(TunnelError::Closed("peer")) };
                }
                desc = descriptions.recv(), if !applied => {
                    let Some(desc) = desc else {
                        break Err(TunnelError::Closed("session"));
                    };
                    applied = true;
                    if let Err(err) = self.apply_remote(desc).await {
                        break Err(err);
                    }
                    for candidate in early.drain(..) {
                        self.add_candidate(candidate).await;
                    }
                }
                candidate = candidates.recv(), if candidates_open => match candidate {
                    Some(candidate) if applied => self.add_candidate(candidate).await,
                    Some(candidate) => early.push(candidate),
                    None => candidates_open = false,
                },
            }
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    target = "tunnel",
                    role = self.inner.role.as_str(),
                    session = %self.inner.session_id,
                    "peer connected"
                );
                let weak = Arc::downgrade(&self.inner);
                let done = self.inner.done.clone();
                let handle = tokio::spawn(async move {
                    loop {
                        let candidate = tokio::select! {
                            _ = done.cancelled() => break,
                            candidate = candidates.recv() => candidate,
                        };
                        let (Some(candidate), Some(inner)) = (candidate, weak.upgrade()) else {
                            break;
                        };
                        Peer { inner }.add_candidate(candidate).await;
                    }
                });
                self.inner.tasks.lock().push(handle);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    target = "tunnel",
                    role = self.inner.role.as_str(),
                    session = %self.inner.session_id,
                    error = %err,
                    "handshake failed"
                );
                self.close().await;
                Err(err)
            }
        }
    }

    async fn apply_remote(&self, desc: SessionDescription) -> Result<(), TunnelError> {
        let inner = &self.inner;
        let expected = inner.role.sdp_type().opposite();
        if desc.sdp_type != expected {
            return Err(TunnelError::Parse(format!(
                "expected {} description, got {}",
                expected.as_str(),
                desc.sdp_type.as_str()
            )));
        }
        inner.conn.set_remote_description(desc).await?;
        if inner.role == Role::Responder {
            let answer = inner.conn.create_answer().await?;
            inner
                .signaling
                .send_description(&inner.session_id, answer)
                .await?;
            inner.local_sent.send_replace(true);
        }
        tracing::debug!(target = "tunnel", session = %inner.session_id, "remote description applied");
        Ok(())
    }

    async fn add_candidate(&self, candidate: IceCandidate) {
        if let Err(err) = self.inner.conn.add_ice_candidate(candidate).await {
            tracing::warn!(target = "tunnel", session = %self.inner.session_id, error = %err, "rejected remote candidate");
        }
    }

    fn attach_control(&self, kind: ChannelKind, dc: Arc<dyn DataChannel>) {
        let slot = match kind {
            ChannelKind::Keepalive => &self.inner.control.keepalive,
            _ => &self.inner.control.command,
        };
        if !Control::attach(slot, dc) {
            tracing::debug!(target = "tunnel", %kind, "duplicate control channel ignored");
        }
    }

    fn on_incoming_channel(&self, dc: Arc<dyn DataChannel>) {
        match dc.label().parse::<Label>().map(|label| label.kind()) {
            Ok(kind) if kind.is_control() => self.attach_control(kind, dc),
            _ => self.inner.pool.on_channel_open(dc),
        }
    }

    fn mark_connected(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state == PeerState::Connecting && !self.inner.closing.load(Ordering::Acquire) {
                *state = PeerState::Connected;
                true
            } else {
                false
            }
        });
    }

    /// A channel of `kind`, reusing an idle one when possible.
    pub async fn get(
        &self,
        kind: ChannelKind,
        label: Option<Label>,
    ) -> Result<ChannelConn, TunnelError> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(TunnelError::Closed("peer"));
        }
        self.inner.pool.get(kind, label).await
    }

    /// Tears the peer down: every channel, both control channels, the
    /// transport connection and the signaling session. Concurrent and repeated
    /// calls wait for the first one to finish.
    pub async fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            self.closed().await;
            return;
        }
        let inner = &self.inner;
        inner.done.cancel();
        inner.pool.close().await;
        inner.control.close().await;
        if let Err(err) = inner.conn.close().await {
            tracing::debug!(target = "tunnel", session = %inner.session_id, error = %err, "connection close failed");
        }
        if let Err(err) = inner.signaling.notify_offline(&inner.session_id).await {
            tracing::debug!(target = "tunnel", session = %inner.session_id, error = %err, "offline notice failed");
        }
        inner.state.send_replace(PeerState::Closed);
        tracing::info!(
            target = "tunnel",
            role = inner.role.as_str(),
            session = %inner.session_id,
            "peer closed"
        );
    }

    /// Resolves once the peer has fully closed.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|state| *state == PeerState::Closed).await;
    }

    pub fn state(&self) -> PeerState {
        *self.inner.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    #[cfg(test)]
    pub(crate) fn pool(&self) -> &ChannelPool {
        &self.inner.pool
    }
}

/// Waits for the peer to leave `Connecting`; `true` when it connected.
async fn settled(state: &mut watch::Receiver<PeerState>) -> bool {
    state
        .wait_for(|state| *state != PeerState::Connecting)
        .await
        .is_ok_and(|state| *state == PeerState::Connected)
}

async fn run_events(
    weak: std::sync::Weak<PeerInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    candidates: mpsc::UnboundedSender<IceCandidate>,
) {
    let Some(done) = weak.upgrade().map(|inner| inner.done.clone()) else {
        return;
    };
    loop {
        let event = tokio::select! {
            _ = done.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let peer = Peer { inner };
        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                let _ = candidates.send(candidate);
            }
            ConnectionEvent::StateChanged(ConnectionState::Connected) => peer.mark_connected(),
            ConnectionEvent::StateChanged(state) if state.is_terminal() => {
                tracing::debug!(target = "tunnel", session = %peer.inner.session_id, ?state, "transport went down");
                peer.close().await;
                break;
            }
            ConnectionEvent::StateChanged(state) => {
                tracing::trace!(target = "tunnel", session = %peer.inner.session_id, ?state, "transport state");
            }
            ConnectionEvent::IncomingChannel(dc) => peer.on_incoming_channel(dc),
        }
    }
}

async fn run_local_candidates(
    signaling: Arc<dyn Signaling>,
    session_id: String,
    mut local_sent: watch::Receiver<bool>,
    mut candidates: mpsc::UnboundedReceiver<IceCandidate>,
    done: CancellationToken,
) {
    tokio::select! {
        _ = done.cancelled() => return,
        sent = local_sent.wait_for(|sent| *sent) => {
            if sent.is_err() {
                return;
            }
        }
    }
    loop {
        let candidate = tokio::select! {
            _ = done.cancelled() => break,
            candidate = candidates.recv() => candidate,
        };
        let Some(candidate) = candidate else {
            break;
        };
        if let Err(err) = signaling.send_candidate(&session_id, candidate).await {
            tracing::warn!(target = "tunnel", session = %session_id, error = %err, "failed to publish candidate");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::rtc::{ChannelEvent, LoopbackNetwork};
    use crate::signaling::MemoryRelay;

    /// What the initiator's keepalive channel does in a test.
    #[derive(Clone, Copy)]
    enum Keepalive {
        /// Counts heartbeats and passes them on.
        Counted,
        /// Never opens.
        Stalled,
    }

    /// Loopback transport whose initiator-created keepalive channel is swapped
    /// for a counting or stalled one.
    struct KeepaliveApi {
        network: LoopbackNetwork,
        mode: Keepalive,
        heartbeats: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RtcApi for KeepaliveApi {
        async fn new_connection(&self) -> Result<Arc<dyn RtcConnection>, TunnelError> {
            Ok(Arc::new(KeepaliveConn {
                conn: self.network.new_connection().await?,
                mode: self.mode,
                heartbeats: Arc::clone(&self.heartbeats),
            }))
        }
    }

    struct KeepaliveConn {
        conn: Arc<dyn RtcConnection>,
        mode: Keepalive,
        heartbeats: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RtcConnection for KeepaliveConn {
        async fn create_data_channel(
            &self,
            label: &str,
        ) -> Result<Arc<dyn DataChannel>, TunnelError> {
            let dc = self.conn.create_data_channel(label).await?;
            if label != "keepalive" {
                return Ok(dc);
            }
            let swapped: Arc<dyn DataChannel> = match self.mode {
                Keepalive::Counted => Arc::new(CountedChannel {
                    dc,
                    heartbeats: Arc::clone(&self.heartbeats),
                }),
                Keepalive::Stalled => {
                    let (events_tx, events_rx) = mpsc::unbounded_channel();
                    Arc::new(StalledChannel {
                        _dc: dc,
                        _events_tx: events_tx,
                        events_rx: Mutex::new(Some(events_rx)),
                    })
                }
            };
            Ok(swapped)
        }

        async fn create_offer(&self) -> Result<SessionDescription, TunnelError> {
            self.conn.create_offer().await
        }

        async fn create_answer(&self) -> Result<SessionDescription, TunnelError> {
            self.conn.create_answer().await
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), TunnelError> {
            self.conn.set_remote_description(desc).await
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TunnelError> {
            self.conn.add_ice_candidate(candidate).await
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
            self.conn.take_events()
        }

        async fn close(&self) -> Result<(), TunnelError> {
            self.conn.close().await
        }
    }

    struct CountedChannel {
        dc: Arc<dyn DataChannel>,
        heartbeats: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DataChannel for CountedChannel {
        fn label(&self) -> &str {
            self.dc.label()
        }

        async fn send(&self, data: Bytes) -> Result<usize, TunnelError> {
            self.heartbeats.fetch_add(1, Ordering::AcqRel);
            self.dc.send(data).await
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
            self.dc.take_events()
        }

        async fn close(&self) -> Result<(), TunnelError> {
            self.dc.close().await
        }
    }

    struct StalledChannel {
        _dc: Arc<dyn DataChannel>,
        _events_tx: mpsc::UnboundedSender<ChannelEvent>,
        events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    }

    #[async_trait]
    impl DataChannel for StalledChannel {
        fn label(&self) -> &str {
            "keepalive"
        }

        async fn send(&self, _data: Bytes) -> Result<usize, TunnelError> {
            Err(TunnelError::Transport("sub-channel not open".into()))
        }

        fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
            self.events_rx.lock().take()
        }

        async fn close(&self) -> Result<(), TunnelError> {
            Ok(())
        }
    }

    fn keepalive_api(
        network: &LoopbackNetwork,
        mode: Keepalive,
    ) -> (Arc<dyn RtcApi>, Arc<AtomicUsize>) {
        let heartbeats = Arc::new(AtomicUsize::new(0));
        let api: Arc<dyn RtcApi> = Arc::new(KeepaliveApi {
            network: network.clone(),
            mode,
            heartbeats: Arc::clone(&heartbeats),
        });
        (api, heartbeats)
    }

    async fn connected(
        api: Arc<dyn RtcApi>,
        relay: &MemoryRelay,
        config: &PeerConfig,
    ) -> (Peer, Peer, mpsc::UnboundedReceiver<ChannelConn>) {
        let responder_signaling = relay.responder("svc");
        let mut incoming = responder_signaling.incoming_sessions().expect("incoming");
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let responder = {
            let api = Arc::clone(&api);
            let config = config.clone();
            tokio::spawn(async move {
                let session = incoming.recv().await.expect("session");
                let peer = Peer::responder(
                    api.as_ref(),
                    responder_signaling,
                    &session,
                    accept_tx,
                    &config,
                )
                .await?;
                peer.handshake().await?;
                Ok::<_, TunnelError>(peer)
            })
        };
        let initiator = Peer::dial(api.as_ref(), relay.initiator("svc"), config)
            .await
            .expect("dial");
        let responder = responder.await.expect("join").expect("responder");
        (initiator, responder, accept_rx)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn both_sides_connect_and_exchange_bytes() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let (initiator, responder, mut accepted) =
            connected(Arc::new(network.clone()), &relay, &PeerConfig::default()).await;
        assert_eq!(initiator.state(), PeerState::Connected);
        assert_eq!(responder.state(), PeerState::Connected);
        assert_eq!(initiator.session_id(), responder.session_id());

        let mut out = initiator.get(ChannelKind::Web, None).await.expect("get");
        out.write(b"ping").await.unwrap();
        let mut inbound = accepted.recv().await.expect("accepted");
        assert_eq!(inbound.label(), out.label());
        let mut buf = [0u8; 8];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");

        inbound.write(b"pong").await.unwrap();
        assert_eq!(out.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"pong");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn remote_release_reaches_holder() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let (initiator, responder, mut accepted) =
            connected(Arc::new(network.clone()), &relay, &PeerConfig::default()).await;

        let mut out = initiator.get(ChannelKind::File, None).await.expect("get");
        out.write(b"data").await.unwrap();
        out.flush().await.unwrap();
        let mut inbound = accepted.recv().await.expect("accepted");
        let mut buf = [0u8; 4];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 4);

        let label = out.label();
        out.release();
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 0);
        assert_eq!(initiator.pool().idle_labels(), vec![label.to_string()]);
        // The responder files the channel as idle once the disconnect lands.
        drop(inbound);
        assert_eq!(responder.pool().idle_labels(), vec![label.to_string()]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_tears_down_every_channel_once() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let (initiator, responder, mut accepted) =
            connected(Arc::new(network.clone()), &relay, &PeerConfig::default()).await;

        let mut held = initiator.get(ChannelKind::Web, None).await.expect("web");
        let spare = initiator.get(ChannelKind::Web, None).await.expect("spare");
        spare.release();
        held.write(b"x").await.unwrap();
        let _inbound = accepted.recv().await.expect("accepted");

        initiator.close().await;
        initiator.close().await;
        responder.closed().await;

        assert_eq!(initiator.state(), PeerState::Closed);
        assert_eq!(responder.state(), PeerState::Closed);
        assert!(matches!(
            initiator.get(ChannelKind::Web, None).await,
            Err(TunnelError::Closed(_))
        ));
        assert_eq!(held.write(b"late").await, Err(TunnelError::Closed("channel")));

        let calls = network.close_calls();
        assert!(calls.iter().any(|(label, _)| label == "keepalive"));
        assert!(calls.iter().any(|(label, _)| label.starts_with("web:")));
        assert!(calls.iter().all(|(_, count)| *count == 1), "{calls:?}");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn keepalive_sends_heartbeats_on_interval() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let (api, heartbeats) = keepalive_api(&network, Keepalive::Counted);
        let config = PeerConfig {
            keepalive_interval: Duration::from_millis(50),
            ..PeerConfig::default()
        };
        let (initiator, responder, _accepted) = connected(api, &relay, &config).await;

        tokio::time::sleep(Duration::from_millis(330)).await;
        assert!(heartbeats.load(Ordering::Acquire) >= 3);
        assert_eq!(initiator.state(), PeerState::Connected);
        assert_eq!(responder.state(), PeerState::Connected);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn keepalive_that_never_opens_closes_peer() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let (api, heartbeats) = keepalive_api(&network, Keepalive::Stalled);
        let config = PeerConfig {
            keepalive_open_timeout: Duration::from_millis(200),
            ..PeerConfig::default()
        };
        let (initiator, responder, _accepted) = connected(api, &relay, &config).await;

        initiator.closed().await;
        assert_eq!(initiator.state(), PeerState::Closed);
        responder.closed().await;
        assert_eq!(heartbeats.load(Ordering::Acquire), 0);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn remote_keepalive_close_tears_down_both_sides() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let (initiator, responder, _accepted) =
            connected(Arc::new(network.clone()), &relay, &PeerConfig::default()).await;

        let keepalive = loop {
            let attached = responder.inner.control.keepalive.borrow().clone();
            match attached {
                Some(dc) => break dc,
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        keepalive.close().await.expect("close keepalive");

        initiator.closed().await;
        responder.closed().await;
        assert_eq!(initiator.state(), PeerState::Closed);
        assert_eq!(responder.state(), PeerState::Closed);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn responder_sees_initiator_address() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let (initiator, _responder, mut accepted) =
            connected(Arc::new(network.clone()), &relay, &PeerConfig::default()).await;

        let mut out = initiator.get(ChannelKind::Ssh, None).await.expect("ssh");
        out.write(b"x").await.unwrap();
        let inbound = accepted.recv().await.expect("accepted");
        assert_eq!(inbound.remote_addr(), out.local_addr());
        assert_eq!(inbound.local_addr(), out.remote_addr());
        assert_eq!(out.local_addr().identity(), initiator.session_id());
        assert_eq!(out.remote_addr().identity(), "svc");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn handshake_times_out_without_responder_answer() {
        let network = LoopbackNetwork::new();
        let relay = MemoryRelay::new();
        let _responder = relay.responder("svc");
        let config = PeerConfig {
            handshake_timeout: Duration::from_millis(100),
            ..PeerConfig::default()
        };
        let err = Peer::dial(&network, relay.initiator("svc"), &config)
            .await
            .unwrap_err();
        assert_eq!(err, TunnelError::DeadlineExceeded);
    }
}

//! In-process transport used by tests and by embedders that run both ends of
//! a tunnel in one process.
//!
//! A description is `loopback:<token>` where the token names a connection
//! registered with the same `LoopbackNetwork`. Applying an answer links the
//! two connections; data channels created on either side are then paired and
//! opened. Every `DataChannel::close` call is counted per channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ChannelEvent, ConnectionEvent, ConnectionState, DataChannel, RtcApi, RtcConnection};
use crate::error::TunnelError;
use crate::proto::{IceCandidate, SdpType, SessionDescription};

const DESCRIPTION_PREFIX: &str = "loopback:";

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    connections: Mutex<HashMap<String, Weak<ConnInner>>>,
    closes: Mutex<HashMap<u64, (String, usize)>>,
    next_channel: AtomicU64,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Labels of every channel `close` was called on, with the call count.
    pub fn close_calls(&self) -> Vec<(String, usize)> {
        let mut calls: Vec<_> = self.inner.closes.lock().values().cloned().collect();
        calls.sort();
        calls
    }

    /// Runs the offer/answer exchange between two fresh connections.
    pub async fn connected_pair(
        &self,
    ) -> Result<(Arc<dyn RtcConnection>, Arc<dyn RtcConnection>), TunnelError> {
        let offerer = self.new_connection().await?;
        let answerer = self.new_connection().await?;
        let offer = offerer.create_offer().await?;
        answerer.set_remote_description(offer).await?;
        let answer = answerer.create_answer().await?;
        offerer.set_remote_description(answer).await?;
        Ok((offerer, answerer))
    }
}

#[async_trait]
impl RtcApi for LoopbackNetwork {
    async fn new_connection(&self) -> Result<Arc<dyn RtcConnection>, TunnelError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnInner {
            token: Uuid::new_v4().to_string(),
            network: Arc::downgrade(&self.inner),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            state: Mutex::new(ConnState::default()),
        });
        self.inner
            .connections
            .lock()
            .insert(conn.token.clone(), Arc::downgrade(&conn));
        Ok(Arc::new(LoopbackConnection(conn)))
    }
}

#[derive(Default)]
struct ConnState {
    remote_token: Option<String>,
    peer: Option<Weak<ConnInner>>,
    channels: Vec<Arc<LoopbackChannel>>,
    closed: bool,
}

struct ConnInner {
    token: String,
    network: Weak<NetworkInner>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    state: Mutex<ConnState>,
}

impl ConnInner {
    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events_tx.send(event);
    }

    fn description(&self, sdp_type: SdpType) -> SessionDescription {
        self.emit(ConnectionEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:loopback 1 udp 1 {} 0 typ host", self.token),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        SessionDescription {
            sdp_type,
            sdp: format!("{DESCRIPTION_PREFIX}{}", self.token),
        }
    }

    fn linked_peer(&self) -> Option<Arc<ConnInner>> {
        self.state.lock().peer.as_ref().and_then(Weak::upgrade)
    }

    fn new_channel(self: &Arc<Self>, label: &str) -> Arc<LoopbackChannel> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let id = self
            .network
            .upgrade()
            .map(|net| net.next_channel.fetch_add(1, Ordering::Relaxed))
            .unwrap_or_default();
        let channel = Arc::new(LoopbackChannel {
            id,
            label: label.to_string(),
            network: self.network.clone(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            peer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.state.lock().channels.push(channel.clone());
        channel
    }

    fn terminate(&self, local_state: ConnectionState) -> Vec<Arc<LoopbackChannel>> {
        let mut state = self.state.lock();
        if state.closed {
            return Vec::new();
        }
        state.closed = true;
        drop(state);
        self.emit(ConnectionEvent::StateChanged(local_state));
        std::mem::take(&mut self.state.lock().channels)
    }
}

fn link(offerer: &Arc<ConnInner>, answerer: &Arc<ConnInner>) {
    let offered = {
        let mut state = offerer.state.lock();
        state.peer = Some(Arc::downgrade(answerer));
        state.channels.clone()
    };
    let answered = {
        let mut state = answerer.state.lock();
        state.peer = Some(Arc::downgrade(offerer));
        state.channels.clone()
    };
    offerer.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
    answerer.emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
    for channel in offered.iter().filter(|c| !c.is_paired()) {
        pair(channel, answerer);
    }
    for channel in answered.iter().filter(|c| !c.is_paired()) {
        pair(channel, offerer);
    }
}

fn pair(local: &Arc<LoopbackChannel>, remote: &Arc<ConnInner>) {
    let counterpart = remote.new_channel(&local.label);
    *local.peer.lock() = Some(Arc::downgrade(&counterpart));
    *counterpart.peer.lock() = Some(Arc::downgrade(local));
    remote.emit(ConnectionEvent::IncomingChannel(counterpart.clone()));
    local.mark_open();
    counterpart.mark_open();
}

fn parse_token(desc: &SessionDescription) -> Result<String, TunnelError> {
    desc.sdp
        .strip_prefix(DESCRIPTION_PREFIX)
        .map(str::to_string)
        .ok_or_else(|| TunnelError::Parse("not a loopback description".into()))
}

struct LoopbackConnection(Arc<ConnInner>);

#[async_trait]
impl RtcConnection for LoopbackConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TunnelError> {
        if self.0.state.lock().closed {
            return Err(TunnelError::Transport("connection closed".into()));
        }
        let channel = self.0.new_channel(label);
        if let Some(peer) = self.0.linked_peer() {
            pair(&channel, &peer);
        }
        Ok(channel)
    }

    async fn create_offer(&self) -> Result<SessionDescription, TunnelError> {
        Ok(self.0.description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TunnelError> {
        if self.0.state.lock().remote_token.is_none() {
            return Err(TunnelError::Transport("no remote offer applied".into()));
        }
        Ok(self.0.description(SdpType::Answer))
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TunnelError> {
        let token = parse_token(&desc)?;
        self.0.state.lock().remote_token = Some(token.clone());
        if desc.sdp_type == SdpType::Answer {
            let network = self
                .0
                .network
                .upgrade()
                .ok_or_else(|| TunnelError::Transport("loopback network dropped".into()))?;
            let remote = network
                .connections
                .lock()
                .get(&token)
                .and_then(Weak::upgrade)
                .ok_or_else(|| TunnelError::Transport(format!("unknown loopback peer {token}")))?;
            link(&self.0, &remote);
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TunnelError> {
        if self.0.state.lock().closed {
            return Err(TunnelError::Transport("connection closed".into()));
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.0.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TunnelError> {
        let peer = self.0.linked_peer();
        for channel in self.0.terminate(ConnectionState::Closed) {
            channel.shut(true);
        }
        if let Some(peer) = peer {
            for channel in peer.terminate(ConnectionState::Disconnected) {
                channel.shut(false);
            }
        }
        if let Some(network) = self.0.network.upgrade() {
            network.connections.lock().remove(&self.0.token);
        }
        Ok(())
    }
}

struct LoopbackChannel {
    id: u64,
    label: String,
    network: Weak<NetworkInner>,
    events_tx: mpsc::UnboundedSender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
    peer: Mutex<Option<Weak<LoopbackChannel>>>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackChannel {
    fn is_paired(&self) -> bool {
        self.peer.lock().is_some()
    }

    fn mark_open(&self) {
        if !self.closed.load(Ordering::Acquire) && !self.open.swap(true, Ordering::AcqRel) {
            let _ = self.events_tx.send(ChannelEvent::Open);
        }
    }

    fn remote(&self) -> Option<Arc<LoopbackChannel>> {
        self.peer.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Marks the channel closed and, when `propagate` is set, its counterpart.
    fn shut(&self, propagate: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.events_tx.send(ChannelEvent::Close);
        if propagate {
            if let Some(remote) = self.remote() {
                remote.shut(false);
            }
        }
    }
}

#[async_trait]
impl DataChannel for LoopbackChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<usize, TunnelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TunnelError::Transport(format!("{} is closed", self.label)));
        }
        if !self.open.load(Ordering::Acquire) {
            return Err(TunnelError::Transport(format!("{} is not open", self.label)));
        }
        let remote = self
            .remote()
            .filter(|remote| !remote.closed.load(Ordering::Acquire))
            .ok_or_else(|| TunnelError::Transport(format!("{} has no remote", self.label)))?;
        let len = data.len();
        remote
            .events_tx
            .send(ChannelEvent::Message(data))
            .map_err(|_| TunnelError::Transport(format!("{} remote dropped", self.label)))?;
        Ok(len)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events_rx.lock().take()
    }

    async fn close(&self) -> Result<(), TunnelError> {
        if let Some(network) = self.network.upgrade() {
            network
                .closes
                .lock()
                .entry(self.id)
                .or_insert_with(|| (self.label.clone(), 0))
                .1 += 1;
        }
        self.shut(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_incoming(conn: &Arc<dyn RtcConnection>) -> Arc<dyn DataChannel> {
        let mut events = conn.take_events().expect("events");
        loop {
            match events.recv().await.expect("event") {
                ConnectionEvent::IncomingChannel(channel) => return channel,
                _ => continue,
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn pairs_channels_across_link() {
        let network = LoopbackNetwork::new();
        let (offerer, answerer) = network.connected_pair().await.expect("pair");

        let local = offerer.create_data_channel("web:1").await.expect("create");
        let remote = next_incoming(&answerer).await;
        assert_eq!(remote.label(), "web:1");

        let mut local_events = local.take_events().expect("local events");
        let mut remote_events = remote.take_events().expect("remote events");
        assert_eq!(local_events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Open));

        local.send(Bytes::from_static(b"hi")).await.expect("send");
        assert_eq!(
            remote_events.recv().await,
            Some(ChannelEvent::Message(Bytes::from_static(b"hi")))
        );

        local.close().await.expect("close");
        local.close().await.expect("close again");
        assert_eq!(remote_events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(network.close_calls(), vec![("web:1".to_string(), 2)]);
        assert!(remote.send(Bytes::from_static(b"late")).await.is_err());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn channels_created_before_link_open_after_answer() {
        let network = LoopbackNetwork::new();
        let offerer = network.new_connection().await.expect("offerer");
        let answerer = network.new_connection().await.expect("answerer");
        let early = offerer.create_data_channel("keepalive").await.expect("create");
        let mut early_events = early.take_events().expect("events");

        let offer = offerer.create_offer().await.expect("offer");
        answerer.set_remote_description(offer).await.expect("remote offer");
        let answer = answerer.create_answer().await.expect("answer");
        assert!(early.send(Bytes::from_static(b"::")).await.is_err());
        offerer.set_remote_description(answer).await.expect("remote answer");

        assert_eq!(early_events.recv().await, Some(ChannelEvent::Open));
        let remote = next_incoming(&answerer).await;
        assert_eq!(remote.label(), "keepalive");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closing_connection_disconnects_remote() {
        let network = LoopbackNetwork::new();
        let (offerer, answerer) = network.connected_pair().await.expect("pair");
        let mut answerer_events = answerer.take_events().expect("events");
        offerer.close().await.expect("close");

        let mut saw_disconnect = false;
        while let Ok(event) = answerer_events.try_recv() {
            if matches!(
                event,
                ConnectionEvent::StateChanged(ConnectionState::Disconnected)
            ) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
        assert!(offerer.create_data_channel("web:1").await.is_err());
    }
}

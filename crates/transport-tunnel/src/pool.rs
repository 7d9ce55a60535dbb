use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::addr::Endpoints;
use crate::channel::{Channel, ChannelConn, ChannelHook, ChannelNotice, ChannelStatus};
use crate::error::TunnelError;
use crate::label::{ChannelKind, Label};
use crate::proto::Command;
use crate::rtc::{DataChannel, RtcConnection};

#[derive(Default)]
struct PoolMaps {
    idle: HashMap<String, Channel>,
    active: HashMap<String, Channel>,
    next_index: HashMap<ChannelKind, u64>,
    /// Generations of `Connect` commands that arrived before their
    /// sub-channel did.
    pending_connects: HashMap<String, u64>,
    closed: bool,
}

impl PoolMaps {
    fn contains(&self, key: &str) -> bool {
        self.idle.contains_key(key) || self.active.contains_key(key)
    }

    fn allocate(&mut self, kind: ChannelKind) -> Result<Label, TunnelError> {
        if !kind.is_indexed() {
            let label = Label::singleton(kind);
            if self.contains(&label.to_string()) {
                return Err(TunnelError::NotFound(format!("no free {kind} channel")));
            }
            return Ok(label);
        }
        let next = self.next_index.entry(kind).or_insert(1);
        loop {
            let label = Label::new(kind, *next);
            *next += 1;
            let key = label.to_string();
            if !self.idle.contains_key(&key) && !self.active.contains_key(&key) {
                return Ok(label);
            }
        }
    }

    fn note_remote(&mut self, label: Label) {
        if label.kind().is_indexed() {
            let next = self.next_index.entry(label.kind()).or_insert(1);
            *next = (*next).max(label.index().saturating_add(1));
        }
    }
}

struct PoolInner {
    conn: Arc<dyn RtcConnection>,
    endpoints: Endpoints,
    maps: Mutex<PoolMaps>,
    commands: mpsc::UnboundedSender<Command>,
    accept_tx: Option<mpsc::UnboundedSender<ChannelConn>>,
    create_attempts: usize,
    hook: ChannelHook,
}

/// The channels of one peer, split into `idle` and `active` by label.
///
/// Channels report their own transitions through a hook that holds only a weak
/// reference back to the pool; the pool re-files them from their current
/// status, so the maps follow the channels rather than the other way round.
#[derive(Clone)]
pub(crate) struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    /// With `accept_tx`, remote-initiated channels are handed to it once they
    /// are claimed by inbound traffic or a `Connect` command.
    pub(crate) fn new(
        conn: Arc<dyn RtcConnection>,
        endpoints: Endpoints,
        commands: mpsc::UnboundedSender<Command>,
        accept_tx: Option<mpsc::UnboundedSender<ChannelConn>>,
        create_attempts: usize,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<PoolInner>| {
            let weak = weak.clone();
            let hook: ChannelHook = Arc::new(move |notice| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_notice(notice);
                }
            });
            PoolInner {
                conn,
                endpoints,
                maps: Mutex::new(PoolMaps::default()),
                commands,
                accept_tx,
                create_attempts: create_attempts.max(1),
                hook,
            }
        });
        Self { inner }
    }

    /// Hands out a channel of `kind`: the requested idle label, else any idle
    /// channel of the kind, else a newly created sub-channel.
    pub(crate) async fn get(
        &self,
        kind: ChannelKind,
        label: Option<Label>,
    ) -> Result<ChannelConn, TunnelError> {
        if kind.is_control() {
            return Err(TunnelError::NotFound(format!("{kind} channels are not pooled")));
        }
        if let Some(label) = label {
            if label.kind() != kind {
                return Err(TunnelError::Parse(format!("label {label} is not of kind {kind}")));
            }
        }

        let candidates: Vec<Channel> = {
            let maps = self.inner.maps.lock();
            if maps.closed {
                return Err(TunnelError::Closed("pool"));
            }
            match label {
                Some(label) => maps.idle.get(&label.to_string()).cloned().into_iter().collect(),
                None => maps
                    .idle
                    .values()
                    .filter(|channel| channel.label().kind() == kind)
                    .cloned()
                    .collect(),
            }
        };
        for channel in candidates {
            if let Some(conn) = channel.try_take() {
                tracing::debug!(target = "tunnel", label = %channel.label(), lease = conn.generation(), "reusing idle channel");
                self.inner.send_command(Command::Connect {
                    label: channel.label(),
                    lease: conn.generation(),
                });
                return Ok(conn);
            }
        }

        self.create(kind, label).await
    }

    async fn create(
        &self,
        kind: ChannelKind,
        requested: Option<Label>,
    ) -> Result<ChannelConn, TunnelError> {
        for attempt in 0..self.inner.create_attempts {
            let label = {
                let mut maps = self.inner.maps.lock();
                match requested {
                    Some(label) if attempt == 0 && !maps.contains(&label.to_string()) => label,
                    _ => maps.allocate(kind)?,
                }
            };
            let dc = self.inner.conn.create_data_channel(&label.to_string()).await?;
            let channel = Channel::new(
                label,
                self.inner.endpoints.addrs(label),
                dc,
                self.inner.accept_tx.is_some(),
                Arc::clone(&self.inner.hook),
            )?;

            let outcome = {
                let mut maps = self.inner.maps.lock();
                let key = label.to_string();
                if maps.closed {
                    Err(TunnelError::Closed("pool"))
                } else if maps.contains(&key) {
                    Ok(false)
                } else {
                    maps.idle.insert(key, channel.clone());
                    Ok(true)
                }
            };
            match outcome {
                Err(err) => {
                    channel.close().await;
                    return Err(err);
                }
                Ok(false) => {
                    tracing::debug!(target = "tunnel", %label, attempt, "label collision; retrying");
                    channel.close().await;
                    continue;
                }
                Ok(true) => {}
            }

            if let Some(conn) = channel.try_take() {
                tracing::debug!(target = "tunnel", %label, "created channel");
                self.inner.send_command(Command::Connect {
                    label,
                    lease: conn.generation(),
                });
                return Ok(conn);
            }
            tracing::debug!(target = "tunnel", %label, attempt, "lost take race; retrying");
        }
        Err(TunnelError::Transport(format!(
            "no {kind} channel after {} attempts",
            self.inner.create_attempts
        )))
    }

    /// Registers a sub-channel opened by the remote side. It stays idle until
    /// claimed.
    pub(crate) fn on_channel_open(&self, dc: Arc<dyn DataChannel>) {
        let label: Label = match dc.label().parse() {
            Ok(label) => label,
            Err(err) => {
                tracing::warn!(target = "tunnel", label = dc.label(), error = %err, "rejecting sub-channel");
                tokio::spawn(async move {
                    let _ = dc.close().await;
                });
                return;
            }
        };
        let key = label.to_string();
        {
            let mut maps = self.inner.maps.lock();
            if maps.closed || maps.contains(&key) {
                drop(maps);
                tracing::debug!(target = "tunnel", %label, "ignoring duplicate sub-channel");
                tokio::spawn(async move {
                    let _ = dc.close().await;
                });
                return;
            }
            maps.note_remote(label);
        }

        let channel = match Channel::new(
            label,
            self.inner.endpoints.addrs(label),
            Arc::clone(&dc),
            self.inner.accept_tx.is_some(),
            Arc::clone(&self.inner.hook),
        ) {
            Ok(channel) => channel,
            Err(err) => {
                tracing::warn!(target = "tunnel", %label, error = %err, "failed to wrap sub-channel");
                tokio::spawn(async move {
                    let _ = dc.close().await;
                });
                return;
            }
        };

        let registered = {
            let mut maps = self.inner.maps.lock();
            let filed = maps
                .idle
                .get(&key)
                .or_else(|| maps.active.get(&key))
                .map(|existing| existing.same(&channel));
            match filed {
                // Early traffic already filed it through the hook.
                Some(true) => Some(maps.pending_connects.remove(&key)),
                Some(false) => None,
                None if maps.closed => None,
                None => {
                    maps.idle.insert(key.clone(), channel.clone());
                    Some(maps.pending_connects.remove(&key))
                }
            }
        };
        match registered {
            None => {
                tracing::debug!(target = "tunnel", %label, "sub-channel registered concurrently; closing");
                tokio::spawn(async move { channel.close().await });
            }
            Some(pending) => {
                tracing::debug!(target = "tunnel", %label, "remote sub-channel registered");
                if let Some(generation) = pending {
                    self.inner.accept(&channel, generation);
                }
            }
        }
    }

    pub(crate) fn handle_command(&self, command: Command) {
        let label = command.label();
        let key = label.to_string();
        match command {
            Command::Connect { lease, .. } => {
                let known = {
                    let mut maps = self.inner.maps.lock();
                    if maps.closed {
                        return;
                    }
                    let known = maps.idle.get(&key).or_else(|| maps.active.get(&key)).cloned();
                    if known.is_none() && self.inner.accept_tx.is_some() {
                        let pending = maps.pending_connects.entry(key).or_insert(lease);
                        *pending = (*pending).max(lease);
                    }
                    known
                };
                if let Some(channel) = known {
                    self.inner.accept(&channel, lease);
                }
            }
            Command::Disconnect { lease, .. } => {
                let active = self.inner.maps.lock().active.get(&key).cloned();
                match active {
                    Some(channel) => channel.end_remote_lease(lease),
                    None => tracing::trace!(target = "tunnel", %label, lease, "disconnect for inactive channel"),
                }
            }
            Command::Eof { lease, offset, .. } => {
                let active = self.inner.maps.lock().active.get(&key).cloned();
                if let Some(channel) = active {
                    channel.remote_eof(lease, offset);
                }
            }
        }
    }

    /// Closes every channel regardless of state. Later calls find nothing.
    pub(crate) async fn close(&self) {
        let channels: Vec<Channel> = {
            let mut maps = self.inner.maps.lock();
            maps.closed = true;
            maps.pending_connects.clear();
            let mut channels: Vec<Channel> = maps.idle.drain().map(|(_, channel)| channel).collect();
            channels.extend(maps.active.drain().map(|(_, channel)| channel));
            channels
        };
        for channel in channels {
            channel.close().await;
        }
    }

    pub(crate) fn idle_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.inner.maps.lock().idle.keys().cloned().collect();
        labels.sort();
        labels
    }

    pub(crate) fn active_labels(&self) -> Vec<String> {
        let mut labels: Vec<String> = self.inner.maps.lock().active.keys().cloned().collect();
        labels.sort();
        labels
    }
}

impl PoolInner {
    fn on_notice(&self, notice: ChannelNotice) {
        match notice {
            ChannelNotice::Changed(channel) => self.refile(&channel),
            ChannelNotice::Released { channel, generation } => {
                self.refile(&channel);
                self.send_command(Command::Disconnect {
                    label: channel.label(),
                    lease: generation,
                });
            }
            ChannelNotice::Shutdown {
                label,
                generation,
                offset,
            } => {
                self.send_command(Command::Eof {
                    label,
                    lease: generation,
                    offset,
                });
            }
            ChannelNotice::Accepted(conn) => self.hand_off(conn),
        }
    }

    /// Moves the channel to the map matching its current status.
    fn refile(&self, channel: &Channel) {
        let key = channel.label().to_string();
        let mut maps = self.maps.lock();
        if maps.closed {
            return;
        }
        let known = maps
            .idle
            .get(&key)
            .or_else(|| maps.active.get(&key))
            .map(|existing| existing.same(channel));
        if known == Some(false) {
            return;
        }
        match channel.status() {
            ChannelStatus::Active => {
                maps.idle.remove(&key);
                maps.active.insert(key, channel.clone());
            }
            ChannelStatus::Opening | ChannelStatus::Idle => {
                maps.active.remove(&key);
                maps.idle.insert(key, channel.clone());
            }
            ChannelStatus::Closed => {
                maps.idle.remove(&key);
                maps.active.remove(&key);
            }
        }
    }

    fn accept(&self, channel: &Channel, generation: u64) {
        if let Some(conn) = channel.remote_connect(generation) {
            tracing::debug!(target = "tunnel", label = %channel.label(), generation, "channel claimed by connect");
            self.hand_off(conn);
        }
    }

    fn hand_off(&self, conn: ChannelConn) {
        let Some(accept_tx) = &self.accept_tx else {
            return;
        };
        if let Err(mpsc::error::SendError(conn)) = accept_tx.send(conn) {
            tracing::debug!(target = "tunnel", label = %conn.label(), "no acceptor; releasing");
        }
    }

    fn send_command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::trace!(target = "tunnel", ?command, "command channel gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::rtc::{ConnectionEvent, LoopbackNetwork};

    struct Harness {
        network: LoopbackNetwork,
        dialer_conn: Arc<dyn RtcConnection>,
        dialer: ChannelPool,
        acceptor: ChannelPool,
        accepted: mpsc::UnboundedReceiver<ChannelConn>,
        dialer_commands: mpsc::UnboundedReceiver<Command>,
        acceptor_commands: mpsc::UnboundedReceiver<Command>,
    }

    async fn harness() -> Harness {
        let network = LoopbackNetwork::new();
        let (a, b) = network.connected_pair().await.expect("pair");
        let (dialer_tx, dialer_commands) = mpsc::unbounded_channel();
        let (acceptor_tx, acceptor_commands) = mpsc::unbounded_channel();
        let (accept_tx, accepted) = mpsc::unbounded_channel();
        let dialer = ChannelPool::new(Arc::clone(&a), Endpoints::initiator("client", "svc"), dialer_tx, None, 5);
        let acceptor = ChannelPool::new(
            Arc::clone(&b),
            Endpoints::responder("svc", "client"),
            acceptor_tx,
            Some(accept_tx),
            5,
        );

        let mut events = b.take_events().expect("events");
        let registrar = acceptor.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let ConnectionEvent::IncomingChannel(dc) = event {
                    registrar.on_channel_open(dc);
                }
            }
        });

        Harness {
            network,
            dialer_conn: a,
            dialer,
            acceptor,
            accepted,
            dialer_commands,
            acceptor_commands,
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn proxy_channels_get_sequential_indices() {
        let h = harness().await;
        let first = h.dialer.get(ChannelKind::Proxy, None).await.expect("first");
        let second = h.dialer.get(ChannelKind::Proxy, None).await.expect("second");
        assert_eq!(first.label(), Label::new(ChannelKind::Proxy, 1));
        assert_eq!(second.label(), Label::new(ChannelKind::Proxy, 2));
        assert_eq!(h.dialer.active_labels(), vec!["proxy:1", "proxy:2"]);
        assert!(h.dialer.idle_labels().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn active_label_is_never_handed_out_twice() {
        let h = harness().await;
        let label = Label::new(ChannelKind::Web, 7);
        let first = h.dialer.get(ChannelKind::Web, Some(label)).await.expect("first");
        let second = h.dialer.get(ChannelKind::Web, Some(label)).await.expect("second");
        assert_eq!(first.label(), label);
        assert_ne!(second.label(), label);
        assert_eq!(h.dialer.active_labels().len(), 2);

        assert!(h.dialer.get(ChannelKind::Keepalive, None).await.is_err());
        let _ssh = h.dialer.get(ChannelKind::Ssh, None).await.expect("ssh");
        assert!(matches!(
            h.dialer.get(ChannelKind::Ssh, None).await,
            Err(TunnelError::NotFound(_))
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn release_then_get_sees_no_stale_bytes() {
        let mut h = harness().await;
        let mut out = h.dialer.get(ChannelKind::Web, None).await.expect("dial");
        let label = out.label();
        out.write(b"first holder").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = h.accepted.recv().await.expect("accepted");
        assert_eq!(inbound.label(), label);
        let mut buf = [0u8; 5];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf, b"first");
        // The rest of "first holder" stays unread.
        inbound.release();
        assert_eq!(h.acceptor.idle_labels(), vec![label.to_string()]);

        let mut again = h
            .acceptor
            .get(ChannelKind::Web, Some(label))
            .await
            .expect("re-get");
        assert_eq!(again.label(), label);
        again.set_read_deadline(Some(Instant::now() + Duration::from_millis(100)));
        let mut buf = [0u8; 32];
        assert_eq!(again.read(&mut buf).await, Err(TunnelError::DeadlineExceeded));
        drop(out);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn release_and_shutdown_emit_commands() {
        let mut h = harness().await;
        let mut conn = h.dialer.get(ChannelKind::File, None).await.expect("dial");
        let label = conn.label();
        assert_eq!(
            h.dialer_commands.recv().await,
            Some(Command::Connect { label, lease: 1 })
        );

        conn.write(b"0123456789").await.unwrap();
        conn.shutdown().await.unwrap();
        assert_eq!(
            h.dialer_commands.recv().await,
            Some(Command::Eof {
                label,
                lease: 1,
                offset: 10
            })
        );
        conn.release();
        assert_eq!(
            h.dialer_commands.recv().await,
            Some(Command::Disconnect { label, lease: 1 })
        );
        assert_eq!(h.dialer.idle_labels(), vec![label.to_string()]);

        let again = h.dialer.get(ChannelKind::File, Some(label)).await.expect("again");
        assert_eq!(
            h.dialer_commands.recv().await,
            Some(Command::Connect { label, lease: 2 })
        );
        drop(again);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connect_command_claims_idle_channel() {
        let mut h = harness().await;
        let conn = h.dialer.get(ChannelKind::Ssh, None).await.expect("dial");
        let label = conn.label();
        // Deliver the command before or after the sub-channel shows up.
        h.acceptor.handle_command(Command::Connect { label, lease: 1 });
        let accepted = h.accepted.recv().await.expect("accepted");
        assert_eq!(accepted.label(), label);
        assert_eq!(accepted.remote_addr().identity(), "client");
        assert_eq!(h.acceptor.active_labels(), vec!["ssh"]);

        // A repeated connect for the same lease is not a second accept.
        h.acceptor.handle_command(Command::Connect { label, lease: 1 });
        assert!(
            tokio::time::timeout(Duration::from_millis(100), h.accepted.recv())
                .await
                .is_err()
        );

        h.acceptor.handle_command(Command::Disconnect { label, lease: 1 });
        assert_eq!(h.acceptor.idle_labels(), vec!["ssh"]);
        drop(conn);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn late_bytes_after_local_release_are_not_accepted() {
        let mut h = harness().await;
        let mut out = h.dialer.get(ChannelKind::Web, None).await.expect("dial");
        let label = out.label();
        out.write(b"hello").await.unwrap();
        out.flush().await.unwrap();

        let mut inbound = h.accepted.recv().await.expect("accepted");
        let mut buf = [0u8; 16];
        assert_eq!(inbound.read(&mut buf).await.unwrap(), 5);
        drop(inbound);

        // The disconnect is still queued, so the dialer keeps writing.
        out.write(b"MIDSTREAM").await.unwrap();
        out.flush().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(200), h.accepted.recv())
                .await
                .is_err()
        );
        assert_eq!(h.acceptor.idle_labels(), vec![label.to_string()]);

        let disconnect = h.acceptor_commands.recv().await.expect("disconnect");
        assert_eq!(disconnect, Command::Disconnect { label, lease: 1 });
        h.dialer.handle_command(disconnect);
        assert_eq!(out.read(&mut buf).await.unwrap(), 0);
        drop(out);

        let mut fresh = h.dialer.get(ChannelKind::Web, Some(label)).await.expect("fresh");
        fresh.write(b"fresh").await.unwrap();
        fresh.flush().await.unwrap();
        let mut next = h.accepted.recv().await.expect("next accept");
        assert_eq!(next.label(), label);
        assert_eq!(next.read(&mut buf).await.unwrap(), 5);
        assert_eq!(&buf[..5], b"fresh");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn new_lease_overtaking_disconnect_is_accepted() {
        let mut h = harness().await;
        let mut first = h.dialer.get(ChannelKind::Web, None).await.expect("first");
        let label = first.label();
        first.write(b"old").await.unwrap();
        first.flush().await.unwrap();
        let mut old = h.accepted.recv().await.expect("old accept");
        let mut buf = [0u8; 16];
        assert_eq!(old.read(&mut buf).await.unwrap(), 3);
        first.release();

        // The disconnect for lease 1 stays undelivered while lease 2 starts.
        let mut second = h.dialer.get(ChannelKind::Web, None).await.expect("second");
        assert_eq!(second.label(), label);
        second.write(b"new").await.unwrap();
        second.flush().await.unwrap();

        let mut fresh = h.accepted.recv().await.expect("fresh accept");
        assert_eq!(fresh.label(), label);
        assert_eq!(fresh.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"new");
        assert_eq!(old.read(&mut buf).await.unwrap(), 0);

        h.acceptor.handle_command(Command::Disconnect { label, lease: 1 });
        h.acceptor.handle_command(Command::Connect { label, lease: 2 });
        assert_eq!(h.acceptor.active_labels(), vec![label.to_string()]);

        fresh.write(b"ok").await.unwrap();
        fresh.flush().await.unwrap();
        assert_eq!(second.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ok");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn unusable_sub_channel_is_closed() {
        let h = harness().await;
        let dc = h.dialer_conn.create_data_channel("web:9").await.expect("dc");
        drop(dc.take_events());
        h.dialer.on_channel_open(dc);
        while !h.network.close_calls().iter().any(|(label, _)| label == "web:9") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.dialer.idle_labels().is_empty());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_closes_every_channel_once() {
        let h = harness().await;
        let _a = h.dialer.get(ChannelKind::Web, None).await.expect("a");
        let b = h.dialer.get(ChannelKind::Web, None).await.expect("b");
        b.release();
        h.dialer.close().await;
        h.dialer.close().await;
        assert!(h.dialer.active_labels().is_empty());
        assert!(h.dialer.idle_labels().is_empty());
        assert!(matches!(
            h.dialer.get(ChannelKind::Web, None).await,
            Err(TunnelError::Closed(_))
        ));

        let dialer_closes: Vec<_> = h
            .network
            .close_calls()
            .into_iter()
            .filter(|(label, _)| label.starts_with("web"))
            .collect();
        assert!(dialer_closes.iter().all(|(_, count)| *count == 1));
        assert!(dialer_closes.len() >= 2);
    }
}

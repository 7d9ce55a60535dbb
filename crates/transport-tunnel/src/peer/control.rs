//! The two sub-channels a peer keeps for itself: `keepalive` carries a
//! heartbeat, `command` carries [`Command`] frames for the pool.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{Peer, PeerInner, PeerState};
use crate::pool::ChannelPool;
use crate::proto::Command;
use crate::rtc::{ChannelEvent, DataChannel};

const HEARTBEAT: &[u8] = b"::";

type Slot = watch::Sender<Option<Arc<dyn DataChannel>>>;

pub(super) struct Control {
    pub(super) keepalive: Slot,
    pub(super) command: Slot,
}

impl Control {
    pub(super) fn new() -> Self {
        Self {
            keepalive: watch::channel(None).0,
            command: watch::channel(None).0,
        }
    }

    /// Returns `false` when the slot is already taken.
    pub(super) fn attach(slot: &Slot, dc: Arc<dyn DataChannel>) -> bool {
        slot.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(Arc::clone(&dc));
            true
        })
    }

    /// Closes whatever is attached; each sub-channel is closed once.
    pub(super) async fn close(&self) {
        for slot in [&self.keepalive, &self.command] {
            if let Some(dc) = slot.send_replace(None) {
                if let Err(err) = dc.close().await {
                    tracing::debug!(target = "tunnel", label = dc.label(), error = %err, "control channel close failed");
                }
            }
        }
    }
}

async fn attached(
    mut slot: watch::Receiver<Option<Arc<dyn DataChannel>>>,
) -> Option<Arc<dyn DataChannel>> {
    slot.wait_for(Option::is_some)
        .await
        .ok()
        .and_then(|dc| dc.clone())
}

async fn wait_open(
    slot: watch::Receiver<Option<Arc<dyn DataChannel>>>,
) -> Option<(Arc<dyn DataChannel>, mpsc::UnboundedReceiver<ChannelEvent>)> {
    let dc = attached(slot).await?;
    let mut events = dc.take_events()?;
    loop {
        match events.recv().await? {
            ChannelEvent::Open => return Some((dc, events)),
            ChannelEvent::Close => return None,
            ChannelEvent::Message(_) => {}
        }
    }
}

pub(super) async fn run_keepalive(weak: Weak<PeerInner>) {
    let (mut state, slot, done, config) = match weak.upgrade() {
        Some(inner) => (
            inner.state.subscribe(),
            inner.control.keepalive.subscribe(),
            inner.done.clone(),
            inner.config.clone(),
        ),
        None => return,
    };

    let connected = tokio::select! {
        _ = done.cancelled() => return,
        connected = super::settled(&mut state) => connected,
    };
    if !connected {
        return;
    }

    let opened = tokio::select! {
        _ = done.cancelled() => return,
        opened = tokio::time::timeout(config.keepalive_open_timeout, wait_open(slot)) => opened,
    };
    let (dc, mut events) = match opened {
        Ok(Some(opened)) => opened,
        Ok(None) | Err(_) => {
            tracing::warn!(target = "tunnel", "keepalive channel never opened");
            close_peer(&weak).await;
            return;
        }
    };

    let mut ticker = tokio::time::interval(config.keepalive_interval);
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = dc.send(Bytes::from_static(HEARTBEAT)).await {
                    tracing::debug!(target = "tunnel", error = %err, "heartbeat failed");
                }
            }
            event = events.recv() => match event {
                Some(ChannelEvent::Message(_)) | Some(ChannelEvent::Open) => {}
                Some(ChannelEvent::Close) | None => {
                    tracing::debug!(target = "tunnel", "keepalive channel closed by remote");
                    close_peer(&weak).await;
                    break;
                }
            },
        }
    }
}

pub(super) async fn run_commands(
    slot: watch::Receiver<Option<Arc<dyn DataChannel>>>,
    mut outbound: mpsc::UnboundedReceiver<Command>,
    pool: ChannelPool,
    done: CancellationToken,
) {
    let dc = tokio::select! {
        _ = done.cancelled() => return,
        dc = attached(slot) => dc,
    };
    let Some(dc) = dc else {
        return;
    };
    let Some(mut events) = dc.take_events() else {
        tracing::warn!(target = "tunnel", "command channel events already taken");
        return;
    };

    let mut open = false;
    let mut queued: VecDeque<Command> = VecDeque::new();
    loop {
        tokio::select! {
            _ = done.cancelled() => break,
            command = outbound.recv() => {
                let Some(command) = command else {
                    break;
                };
                if open {
                    send_command(dc.as_ref(), command).await;
                } else {
                    queued.push_back(command);
                }
            }
            event = events.recv() => match event {
                Some(ChannelEvent::Open) => {
                    open = true;
                    while let Some(command) = queued.pop_front() {
                        send_command(dc.as_ref(), command).await;
                    }
                }
                Some(ChannelEvent::Message(data)) => match serde_json::from_slice::<Command>(&data) {
                    Ok(command) => {
                        tracing::trace!(target = "tunnel", ?command, "command received");
                        pool.handle_command(command);
                    }
                    Err(err) => {
                        tracing::warn!(target = "tunnel", error = %err, "malformed command");
                    }
                },
                Some(ChannelEvent::Close) | None => break,
            },
        }
    }
}

async fn send_command(dc: &dyn DataChannel, command: Command) {
    let payload = match serde_json::to_vec(&command) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(target = "tunnel", error = %err, "failed to encode command");
            return;
        }
    };
    if let Err(err) = dc.send(Bytes::from(payload)).await {
        tracing::debug!(target = "tunnel", ?command, error = %err, "command send failed");
    }
}

async fn close_peer(weak: &Weak<PeerInner>) {
    if let Some(inner) = weak.upgrade() {
        Peer { inner }.close().await;
    }
}

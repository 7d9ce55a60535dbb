//! One logical stream on one transport sub-channel.
//!
//! A `Channel` moves through `Opening -> Idle -> Active -> Idle -> ... -> Closed`.
//! Each `Idle -> Active` transition is a lease, handed to exactly one
//! [`ChannelConn`]. Lease numbers only grow, so work queued under an old lease
//! is recognised and discarded once the lease ends.
//!
//! Both sides also agree on a lease generation. Every data message starts with
//! the generation it was written under as a big-endian `u64`, and lease
//! commands carry it too. A side that takes a channel locally moves to the next
//! generation; a side that sees a newer generation from its peer follows it.
//! Anything tagged with a generation that has already ended is dropped, so bytes
//! and commands still in flight from an old lease never reach a new holder.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

use crate::addr::TunnelAddr;
use crate::config::CHUNK_SIZE;
use crate::error::TunnelError;
use crate::label::Label;
use crate::rtc::{ChannelEvent, DataChannel};

/// Inbound chunks buffered per lease before the channel stops reading.
const INBOUND_CAPACITY: usize = 256;
/// Generation prefix in front of every data message.
const FRAME_HEADER: usize = 8;
/// Payload bytes per data message.
const FRAME_PAYLOAD: usize = CHUNK_SIZE - FRAME_HEADER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Opening,
    Idle,
    Active,
    Closed,
}

/// Lifecycle notifications from a channel to its owner. Delivered without any
/// channel lock held.
pub(crate) enum ChannelNotice {
    /// Status changed; the owner should re-file the channel.
    Changed(Channel),
    /// The local holder released its lease.
    Released { channel: Channel, generation: u64 },
    /// The local holder half-closed after writing `offset` bytes.
    Shutdown {
        label: Label,
        generation: u64,
        offset: u64,
    },
    /// The remote side opened a new lease on this channel.
    Accepted(ChannelConn),
}

pub(crate) type ChannelHook = Arc<dyn Fn(ChannelNotice) + Send + Sync>;

struct ChannelState {
    status: ChannelStatus,
    lease: u64,
    generation: u64,
    inbound: Option<mpsc::Sender<Bytes>>,
    received: u64,
    eof_at: Option<u64>,
}

struct ChannelShared {
    label: Label,
    local: TunnelAddr,
    remote: TunnelAddr,
    dc: Arc<dyn DataChannel>,
    state: Mutex<ChannelState>,
    open: watch::Sender<bool>,
    closed: CancellationToken,
    accepts_inbound: bool,
    hook: ChannelHook,
}

#[derive(Clone)]
pub(crate) struct Channel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.shared.label)
            .field("status", &self.status())
            .finish()
    }
}

impl Channel {
    /// Wraps a transport sub-channel and starts its event pump. With
    /// `accepts_inbound`, traffic or a connect under a newer generation claims
    /// the channel and is announced through the hook as `Accepted`.
    pub(crate) fn new(
        label: Label,
        (local, remote): (TunnelAddr, TunnelAddr),
        dc: Arc<dyn DataChannel>,
        accepts_inbound: bool,
        hook: ChannelHook,
    ) -> Result<Self, TunnelError> {
        let events = dc.take_events().ok_or_else(|| {
            TunnelError::Transport(format!("events of sub-channel {label} already taken"))
        })?;
        let (open, _) = watch::channel(false);
        let shared = Arc::new(ChannelShared {
            label,
            local,
            remote,
            dc,
            state: Mutex::new(ChannelState {
                status: ChannelStatus::Opening,
                lease: 0,
                generation: 0,
                inbound: None,
                received: 0,
                eof_at: None,
            }),
            open,
            closed: CancellationToken::new(),
            accepts_inbound,
            hook,
        });
        tokio::spawn(run_pump(Arc::clone(&shared), events));
        Ok(Self { shared })
    }

    pub(crate) fn label(&self) -> Label {
        self.shared.label
    }

    pub(crate) fn status(&self) -> ChannelStatus {
        self.shared.state.lock().status
    }

    pub(crate) fn same(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Claims the channel if it is opening or idle. At most one caller wins
    /// per idle period.
    pub(crate) fn try_take(&self) -> Option<ChannelConn> {
        let conn = {
            let mut state = self.shared.state.lock();
            if !matches!(state.status, ChannelStatus::Opening | ChannelStatus::Idle) {
                return None;
            }
            let generation = state.generation + 1;
            self.shared.take_locked(&mut state, generation)
        };
        (self.shared.hook)(ChannelNotice::Changed(self.clone()));
        Some(conn)
    }

    /// The remote side announced a lease under `generation`. An accepting
    /// channel hands the new lease out, ending an older local one first; other
    /// channels only record the generation.
    pub(crate) fn remote_connect(&self, generation: u64) -> Option<ChannelConn> {
        let conn = {
            let mut state = self.shared.state.lock();
            if state.status == ChannelStatus::Closed || generation <= state.generation {
                return None;
            }
            if state.status == ChannelStatus::Active {
                end_lease_locked(&mut state);
            }
            if !self.shared.accepts_inbound {
                state.generation = generation;
                None
            } else {
                Some(self.shared.take_locked(&mut state, generation))
            }
        };
        (self.shared.hook)(ChannelNotice::Changed(self.clone()));
        conn
    }

    /// The remote holder of `generation` released: the local holder drains
    /// what it has and then sees end of stream.
    pub(crate) fn end_remote_lease(&self, generation: u64) {
        {
            let mut state = self.shared.state.lock();
            if state.status != ChannelStatus::Active || state.generation != generation {
                return;
            }
            end_lease_locked(&mut state);
        }
        tracing::trace!(target = "tunnel", label = %self.shared.label, generation, "remote released lease");
        (self.shared.hook)(ChannelNotice::Changed(self.clone()));
    }

    /// The remote holder of `generation` half-closed after writing `offset`
    /// bytes.
    pub(crate) fn remote_eof(&self, generation: u64, offset: u64) {
        let mut state = self.shared.state.lock();
        if state.status != ChannelStatus::Active || state.generation != generation {
            return;
        }
        if state.received >= offset {
            state.inbound = None;
        } else {
            state.eof_at = Some(offset);
        }
    }

    /// Terminal. Calls the sub-channel's own close exactly once.
    pub(crate) async fn close(&self) {
        self.shared.close().await;
        (self.shared.hook)(ChannelNotice::Changed(self.clone()));
    }
}

fn end_lease_locked(state: &mut ChannelState) {
    state.status = ChannelStatus::Idle;
    state.lease += 1;
    state.inbound = None;
}

fn encode_frame(generation: u64, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER + payload.len());
    frame.put_u64(generation);
    frame.extend_from_slice(payload);
    frame.freeze()
}

fn decode_frame(mut frame: Bytes) -> Option<(u64, Bytes)> {
    if frame.len() < FRAME_HEADER {
        return None;
    }
    let generation = frame.get_u64();
    Some((generation, frame))
}

/// What an inbound data message means for the channel.
enum Inbound {
    Deliver,
    Claimed(ChannelConn),
    Superseded,
    Stale,
}

impl ChannelShared {
    fn take_locked(self: &Arc<Self>, state: &mut ChannelState, generation: u64) -> ChannelConn {
        state.status = ChannelStatus::Active;
        state.lease += 1;
        state.generation = generation;
        state.received = 0;
        state.eof_at = None;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        state.inbound = Some(inbound_tx);

        let flush = Arc::new(FlushState::default());
        tokio::spawn(run_sender(
            Arc::clone(self),
            state.lease,
            outbound_rx,
            Arc::clone(&flush),
        ));
        tracing::trace!(target = "tunnel", label = %self.label, lease = state.lease, generation, "channel taken");

        ChannelConn {
            channel: Channel {
                shared: Arc::clone(self),
            },
            lease: state.lease,
            generation,
            inbound: inbound_rx,
            pending: Bytes::new(),
            outbound: Some(outbound_tx),
            flush,
            written: 0,
            read_deadline: None,
            write_deadline: None,
            read_sleep: None,
            flushing: None,
            shut_down: false,
            released: false,
        }
    }

    fn holds(&self, lease: u64) -> bool {
        let state = self.state.lock();
        state.status == ChannelStatus::Active && state.lease == lease
    }

    fn release(&self, lease: u64) -> bool {
        let mut state = self.state.lock();
        if state.status != ChannelStatus::Active || state.lease != lease {
            return false;
        }
        state.status = ChannelStatus::Idle;
        state.lease += 1;
        state.inbound = None;
        state.received = 0;
        state.eof_at = None;
        true
    }

    fn mark_open(&self) {
        self.open.send_replace(true);
        let mut state = self.state.lock();
        if state.status == ChannelStatus::Opening {
            state.status = ChannelStatus::Idle;
        }
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.status == ChannelStatus::Closed {
                return;
            }
            state.status = ChannelStatus::Closed;
            state.lease += 1;
            state.inbound = None;
        }
        self.closed.cancel();
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = "tunnel", label = %self.label, error = %err, "sub-channel close failed");
        }
        tracing::debug!(target = "tunnel", label = %self.label, "channel closed");
    }

    async fn on_message(self: &Arc<Self>, frame: Bytes) {
        let Some((generation, data)) = decode_frame(frame) else {
            tracing::warn!(target = "tunnel", label = %self.label, "dropping message without lease generation");
            return;
        };
        let (inbound, lease, outcome) = {
            let mut state = self.state.lock();
            let outcome = if state.status == ChannelStatus::Closed || generation < state.generation {
                Inbound::Stale
            } else if generation == state.generation {
                if state.status == ChannelStatus::Active {
                    Inbound::Deliver
                } else {
                    Inbound::Stale
                }
            } else {
                if state.status == ChannelStatus::Active {
                    end_lease_locked(&mut state);
                }
                if self.accepts_inbound {
                    Inbound::Claimed(self.take_locked(&mut state, generation))
                } else {
                    state.generation = generation;
                    Inbound::Superseded
                }
            };
            (state.inbound.clone(), state.lease, outcome)
        };

        let accepted = match outcome {
            Inbound::Deliver => None,
            Inbound::Claimed(conn) => Some(conn),
            Inbound::Superseded => {
                tracing::debug!(
                    target = "tunnel",
                    label = %self.label,
                    generation,
                    "remote opened a newer lease"
                );
                (self.hook)(ChannelNotice::Changed(Channel {
                    shared: Arc::clone(self),
                }));
                return;
            }
            Inbound::Stale => {
                tracing::debug!(
                    target = "tunnel",
                    label = %self.label,
                    generation,
                    len = data.len(),
                    "dropping message outside the current lease"
                );
                return;
            }
        };

        let len = data.len() as u64;
        match inbound {
            Some(inbound) => {
                tokio::select! {
                    _ = self.closed.cancelled() => return,
                    result = inbound.send(data) => {
                        if result.is_err() {
                            tracing::trace!(target = "tunnel", label = %self.label, "holder stopped reading");
                        }
                    }
                }
            }
            None => {
                tracing::trace!(target = "tunnel", label = %self.label, "dropping message past end of stream");
            }
        }

        {
            let mut state = self.state.lock();
            if state.lease == lease && state.status == ChannelStatus::Active {
                state.received += len;
                if state.eof_at.is_some_and(|offset| state.received >= offset) {
                    state.inbound = None;
                }
            }
        }

        if let Some(conn) = accepted {
            let channel = conn.channel.clone();
            (self.hook)(ChannelNotice::Accepted(conn));
            (self.hook)(ChannelNotice::Changed(channel));
        }
    }
}

async fn run_pump(shared: Arc<ChannelShared>, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
    loop {
        let event = tokio::select! {
            _ = shared.closed.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Some(ChannelEvent::Open) => {
                tracing::trace!(target = "tunnel", label = %shared.label, "sub-channel open");
                shared.mark_open();
            }
            Some(ChannelEvent::Message(data)) => shared.on_message(data).await,
            Some(ChannelEvent::Close) | None => {
                tracing::debug!(target = "tunnel", label = %shared.label, "sub-channel closed by transport");
                shared.close().await;
                (shared.hook)(ChannelNotice::Changed(Channel {
                    shared: Arc::clone(&shared),
                }));
                break;
            }
        }
    }
}

/// Serialises all sends of one lease onto the sub-channel, once it is open.
async fn run_sender(
    shared: Arc<ChannelShared>,
    lease: u64,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    flush: Arc<FlushState>,
) {
    let mut open = shared.open.subscribe();
    tokio::select! {
        _ = shared.closed.cancelled() => return,
        result = open.wait_for(|open| *open) => {
            if result.is_err() {
                return;
            }
        }
    }

    loop {
        let chunk = tokio::select! {
            _ = shared.closed.cancelled() => break,
            chunk = outbound.recv() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        if shared.holds(lease) {
            if let Err(err) = shared.dc.send(chunk).await {
                tracing::warn!(target = "tunnel", label = %shared.label, error = %err, "sub-channel send failed");
            }
        }
        flush.complete_one();
    }
}

#[derive(Default)]
struct FlushState {
    pending: AtomicUsize,
    notify: Notify,
}

impl FlushState {
    fn complete_one(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

async fn wait_flushed(
    flush: Arc<FlushState>,
    closed: CancellationToken,
    deadline: Option<Instant>,
) -> Result<(), TunnelError> {
    let wait = async {
        loop {
            let notified = flush.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if flush.pending.load(Ordering::Acquire) == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = closed.cancelled() => return Err(TunnelError::Closed("channel")),
                _ = notified => {}
            }
        }
    };
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, wait)
            .await
            .map_err(|_| TunnelError::DeadlineExceeded)?,
        None => wait.await,
    }
}

type FlushFuture = Pin<Box<dyn Future<Output = Result<(), TunnelError>> + Send>>;

/// A held lease on a channel: the connection handed to dialers and to
/// listener consumers. Dropping it releases the lease.
pub struct ChannelConn {
    channel: Channel,
    lease: u64,
    generation: u64,
    inbound: mpsc::Receiver<Bytes>,
    pending: Bytes,
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
    flush: Arc<FlushState>,
    written: u64,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    read_sleep: Option<Pin<Box<Sleep>>>,
    flushing: Option<FlushFuture>,
    shut_down: bool,
    released: bool,
}

impl fmt::Debug for ChannelConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConn")
            .field("label", &self.channel.label())
            .field("lease", &self.lease)
            .field("generation", &self.generation)
            .field("written", &self.written)
            .finish()
    }
}

impl ChannelConn {
    pub fn label(&self) -> Label {
        self.channel.label()
    }

    pub fn local_addr(&self) -> &TunnelAddr {
        &self.channel.shared.local
    }

    pub fn remote_addr(&self) -> &TunnelAddr {
        &self.channel.shared.remote
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// `None` clears the deadline.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.read_sleep = None;
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
        self.flushing = None;
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Reads into `buf`. `Ok(0)` is end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            let next = match self.read_deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, self.inbound.recv())
                    .await
                    .map_err(|_| TunnelError::DeadlineExceeded)?,
                None => self.inbound.recv().await,
            };
            match next {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending.split_to(n));
        Ok(n)
    }

    /// Queues `data` in transport-sized chunks. Chunks from one holder reach
    /// the transport in submission order.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        self.enqueue(data)
    }

    /// Waits until every queued chunk has been handed to the transport.
    pub async fn flush(&mut self) -> Result<(), TunnelError> {
        self.flush_future().await
    }

    /// Flushes, then tells the remote side the stream ends after the bytes
    /// written so far. Reading stays possible.
    pub async fn shutdown(&mut self) -> Result<(), TunnelError> {
        if self.shut_down {
            return Ok(());
        }
        self.flush().await?;
        self.finish_shutdown()
    }

    /// Returns the channel to its pool. Unread input and unsent output of this
    /// lease are discarded.
    pub fn release(mut self) {
        self.release_lease();
    }

    pub async fn close(mut self) {
        self.released = true;
        self.channel.close().await;
    }

    fn enqueue(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.shut_down {
            return Err(TunnelError::Closed("stream"));
        }
        if !self.channel.shared.holds(self.lease) {
            return Err(TunnelError::Closed("channel"));
        }
        let outbound = self
            .outbound
            .as_ref()
            .ok_or(TunnelError::Closed("channel"))?;
        for chunk in data.chunks(FRAME_PAYLOAD) {
            self.flush.pending.fetch_add(1, Ordering::AcqRel);
            if outbound.send(encode_frame(self.generation, chunk)).is_err() {
                self.flush.pending.fetch_sub(1, Ordering::AcqRel);
                return Err(TunnelError::Closed("channel"));
            }
        }
        self.written += data.len() as u64;
        Ok(data.len())
    }

    fn flush_future(&self) -> FlushFuture {
        Box::pin(wait_flushed(
            Arc::clone(&self.flush),
            self.channel.shared.closed.clone(),
            self.write_deadline,
        ))
    }

    fn finish_shutdown(&mut self) -> Result<(), TunnelError> {
        if !self.channel.shared.holds(self.lease) {
            return Err(TunnelError::Closed("channel"));
        }
        self.shut_down = true;
        self.outbound = None;
        (self.channel.shared.hook)(ChannelNotice::Shutdown {
            label: self.channel.label(),
            generation: self.generation,
            offset: self.written,
        });
        Ok(())
    }

    fn release_lease(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.outbound = None;
        if self.channel.shared.release(self.lease) {
            tracing::trace!(target = "tunnel", label = %self.channel.label(), lease = self.lease, "lease released");
            (self.channel.shared.hook)(ChannelNotice::Released {
                channel: self.channel.clone(),
                generation: self.generation,
            });
        }
    }
}

impl Drop for ChannelConn {
    fn drop(&mut self) {
        self.release_lease();
    }
}

impl AsyncRead for ChannelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending.is_empty() {
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.pending = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => {
                    if let Some(deadline) = this.read_deadline {
                        let sleep = this
                            .read_sleep
                            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
                        if sleep.as_mut().poll(cx).is_ready() {
                            return Poll::Ready(Err(TunnelError::DeadlineExceeded.into()));
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
        let n = buf.remaining().min(this.pending.len());
        buf.put_slice(&this.pending.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ChannelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.get_mut().enqueue(buf).map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.flushing.is_none() {
            this.flushing = Some(this.flush_future());
        }
        let Some(flushing) = this.flushing.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(flushing.as_mut().poll(cx));
        this.flushing = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shut_down {
            return Poll::Ready(Ok(()));
        }
        ready!(self.as_mut().poll_flush(cx))?;
        Poll::Ready(self.get_mut().finish_shutdown().map_err(io::Error::from))
    }
}

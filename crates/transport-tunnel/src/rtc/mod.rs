//! Seam between the tunnel and the NAT-traversal primitive underneath it.
//!
//! Implementations register their callbacks once, at construction, and forward
//! every notification into an unbounded queue. Consumers take that queue with
//! `take_events` and do all further work in their own task.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TunnelError;
use crate::proto::{IceCandidate, SessionDescription};

pub mod loopback;
pub mod webrtc;

pub use self::loopback::LoopbackNetwork;
pub use self::webrtc::WebRtcApi;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States from which the connection does not come back.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

pub enum ConnectionEvent {
    LocalCandidate(IceCandidate),
    StateChanged(ConnectionState),
    IncomingChannel(Arc<dyn DataChannel>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(Bytes),
    Close,
}

#[async_trait]
pub trait RtcApi: Send + Sync {
    async fn new_connection(&self) -> Result<Arc<dyn RtcConnection>, TunnelError>;
}

#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn create_data_channel(&self, label: &str)
    -> Result<Arc<dyn DataChannel>, TunnelError>;

    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TunnelError>;

    /// Creates an answer to the applied remote offer and applies it locally.
    async fn create_answer(&self) -> Result<SessionDescription, TunnelError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), TunnelError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TunnelError>;

    /// Returns the event queue the first time it is called.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    async fn close(&self) -> Result<(), TunnelError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, data: Bytes) -> Result<usize, TunnelError>;

    /// Returns the event queue the first time it is called.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>>;

    async fn close(&self) -> Result<(), TunnelError>;
}

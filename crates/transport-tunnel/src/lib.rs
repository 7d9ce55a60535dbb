//! Byte-stream tunnels between two parties that can only meet through a relay.
//!
//! A [`TunnelClient`] dials a named service and a [`Listener`] serves one. The
//! two sides rendezvous through a [`signaling`] binding, bring up a transport
//! connection behind the [`rtc`] seam, and then multiplex independent
//! [`ChannelConn`] streams over it, each named by a [`Label`].

pub mod addr;
mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod label;
pub mod listener;
mod peer;
mod pool;
pub mod proto;
pub mod rtc;
pub mod signaling;

pub use crate::addr::TunnelAddr;
pub use crate::channel::{ChannelConn, ChannelStatus};
pub use crate::client::{SignalingConnector, TunnelClient};
pub use crate::config::{PeerConfig, SignalingConfig, SignalingMode, TunnelConfig};
pub use crate::error::TunnelError;
pub use crate::label::{ChannelKind, Label};
pub use crate::listener::Listener;
pub use crate::peer::{Peer, PeerState, Role};

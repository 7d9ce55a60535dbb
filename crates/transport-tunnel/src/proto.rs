//! Wire types shared by the signaling bindings and the relay.

use serde::{Deserialize, Serialize};

use crate::label::Label;

/// Which half of the offer/answer exchange a party plays. On requests it names
/// the caller's own side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            SdpType::Offer => SdpType::Answer,
            SdpType::Answer => SdpType::Offer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostSdpRequest {
    pub name: String,
    pub id: String,
    pub sdp: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostCandidateRequest {
    pub name: String,
    pub id: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub ice: IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchQuery {
    pub name: String,
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl FetchQuery {
    /// The session id, treating `id=` as absent.
    pub fn session_id(&self) -> Option<&str> {
        self.id.as_deref().filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ices: Vec<IceCandidate>,
}

impl FetchResponse {
    pub fn is_empty(&self) -> bool {
        self.sdp.is_none() && self.ices.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQuery {
    pub name: String,
    pub id: String,
}

/// First frame on a duplex signaling socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsHeader {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsEndpoint {
    #[serde(default)]
    pub client_id: String,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsPacket {
    pub from: WsEndpoint,
    pub to: WsEndpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<IceCandidate>,
}

/// Control message carried on the `command` sub-channel. `lease` is the
/// generation of the lease the command belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    Connect { label: Label, lease: u64 },
    Disconnect { label: Label, lease: u64 },
    Eof { label: Label, lease: u64, offset: u64 },
}

impl Command {
    pub fn label(&self) -> Label {
        match self {
            Command::Connect { label, .. }
            | Command::Disconnect { label, .. }
            | Command::Eof { label, .. } => *label,
        }
    }

    pub fn lease(&self) -> u64 {
        match self {
            Command::Connect { lease, .. }
            | Command::Disconnect { lease, .. }
            | Command::Eof { lease, .. } => *lease,
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::{ChannelEvent, ConnectionEvent, ConnectionState, DataChannel, RtcApi, RtcConnection};
use crate::error::{TunnelError, to_transport_error};
use crate::proto::{IceCandidate, SdpType, SessionDescription};

/// `RtcApi` backed by webrtc-rs.
pub struct WebRtcApi {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcApi {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, TunnelError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(3)),
            Some(Duration::from_secs(10)),
            Some(Duration::from_millis(500)),
        );
        Self::with_setting_engine(setting, ice_servers)
    }

    pub fn with_setting_engine(
        setting: SettingEngine,
        ice_servers: Vec<String>,
    ) -> Result<Self, TunnelError> {
        Ok(Self {
            api: build_api(setting)?,
            ice_servers,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

fn build_api(setting: SettingEngine) -> Result<API, TunnelError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_transport_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_transport_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl RtcApi for WebRtcApi {
    async fn new_connection(&self) -> Result<Arc<dyn RtcConnection>, TunnelError> {
        let pc = self
            .api
            .new_peer_connection(self.configuration())
            .await
            .map_err(to_transport_error)?;
        Ok(Arc::new(WebRtcConnection::new(Arc::new(pc))))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl WebRtcConnection {
    fn new(pc: Arc<RTCPeerConnection>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let candidate_tx = events_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sender = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = sender.send(ConnectionEvent::LocalCandidate(from_rtc_candidate(
                            init,
                        )));
                    }
                    Err(err) => {
                        tracing::warn!(target = "tunnel", error = %err, "failed to encode local candidate");
                    }
                }
            })
        }));

        let state_tx = events_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sender = state_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "tunnel", ?state, "peer connection state changed");
                let mapped = match state {
                    RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
                        ConnectionState::New
                    }
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                };
                let _ = sender.send(ConnectionEvent::StateChanged(mapped));
            })
        }));

        let channel_tx = events_tx;
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let sender = channel_tx.clone();
            Box::pin(async move {
                tracing::trace!(target = "tunnel", label = dc.label(), "remote data channel announced");
                let channel: Arc<dyn DataChannel> = Arc::new(WebRtcDataChannel::new(dc));
                let _ = sender.send(ConnectionEvent::IncomingChannel(channel));
            })
        }));

        Self {
            pc,
            events: Mutex::new(Some(events_rx)),
        }
    }

    async fn local_description(&self) -> Result<SessionDescription, TunnelError> {
        let desc = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TunnelError::Transport("missing local description".into()))?;
        from_rtc_description(&desc)
    }
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn DataChannel>, TunnelError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(to_transport_error)?;
        Ok(Arc::new(WebRtcDataChannel::new(dc)))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TunnelError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(to_transport_error)?;
        self.pc
            .set_local_description(offer)
            .await
            .map_err(to_transport_error)?;
        self.local_description().await
    }

    async fn create_answer(&self) -> Result<SessionDescription, TunnelError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_transport_error)?;
        self.pc
            .set_local_description(answer)
            .await
            .map_err(to_transport_error)?;
        self.local_description().await
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), TunnelError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(to_transport_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TunnelError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(to_transport_error)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.pc.close().await.map_err(to_transport_error)
    }
}

struct WebRtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    events: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl WebRtcDataChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        let label = dc.label().to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let open_tx = events_tx.clone();
        dc.on_open(Box::new(move || {
            let sender = open_tx.clone();
            Box::pin(async move {
                let _ = sender.send(ChannelEvent::Open);
            })
        }));

        let message_tx = events_tx.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let sender = message_tx.clone();
            Box::pin(async move {
                let _ = sender.send(ChannelEvent::Message(msg.data));
            })
        }));

        let error_label = label.clone();
        dc.on_error(Box::new(move |err| {
            let label = error_label.clone();
            Box::pin(async move {
                tracing::warn!(target = "tunnel", %label, error = %err, "data channel error");
            })
        }));

        let close_tx = events_tx;
        dc.on_close(Box::new(move || {
            let sender = close_tx.clone();
            Box::pin(async move {
                let _ = sender.send(ChannelEvent::Close);
            })
        }));

        Self {
            dc,
            label,
            events: Mutex::new(Some(events_rx)),
        }
    }
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Bytes) -> Result<usize, TunnelError> {
        self.dc.send(&data).await.map_err(to_transport_error)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ChannelEvent>> {
        self.events.lock().take()
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.dc.close().await.map_err(to_transport_error)
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription, TunnelError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        other => {
            return Err(TunnelError::Transport(format!(
                "unsupported sdp type {other}"
            )));
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, TunnelError> {
    match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(|err| TunnelError::Parse(format!("invalid session description: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn rejects_unparseable_description() {
        let err = to_rtc_description(SessionDescription::offer("not sdp")).unwrap_err();
        assert!(matches!(err, TunnelError::Parse(_)));
    }

    #[test_timeout::timeout]
    fn candidate_fields_carry_over() {
        let candidate = from_rtc_candidate(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 1 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some("frag".into()),
        });
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.username_fragment.as_deref(), Some("frag"));
    }
}

//! Duplex signaling: every client keeps one socket open, announces itself
//! with a header frame, and then sends packets the relay forwards by their
//! `to` address.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use transport_tunnel::proto::{SdpType, WsHeader, WsPacket};

use crate::state::{DuplexClient, RelayState};

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();

    let header = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<WsHeader>(&text) {
                Ok(header) => break header,
                Err(e) => {
                    warn!("invalid signaling header: {}", e);
                    return;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(_)) | Some(Err(_)) | None => return,
        }
    };
    if header.id.is_empty() || header.name.is_empty() {
        warn!("signaling header without id or name");
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.register_client(
        &header.name,
        &header.id,
        DuplexClient {
            side: header.sdp_type,
            tx,
        },
    );
    info!(
        name = %header.name,
        client = %header.id,
        side = header.sdp_type.as_str(),
        "duplex client connected"
    );

    let mut send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut send_task => break,
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => forward(&state, &header, &text),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => forward(&state, &header, text),
                    Err(_) => debug!(client = %header.id, "ignoring non-UTF8 frame"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    send_task.abort();
    state.unregister_client(&header.name, &header.id);
    info!(name = %header.name, client = %header.id, "duplex client disconnected");
}

fn forward(state: &RelayState, header: &WsHeader, text: &str) {
    let mut packet: WsPacket = match serde_json::from_str(text) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(client = %header.id, "malformed signaling packet: {}", e);
            return;
        }
    };
    packet.from.client_id = header.id.clone();

    if packet.to.client_id.is_empty() {
        if header.sdp_type != SdpType::Offer {
            debug!(client = %header.id, "responder packet without destination");
            return;
        }
        match state.route_to_responder(&header.name, &packet.to.peer_id) {
            Some(responder) => packet.to.client_id = responder,
            None => {
                warn!(name = %header.name, session = %packet.to.peer_id, "no responder connected");
                return;
            }
        }
    }

    let Some(target) = state.client(&header.name, &packet.to.client_id) else {
        warn!(
            name = %header.name,
            to = %packet.to.client_id,
            "destination client not connected"
        );
        return;
    };
    match serde_json::to_string(&packet) {
        Ok(text) => {
            if target.tx.send(text).is_err() {
                debug!(to = %packet.to.client_id, "destination socket closing");
            }
        }
        Err(e) => warn!("failed to encode packet: {}", e),
    }
}

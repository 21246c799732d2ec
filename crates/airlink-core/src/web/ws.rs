//! WebSocket device event channel.
//!
//! Each socket is one device. On upgrade the device is registered, sent its
//! `welcome`, and from then on receives whatever the relay queues on its
//! [`Connection`]. Inbound frames are `register` and `heartbeat` only.

use std::net::SocketAddr;

use axum::{
    extract::{
        connect_info::ConnectInfo,
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::Response,
    Extension,
};
use futures::{Sink, SinkExt, StreamExt};

use crate::device::Connection;
use crate::notify::{ClientEvent, ServerEvent};

use super::state::{AppState, SharedState};

/// Address reported when neither a proxy header nor the peer is known.
const UNKNOWN_ADDRESS: &str = "unknown";

/// GET /ws - Open the device event channel.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    headers: HeaderMap,
    peer: Option<Extension<ConnectInfo<SocketAddr>>>,
) -> Response {
    let ip = client_ip(&headers, peer.map(|Extension(ConnectInfo(addr))| addr));
    ws.on_upgrade(move |socket| session(socket, state, ip))
}

/// First `X-Forwarded-For` entry, else the peer address.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

async fn session(socket: WebSocket, state: SharedState, ip: String) {
    let (connection, mut events) = Connection::new();
    let connection_id = connection.id();
    let device_id = state.devices.register_connection(ip.clone(), connection);

    let (mut sink, mut stream) = socket.split();

    // The registry has already queued a `devices` snapshot; `welcome` goes
    // out first, straight on the socket.
    let welcome = ServerEvent::Welcome {
        device_id: device_id.clone(),
        ip,
        url: state.host_url.clone(),
    };
    if send_event(&mut sink, &welcome).await.is_err() {
        state.devices.remove_connection(connection_id);
        return;
    }

    let mut outbound = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if send_event(&mut sink, &event).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let inbound_state = state.clone();
    let own_id = device_id.clone();
    let mut inbound = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => handle_frame(&inbound_state, &own_id, text.as_str()),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(device_id = %own_id, error = %e, "websocket read failed");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut outbound => inbound.abort(),
        _ = &mut inbound => outbound.abort(),
    }

    state.devices.remove_connection(connection_id);
    tracing::debug!(device_id = %device_id, connection = %connection_id, "event channel closed");
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(event = event.name(), error = %e, "failed to encode event");
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await.map_err(|_| ())
}

/// Apply one inbound frame from `device_id`.
///
/// Frames naming another device are ignored: a device may only describe
/// itself.
fn handle_frame(state: &AppState, device_id: &str, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::debug!(device_id, error = %e, "ignoring unparseable frame");
            return;
        }
    };

    match event {
        ClientEvent::Register { device_id: claimed, name } => {
            if claimed != device_id {
                tracing::debug!(device_id, claimed = %claimed, "ignoring register for another device");
                return;
            }
            state.devices.set_name(device_id, name.as_deref());
        }
        ClientEvent::Heartbeat { device_id: claimed } => {
            if claimed == device_id {
                state.devices.touch(device_id);
            }
        }
    }
}

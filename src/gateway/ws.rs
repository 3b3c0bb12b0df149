//! WebSocket endpoints for devices and the enrollment assistant.
//!
//! ```text
//! GET /ws/device?guid=<guid>   one socket per device, RpcFrame JSON both ways
//!     [&hostName=..&domainName=..&ipAddress=..&subnetMask=..&defaultGateway=..]
//! GET /ws/assistant            single shared socket, replies routed by nodeId
//! ```
//!
//! Each socket gets a writer task fed by a [`ChannelTransport`]; the read
//! half is pumped here and handed to the correlator.

use super::AppState;
use crate::device::{ChannelTransport, DeviceTransport, NetworkInfo};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connect parameters. Besides its GUID a device may report its own
/// network settings; maintenance falls back to them when a trigger
/// carries no data.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceQuery {
    pub guid: Option<String>,
    pub host_name: Option<String>,
    pub domain_name: Option<String>,
    pub ip_address: Option<String>,
    pub subnet_mask: Option<String>,
    pub default_gateway: Option<String>,
    pub primary_dns: Option<String>,
    pub secondary_dns: Option<String>,
}

impl DeviceQuery {
    pub fn reported_network(&self) -> NetworkInfo {
        let given = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        NetworkInfo {
            host_name: given(&self.host_name),
            domain_name: given(&self.domain_name),
            ip_address: given(&self.ip_address),
            subnet_mask: given(&self.subnet_mask),
            default_gateway: given(&self.default_gateway),
            primary_dns: given(&self.primary_dns),
            secondary_dns: given(&self.secondary_dns),
            dhcp_enabled: None,
        }
    }
}

/// GET /ws/device: WebSocket upgrade for a device connection
pub async fn handle_ws_device(
    State(state): State<AppState>,
    Query(params): Query<DeviceQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let network = params.reported_network();
    let guid = params.guid.filter(|g| !g.trim().is_empty());
    ws.on_upgrade(move |socket| device_socket(socket, state, guid, network))
}

/// GET /ws/assistant: WebSocket upgrade for the enrollment assistant
pub async fn handle_ws_assistant(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| assistant_socket(socket, state))
}

/// Text frames for UTF-8 payloads, binary otherwise.
fn outbound_message(bytes: Vec<u8>) -> Message {
    match String::from_utf8(bytes) {
        Ok(text) => Message::Text(text.into()),
        Err(e) => Message::Binary(e.into_bytes().into()),
    }
}

fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: UnboundedReceiver<Vec<u8>>,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(bytes) = outbound.recv().await {
            if let Err(e) = sink.send(outbound_message(bytes)).await {
                debug!("{label}: write failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Payload bytes of a data frame; `None` ends the read loop.
fn inbound_payload(message: Message) -> Option<Option<Vec<u8>>> {
    match message {
        Message::Text(text) => Some(Some(text.as_bytes().to_vec())),
        Message::Binary(bytes) => Some(Some(bytes.to_vec())),
        Message::Close(_) => None,
        _ => Some(None),
    }
}

async fn device_socket(
    socket: WebSocket,
    state: AppState,
    guid: Option<String>,
    network: NetworkInfo,
) {
    let session_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();
    let (transport, outbound) = ChannelTransport::new();
    let connection = state
        .registry
        .register(session_id.clone(), Arc::new(transport), guid);
    connection.update_network(|cached| *cached = network);
    let writer = spawn_writer(sink, outbound, format!("session {session_id}"));

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                warn!("session {session_id}: socket error: {e}");
                break;
            }
        };
        match inbound_payload(message) {
            Some(Some(raw)) => {
                if !state.invoker.handle_frame(&connection, &raw) {
                    debug!("session {session_id}: frame resolved nothing");
                }
            }
            Some(None) => {}
            None => break,
        }
    }

    state.registry.remove_connection(&connection);
    writer.abort();
    info!("session {session_id}: device socket closed");
}

async fn assistant_socket(socket: WebSocket, state: AppState) {
    let (sink, mut stream) = socket.split();
    let (transport, outbound) = ChannelTransport::new();
    let transport: Arc<dyn DeviceTransport> = Arc::new(transport);
    state.assistant.attach(Arc::clone(&transport));
    let writer = spawn_writer(sink, outbound, "assistant".into());

    while let Some(Ok(message)) = stream.next().await {
        match inbound_payload(message) {
            Some(Some(raw)) => {
                state.assistant.handle_message(&raw);
            }
            Some(None) => {}
            None => break,
        }
    }

    state.assistant.release(&transport);
    writer.abort();
}

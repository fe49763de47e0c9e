//! Agent socket lifecycle: registration, outbound writer, inbound reply pump

use crate::models::ErrorResponse;
use crate::state::ProxyState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use backhaul_control::{SocketId, TunnelSocket};
use backhaul_proto::{Capability, TunnelReply};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Deserialize)]
pub struct BackendParams {
    capability: Option<String>,
}

/// Peer address, present when the router is served with connect info
type Peer = Option<Extension<ConnectInfo<SocketAddr>>>;

fn peer_addr(peer: Peer) -> Option<SocketAddr> {
    peer.map(|Extension(ConnectInfo(addr))| addr)
}

/// `GET /ws/backend[?capability=stream]`
pub async fn backend_ws(
    ws: WebSocketUpgrade,
    peer: Peer,
    Query(params): Query<BackendParams>,
    State(state): State<ProxyState>,
) -> Response {
    let capability = match params.capability.as_deref() {
        None => Capability::Regular,
        Some(raw) => match raw.parse::<Capability>() {
            Ok(capability) => capability,
            Err(e) => {
                warn!("Rejecting agent with bad capability: {}", e);
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: e.to_string(),
                    }),
                )
                    .into_response();
            }
        },
    };

    let remote_addr = peer_addr(peer);
    ws.on_upgrade(move |socket| serve_agent(socket, state, capability, remote_addr))
}

/// `GET /ws/stream`
pub async fn stream_ws(
    ws: WebSocketUpgrade,
    peer: Peer,
    State(state): State<ProxyState>,
) -> Response {
    let remote_addr = peer_addr(peer);
    ws.on_upgrade(move |socket| serve_agent(socket, state, Capability::Stream, remote_addr))
}

/// `GET /ws/client`: accepted for older agents, frames are drained unrouted
pub async fn client_ws(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(drain_client)
}

async fn drain_client(socket: WebSocket) {
    info!("Client socket connected (no routing)");
    let (_, mut receiver) = socket.split();
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => debug!("Client socket frame: {}", text.as_str()),
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    info!("Client socket disconnected");
}

async fn serve_agent(
    socket: WebSocket,
    state: ProxyState,
    capability: Capability,
    remote_addr: Option<SocketAddr>,
) {
    let (sink, stream) = socket.split();
    run_agent_socket(sink, stream, state, capability, remote_addr).await;
}

/// Drive one agent connection until it closes.
///
/// Registers the socket, spawns the writer task draining its outbound
/// channel, and routes every inbound reply into the correlation table. On
/// exit the socket is unregistered and its open entries released.
pub async fn run_agent_socket<W, R>(
    mut sink: W,
    mut stream: R,
    state: ProxyState,
    capability: Capability,
    remote_addr: Option<SocketAddr>,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let (socket, mut outbound_rx) = TunnelSocket::new(capability);
    let socket = socket.with_remote_addr(remote_addr);
    let socket_id = socket.id();
    state.registry.register(socket).await;
    info!(socket_id = %socket_id, capability = %capability, remote_addr = ?remote_addr, "Agent connected");

    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                debug!(socket_id = %socket_id, "Agent socket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => pump_frame(&state, socket_id, text.as_str()),
                    Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => pump_frame(&state, socket_id, text),
                        Err(_) => warn!(socket_id = %socket_id, "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(socket_id = %socket_id, "Agent closed the socket");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(socket_id = %socket_id, "Agent socket read error: {}", e);
                        break;
                    }
                }
            }
            _ = &mut writer => {
                debug!(socket_id = %socket_id, "Agent writer task ended");
                break;
            }
        }
    }

    state.registry.unregister(socket_id).await;
    writer.abort();
    let released = state
        .table
        .release_socket(socket_id, state.config.disconnect_policy);

    info!(
        socket_id = %socket_id,
        capability = %capability,
        streams_closed = released.streams_closed,
        singles_failed = released.singles_failed,
        "Agent disconnected"
    );
}

fn pump_frame(state: &ProxyState, socket_id: SocketId, text: &str) {
    match TunnelReply::from_json(text) {
        Ok(reply) => {
            trace!(socket_id = %socket_id, request_id = %reply.id(), "Reply frame");
            state.table.route(reply);
        }
        Err(e) => {
            warn!(socket_id = %socket_id, "Ignoring malformed reply frame: {}", e);
        }
    }
}

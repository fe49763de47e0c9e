//! HTTP dispatcher: turns an inbound request into a tunnel call
//!
//! Single-mode requests fan out to every regular agent and resolve with the
//! first reply. Stream-mode requests (SSE) go to the earliest registered
//! stream agent that accepts them and are handed to the bridge.
//!
//! Sends never wait on an agent. A stalled agent (full outbound queue) is
//! skipped for the request at hand and a dead one is evicted.

use crate::bridge;
use crate::config::path_in_namespace;
use crate::error::ProxyError;
use crate::state::ProxyState;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use backhaul_control::{CallError, SendError, SocketId};
use backhaul_proto::{filter_forwarded_headers, Capability, Mode, TunnelMessage, TunnelReply};
use http_body_util::LengthLimitError;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Fallback handler for every path not claimed by another route
pub async fn dispatch(
    State(state): State<ProxyState>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();

    let prefix = state.config.normalized_prefix();
    let (path, endpoint) = endpoint_for(&parts.uri, prefix.as_deref())?;

    let namespace = state.config.normalized_stream_namespace();
    let mode = classify_mode(&parts.headers, &path, namespace.as_deref());

    let message_body = read_body(&parts.method, body, state.config.max_body_bytes).await?;
    let forwarded = filter_forwarded_headers(
        parts
            .headers
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str(), v))),
    );

    let message = TunnelMessage::new(mode, parts.method.as_str(), endpoint)
        .with_body(message_body)
        .with_headers(forwarded);

    info!(
        request_id = %message.id,
        method = %message.method,
        endpoint = %message.endpoint,
        mode = %mode,
        "Dispatching request"
    );

    match mode {
        Mode::Single => dispatch_single(&state, message).await,
        Mode::Stream => dispatch_stream(&state, message).await,
    }
}

/// Split the request URI into the classification path and the agent endpoint.
///
/// With a prefix configured, paths outside it are not tunneled and the prefix
/// is stripped. The query string stays on the endpoint.
pub(crate) fn endpoint_for(uri: &Uri, prefix: Option<&str>) -> Result<(String, String), ProxyError> {
    let raw_path = uri.path();

    let path = match prefix {
        Some(prefix) => {
            if !path_in_namespace(raw_path, prefix) {
                return Err(ProxyError::NotFound);
            }
            let stripped = &raw_path[prefix.len()..];
            if stripped.is_empty() {
                "/".to_string()
            } else {
                stripped.to_string()
            }
        }
        None => raw_path.to_string(),
    };

    let endpoint = match uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.clone(),
    };

    Ok((path, endpoint))
}

/// `stream` iff the client accepts SSE and, when a stream namespace is
/// configured, the path lies inside it.
pub(crate) fn classify_mode(headers: &HeaderMap, path: &str, namespace: Option<&str>) -> Mode {
    let accepts_sse = headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains("text/event-stream"));

    if !accepts_sse {
        return Mode::Single;
    }

    match namespace {
        Some(namespace) if !path_in_namespace(path, namespace) => Mode::Single,
        _ => Mode::Stream,
    }
}

async fn read_body(method: &Method, body: Body, limit: usize) -> Result<Option<Value>, ProxyError> {
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        return Ok(None);
    }

    let bytes = match axum::body::to_bytes(body, limit).await {
        Ok(bytes) => bytes,
        Err(e) if exceeded_limit(&e) => return Err(ProxyError::BodyTooLarge { limit }),
        Err(e) => return Err(ProxyError::InvalidBody(e.to_string())),
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| ProxyError::InvalidBody(e.to_string()))
}

fn exceeded_limit(err: &axum::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

async fn dispatch_single(state: &ProxyState, message: TunnelMessage) -> Result<Response, ProxyError> {
    let deadline = Instant::now() + state.config.request_timeout;

    let targets = state.registry.regular_sockets().await;
    if targets.is_empty() {
        return Err(ProxyError::NoAgents(Capability::Regular));
    }

    let frame = message.to_json()?;
    let target_ids: Vec<SocketId> = targets.iter().map(|socket| socket.id()).collect();
    let mut call = state.table.open_single(message.id.clone(), &target_ids);

    let mut accepted = 0;
    for socket in &targets {
        match socket.send_text(frame.clone()) {
            Ok(()) => accepted += 1,
            Err(e) => {
                call.abandon(socket.id());
                handle_send_failure(state, &message.id, socket.id(), e).await;
            }
        }
    }

    if accepted == 0 {
        return Err(ProxyError::AllSendsFailed);
    }
    debug!(request_id = %message.id, fanout = accepted, "Request sent to agents");

    match tokio::time::timeout_at(deadline, call.wait()).await {
        Ok(Ok(reply)) => Ok(reply_response(reply)),
        Ok(Err(CallError::Disconnected)) => Err(ProxyError::AgentDisconnected),
        Ok(Err(CallError::NoTargets)) => Err(ProxyError::AllSendsFailed),
        Err(_) => {
            warn!(request_id = %message.id, "Timed out waiting for agent response");
            Err(ProxyError::Timeout)
        }
    }
}

async fn dispatch_stream(state: &ProxyState, message: TunnelMessage) -> Result<Response, ProxyError> {
    let candidates = state.registry.stream_sockets().await;
    if candidates.is_empty() {
        return Err(ProxyError::NoAgents(Capability::Stream));
    }

    let frame = message.to_json()?;
    for socket in candidates {
        let call = state.table.open_stream(message.id.clone(), socket.id());

        match socket.send_text(frame.clone()) {
            Ok(()) => {
                debug!(request_id = %message.id, socket_id = %socket.id(), "Stream request sent");
                return Ok(bridge::sse_response(call, state.config.heartbeat_interval));
            }
            Err(e) => {
                drop(call);
                handle_send_failure(state, &message.id, socket.id(), e).await;
            }
        }
    }

    Err(ProxyError::AllSendsFailed)
}

/// A closed channel means the agent is gone and it is evicted. A full one
/// means it is stalled: it is skipped for this request and stays registered.
async fn handle_send_failure(state: &ProxyState, request_id: &str, socket_id: SocketId, err: SendError) {
    match err {
        SendError::Closed(_) => {
            warn!(request_id = %request_id, socket_id = %socket_id, "Evicting dead agent: {}", err);
            state.registry.unregister(socket_id).await;
        }
        SendError::Full(_) => {
            warn!(request_id = %request_id, socket_id = %socket_id, "Skipping stalled agent: {}", err);
        }
    }
}

/// HTTP response for a terminal agent reply
pub(crate) fn reply_response(reply: TunnelReply) -> Response {
    match reply {
        TunnelReply::Response {
            status_code, data, ..
        } => {
            let status = match status_code {
                None => StatusCode::INTERNAL_SERVER_ERROR,
                Some(code) => StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
            };
            let body = data.unwrap_or_else(|| json!({}));
            (status, Json(body)).into_response()
        }
        TunnelReply::Chunk { .. } | TunnelReply::End { .. } => {
            (StatusCode::BAD_GATEWAY, Json(json!({}))).into_response()
        }
    }
}

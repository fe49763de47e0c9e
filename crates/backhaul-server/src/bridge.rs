//! SSE bridge: turns a stream call's chunk queue into a `text/event-stream` body

use axum::{
    body::Body,
    http::{header, HeaderValue},
    response::Response,
};
use backhaul_control::{StreamCall, StreamChunk};
use backhaul_proto::SSE_DELIMITER;
use bytes::Bytes;
use std::convert::Infallible;
use std::time::Duration;
use tracing::debug;

/// First bytes sent on every stream, so clients see the response open at once
pub const PRIMING_COMMENT: &str = ": connected\n\n";

/// Sent whenever the stream stays idle for a heartbeat interval
pub const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

enum BridgeState {
    Priming(StreamCall),
    Open(StreamCall),
}

/// Build the SSE response for an open stream call.
///
/// The call guard moves into the body stream, so its correlation entry is
/// closed when the stream finishes and when the HTTP client goes away and
/// the body is dropped.
pub fn sse_response(call: StreamCall, heartbeat: Duration) -> Response {
    let body = futures::stream::unfold(BridgeState::Priming(call), move |state| async move {
        match state {
            BridgeState::Priming(call) => Some((
                Ok::<_, Infallible>(Bytes::from_static(PRIMING_COMMENT.as_bytes())),
                BridgeState::Open(call),
            )),
            BridgeState::Open(mut call) => match tokio::time::timeout(heartbeat, call.recv()).await
            {
                Err(_) => Some((
                    Ok(Bytes::from_static(KEEP_ALIVE_COMMENT.as_bytes())),
                    BridgeState::Open(call),
                )),
                Ok(Some(StreamChunk::Event(event))) => {
                    Some((Ok(Bytes::from(frame_chunk(event))), BridgeState::Open(call)))
                }
                Ok(Some(StreamChunk::End)) => {
                    debug!(request_id = %call.id(), "Stream completed");
                    None
                }
                Ok(None) => {
                    debug!(request_id = %call.id(), "Stream owner went away");
                    None
                }
            },
        }
    });

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    response
}

/// Terminate a chunk with the SSE delimiter unless it already ends with one
pub fn frame_chunk(mut event: String) -> String {
    if event.ends_with(SSE_DELIMITER) {
        event
    } else if event.ends_with('\n') {
        event.push('\n');
        event
    } else {
        event.push_str(SSE_DELIMITER);
        event
    }
}

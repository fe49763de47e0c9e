//! Proxy-bound reply frames
//!
//! Agents answer over the same socket they received the request on. A reply is
//! either terminal (`{id, status_code, data}`) or part of a stream
//! (`{id, mode: "stream", event, final}`, repeated, last one `final: true`).

use crate::messages::Mode;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use thiserror::Error;

/// Errors decoding a reply frame
#[derive(Debug, Error)]
pub enum ReplyDecodeError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Stream frame for {0} carries neither an event nor a final marker")]
    EmptyStreamFrame(String),
}

/// A decoded reply frame
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelReply {
    /// Terminal single-shot response
    Response {
        id: String,
        status_code: Option<u16>,
        data: Option<Value>,
    },
    /// One SSE chunk of a streaming response
    Chunk { id: String, event: String },
    /// Stream completion sentinel
    End { id: String },
}

#[derive(Deserialize)]
struct RawReply {
    id: String,
    #[serde(default)]
    mode: Option<Mode>,
    #[serde(default, deserialize_with = "lenient_status")]
    status_code: Option<u16>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    event: Option<Value>,
    #[serde(default, rename = "final")]
    is_final: Option<bool>,
}

/// Status substituted for a `status_code` that is present but not a usable
/// integer (a string, a float, negative or above 65535)
pub const UNUSABLE_STATUS: u16 = 502;

fn lenient_status<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_u64()
                .and_then(|code| u16::try_from(code).ok())
                .unwrap_or(UNUSABLE_STATUS),
        ),
    })
}

impl TunnelReply {
    /// Correlation id this reply belongs to
    pub fn id(&self) -> &str {
        match self {
            TunnelReply::Response { id, .. } => id,
            TunnelReply::Chunk { id, .. } => id,
            TunnelReply::End { id } => id,
        }
    }

    /// Decode one text frame
    pub fn from_json(text: &str) -> Result<Self, ReplyDecodeError> {
        let raw: RawReply = serde_json::from_str(text)?;

        let is_stream =
            raw.mode == Some(Mode::Stream) || raw.event.is_some() || raw.is_final.is_some();

        if !is_stream {
            return Ok(TunnelReply::Response {
                id: raw.id,
                status_code: raw.status_code,
                data: raw.data,
            });
        }

        if raw.is_final == Some(true) {
            return Ok(TunnelReply::End { id: raw.id });
        }

        match raw.event {
            Some(Value::String(event)) => Ok(TunnelReply::Chunk { id: raw.id, event }),
            Some(Value::Null) | None => Err(ReplyDecodeError::EmptyStreamFrame(raw.id)),
            Some(other) => Ok(TunnelReply::Chunk {
                id: raw.id,
                event: other.to_string(),
            }),
        }
    }

    /// Encode to the wire shape (used by agents)
    pub fn to_value(&self) -> Value {
        match self {
            TunnelReply::Response {
                id,
                status_code,
                data,
            } => json!({
                "id": id,
                "status_code": status_code,
                "data": data,
            }),
            TunnelReply::Chunk { id, event } => json!({
                "id": id,
                "mode": "stream",
                "event": event,
                "final": false,
            }),
            TunnelReply::End { id } => json!({
                "id": id,
                "mode": "stream",
                "final": true,
            }),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

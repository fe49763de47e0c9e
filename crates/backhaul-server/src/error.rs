//! Proxy error types and their HTTP mapping

use crate::models::ErrorResponse;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use backhaul_proto::Capability;
use thiserror::Error;

/// Failures surfaced to HTTP callers of the tunnel
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("No agents available")]
    NoAgents(Capability),

    #[error("No agent accepted the request")]
    AllSendsFailed,

    #[error("Timeout waiting for agent response")]
    Timeout,

    #[error("Agent disconnected before replying")]
    AgentDisconnected,

    #[error("Invalid JSON body: {0}")]
    InvalidBody(String),

    #[error("Request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Failed to encode tunnel message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Not found")]
    NotFound,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoAgents(_) | ProxyError::AllSendsFailed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::AgentDisconnected => StatusCode::BAD_GATEWAY,
            ProxyError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Errors starting or running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Failed to bind to {address}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

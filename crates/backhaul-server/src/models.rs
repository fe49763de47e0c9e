//! Response bodies of the proxy's own endpoints

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Health and introspection report
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// Proxy liveness
    pub status: String,
    /// Connected request/response agents
    pub regular_clients: usize,
    /// Connected streaming agents
    pub stream_clients: usize,
    /// SSE calls in flight
    pub active_streams: usize,
    /// Single-mode calls awaiting a reply
    pub pending_requests: usize,
    /// Service version
    pub version: String,
    /// Tunnel wire protocol version
    pub protocol_version: u32,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

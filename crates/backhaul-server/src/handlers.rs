//! Handlers for the proxy's own endpoints

use crate::models::HealthResponse;
use crate::state::ProxyState;
use crate::ApiDoc;
use axum::{extract::State, Json};
use tracing::debug;
use utoipa::OpenApi;

/// Health check and connection counts
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Proxy is up", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health(State(state): State<ProxyState>) -> Json<HealthResponse> {
    let counts = state.registry.counts().await;
    debug!(
        regular = counts.regular,
        stream = counts.stream,
        "Health check"
    );

    Json(HealthResponse {
        status: "ok".to_string(),
        regular_clients: counts.regular,
        stream_clients: counts.stream,
        active_streams: state.table.active_streams(),
        pending_requests: state.table.pending_single(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: backhaul_proto::PROTOCOL_VERSION,
    })
}

/// OpenAPI document for the endpoints above
pub async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

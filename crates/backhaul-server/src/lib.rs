//! Reverse tunneling HTTP proxy
//!
//! Agents behind NAT dial in over WebSocket and register as `regular` or
//! `stream` sockets. Every HTTP request not claimed by the proxy's own routes
//! is wrapped in a tunnel message, fanned out to the agents and answered with
//! the first reply, or bridged into a Server-Sent Events response.
pub mod bridge;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod pump;
pub mod state;

pub use config::{ProxyConfig, TlsConfig};
pub use error::{ProxyError, ServerError};
pub use state::ProxyState;

use axum::{
    http::{header, Method},
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use utoipa::OpenApi;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Backhaul Proxy API",
        version = "0.1.0",
        description = "Endpoints served by the tunnel proxy itself; all other paths are tunneled to agents"
    ),
    paths(handlers::health),
    components(schemas(models::HealthResponse, models::ErrorResponse)),
    tags(
        (name = "system", description = "Proxy health and introspection")
    )
)]
pub struct ApiDoc;

/// The tunnel proxy server
pub struct ProxyServer {
    state: ProxyState,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            state: ProxyState::new(config),
        }
    }

    /// Shared state, for embedding and tests
    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Build the router with all routes
    pub fn build_router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Run until the process is stopped
    pub async fn start(self) -> Result<(), ServerError> {
        self.start_with_shutdown(std::future::pending()).await
    }

    /// Run until `shutdown` completes, then drain in-flight connections
    pub async fn start_with_shutdown<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router();
        let config = self.state.config.clone();
        let addr = config.bind_addr;

        match &config.tls {
            Some(tls) => {
                let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    &tls.cert_path,
                    &tls.key_path,
                )
                .await
                .map_err(|e| ServerError::TlsError(format!("Failed to load certificate: {}", e)))?;

                let handle = axum_server::Handle::new();
                let shutdown_handle = handle.clone();
                tokio::spawn(async move {
                    shutdown.await;
                    shutdown_handle.graceful_shutdown(None);
                });

                info!("Tunnel proxy listening on https://{}", addr);
                axum_server::bind_rustls(addr, rustls_config)
                    .handle(handle)
                    .serve(router.into_make_service_with_connect_info::<SocketAddr>())
                    .await
                    .map_err(|e| bind_error(addr, e))?;
            }
            None => {
                let listener = tokio::net::TcpListener::bind(addr)
                    .await
                    .map_err(|e| bind_error(addr, e))?;

                info!("Tunnel proxy listening on http://{}", listener.local_addr()?);
                info!("Agents connect to ws://{}/ws/backend", addr);

                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(shutdown)
                .await
                .map_err(|e| {
                    error!("Server error: {}", e);
                    ServerError::IoError(e)
                })?;
            }
        }

        info!("Tunnel proxy stopped");
        Ok(())
    }
}

fn bind_error(addr: SocketAddr, e: std::io::Error) -> ServerError {
    ServerError::BindError {
        address: addr.ip().to_string(),
        port: addr.port(),
        reason: e.to_string(),
    }
}

/// Assemble the proxy router over `state`
pub fn build_router(state: ProxyState) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/openapi.json", get(handlers::openapi))
        .route("/ws/backend", get(pump::backend_ws))
        .route("/ws/stream", get(pump::stream_ws))
        .route("/ws/client", get(pump::client_ws));

    if let Some(prefix) = state.config.normalized_prefix() {
        router = router.route(&format!("{}/health", prefix), get(handlers::health));
    }

    let enable_cors = state.config.enable_cors;
    let mut router = router
        .fallback(dispatcher::dispatch)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        router = router.layer(
            CorsLayer::new()
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                    Method::PATCH,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
                .allow_origin(Any),
        );
    }

    router
}

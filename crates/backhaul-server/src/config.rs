//! Proxy server configuration

use backhaul_control::DisconnectPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default deadline for single-mode calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle interval before a keep-alive comment is sent on an SSE stream
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Default cap on buffered request bodies (2 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// PEM certificate/key pair for serving HTTPS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind the HTTP(S) listener
    pub bind_addr: SocketAddr,
    /// Hard deadline for single-mode calls, measured from dispatch
    pub request_timeout: Duration,
    /// Idle time before an SSE keep-alive comment
    pub heartbeat_interval: Duration,
    /// Only tunnel paths under this prefix, stripping it (e.g. `/proxy`)
    pub path_prefix: Option<String>,
    /// When set, SSE requests are streamed only under this path namespace
    pub stream_namespace: Option<String>,
    /// How single calls react when their last target socket disconnects
    pub disconnect_policy: DisconnectPolicy,
    /// Largest request body accepted for tunneling
    pub max_body_bytes: usize,
    /// Enable permissive CORS (for development)
    pub enable_cors: bool,
    /// Serve HTTPS instead of plain HTTP
    pub tls: Option<TlsConfig>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            path_prefix: None,
            stream_namespace: None,
            disconnect_policy: DisconnectPolicy::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            enable_cors: false,
            tls: None,
        }
    }
}

impl ProxyConfig {
    /// `path_prefix` as `/segment` with no trailing slash, `None` for empty or `/`
    pub fn normalized_prefix(&self) -> Option<String> {
        self.path_prefix.as_deref().and_then(normalize_namespace)
    }

    pub fn normalized_stream_namespace(&self) -> Option<String> {
        self.stream_namespace.as_deref().and_then(normalize_namespace)
    }
}

fn normalize_namespace(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("/{}", trimmed))
    }
}

/// Whether `path` equals `namespace` or lies beneath it
pub(crate) fn path_in_namespace(path: &str, namespace: &str) -> bool {
    match path.strip_prefix(namespace) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

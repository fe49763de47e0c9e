//! Agent configuration

use crate::error::AgentError;
use backhaul_proto::Capability;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Proxy base URL (`ws://host:port`) or full socket URL (`ws://host:port/ws/stream`)
    pub proxy_url: String,
    /// Pool to register with
    pub capability: Capability,
    /// Base URL requests are replayed against (`http://127.0.0.1:3000`)
    pub origin_url: String,
    /// Timeout for a single-mode origin request
    pub request_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Give up after this many consecutive failed connects (0 = never)
    pub max_attempts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_url: "ws://127.0.0.1:8000".to_string(),
            capability: Capability::Regular,
            origin_url: "http://127.0.0.1:3000".to_string(),
            request_timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

impl AgentConfig {
    /// WebSocket URL to dial.
    ///
    /// A bare proxy URL gets the agent path for the configured capability.
    /// An explicit path is used as given.
    pub fn socket_url(&self) -> Result<Url, AgentError> {
        let mut url = Url::parse(&self.proxy_url)
            .map_err(|e| AgentError::InvalidUrl(format!("{}: {}", self.proxy_url, e)))?;

        match url.scheme() {
            "ws" | "wss" => {}
            "http" => set_scheme(&mut url, "ws")?,
            "https" => set_scheme(&mut url, "wss")?,
            other => {
                return Err(AgentError::InvalidUrl(format!(
                    "unsupported scheme '{}' in {}",
                    other, self.proxy_url
                )))
            }
        }

        if url.path().is_empty() || url.path() == "/" {
            match self.capability {
                Capability::Regular => url.set_path("/ws/backend"),
                Capability::Stream => url.set_path("/ws/stream"),
            }
        }

        Ok(url)
    }

    pub fn origin_base(&self) -> Result<Url, AgentError> {
        Url::parse(&self.origin_url)
            .map_err(|e| AgentError::InvalidUrl(format!("{}: {}", self.origin_url, e)))
    }
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<(), AgentError> {
    url.set_scheme(scheme)
        .map_err(|_| AgentError::InvalidUrl(format!("cannot use scheme {} for {}", scheme, url)))
}

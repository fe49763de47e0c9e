use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Origin request failed: {0}")]
    Origin(#[from] reqwest::Error),

    #[error("Unsupported method: {0}")]
    InvalidMethod(String),

    #[error("Gave up after {0} connection attempts")]
    MaxAttempts(u32),
}

//! Protocol message types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// How the agent is expected to answer a request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One terminal `{id, status_code, data}` reply
    #[default]
    Single,
    /// Zero or more event chunks followed by a `final` marker
    Stream,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Single => "single",
            Mode::Stream => "stream",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability an agent socket registers with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Plain request/response agent (fan-out target)
    #[default]
    Regular,
    /// Streaming agent (single target per SSE request)
    Stream,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Regular => "regular",
            Capability::Stream => "stream",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "regular" | "single" => Ok(Capability::Regular),
            "stream" | "streaming" => Ok(Capability::Stream),
            other => Err(format!("unknown capability: {}", other)),
        }
    }
}

/// Agent-bound request envelope
///
/// The field names are the wire names: `{id, mode, endpoint, method, message, headers}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TunnelMessage {
    /// Correlation key, unique per in-flight request
    pub id: String,
    #[serde(default)]
    pub mode: Mode,
    /// Request path (with query string), always starting with `/`
    pub endpoint: String,
    /// Upper-case HTTP method
    pub method: String,
    /// Optional opaque JSON body
    #[serde(default)]
    pub message: Option<Value>,
    /// Allow-listed request headers, lower-cased names
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl TunnelMessage {
    /// Create a message with a fresh correlation id
    pub fn new(mode: Mode, method: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: new_request_id(),
            mode,
            endpoint: normalize_endpoint(&endpoint.into()),
            method: method.into().to_ascii_uppercase(),
            message: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: Option<Value>) -> Self {
        self.message = body;
        self
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Generate a globally unique correlation id
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Ensure an endpoint begins with exactly one `/`
pub fn normalize_endpoint(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

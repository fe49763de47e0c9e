//! Origins: where an agent replays tunneled requests

use crate::error::AgentError;
use async_trait::async_trait;
use backhaul_proto::{Mode, TunnelMessage, SSE_DELIMITER};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// What an origin produced for one request
pub enum OriginReply {
    /// Terminal answer
    Single { status: u16, data: Value },
    /// SSE events, each terminated by a blank line
    Stream(BoxStream<'static, Result<String, AgentError>>),
}

impl std::fmt::Debug for OriginReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginReply::Single { status, data } => f
                .debug_struct("Single")
                .field("status", status)
                .field("data", data)
                .finish(),
            OriginReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Handles tunneled requests on the agent side
#[async_trait]
pub trait Origin: Send + Sync + 'static {
    async fn handle(&self, message: TunnelMessage) -> Result<OriginReply, AgentError>;
}

/// Origin backed by a local HTTP service
#[derive(Debug, Clone)]
pub struct HttpOrigin {
    client: reqwest::Client,
    base_url: Url,
    request_timeout: Duration,
}

impl HttpOrigin {
    pub fn new(base_url: Url, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            request_timeout,
        }
    }

    fn target_url(&self, endpoint: &str) -> Result<Url, AgentError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{}{}", base, endpoint))
            .map_err(|e| AgentError::InvalidUrl(format!("{}{}: {}", base, endpoint, e)))
    }
}

#[async_trait]
impl Origin for HttpOrigin {
    async fn handle(&self, message: TunnelMessage) -> Result<OriginReply, AgentError> {
        let method = reqwest::Method::from_bytes(message.method.as_bytes())
            .map_err(|_| AgentError::InvalidMethod(message.method.clone()))?;
        let url = self.target_url(&message.endpoint)?;
        debug!(request_id = %message.id, %method, %url, "Forwarding to origin");

        let mut request = self.client.request(method, url);
        for (name, value) in &message.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &message.message {
            request = request.json(body);
        }

        match message.mode {
            Mode::Single => {
                let response = request.timeout(self.request_timeout).send().await?;
                let status = response.status().as_u16();
                let bytes = response.bytes().await?;
                Ok(OriginReply::Single {
                    status,
                    data: body_to_json(&bytes),
                })
            }
            Mode::Stream => {
                let response = request.header("accept", "text/event-stream").send().await?;
                let events = split_events(response.bytes_stream().boxed());
                Ok(OriginReply::Stream(events))
            }
        }
    }
}

/// JSON bodies pass through; anything else becomes a JSON string
pub fn body_to_json(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

/// Accumulates raw bytes and yields complete SSE events
#[derive(Debug, Default)]
pub struct EventSplitter {
    buf: Vec<u8>,
}

impl EventSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns every event completed by them, delimiter included
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let delimiter = SSE_DELIMITER.as_bytes();
        let mut events = Vec::new();
        while let Some(pos) = self
            .buf
            .windows(delimiter.len())
            .position(|window| window == delimiter)
        {
            let event: Vec<u8> = self.buf.drain(..pos + delimiter.len()).collect();
            events.push(String::from_utf8_lossy(&event).into_owned());
        }
        events
    }

    /// Trailing bytes never closed by a delimiter
    pub fn finish(self) -> Option<String> {
        if self.buf.iter().all(|b| b.is_ascii_whitespace()) {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

fn split_events(
    body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
) -> BoxStream<'static, Result<String, AgentError>> {
    struct State {
        body: BoxStream<'static, Result<Bytes, reqwest::Error>>,
        splitter: Option<EventSplitter>,
        ready: VecDeque<String>,
    }

    let state = State {
        body,
        splitter: Some(EventSplitter::new()),
        ready: VecDeque::new(),
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            state.splitter.as_ref()?;

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    if let Some(splitter) = state.splitter.as_mut() {
                        state.ready.extend(splitter.push(&bytes));
                    }
                }
                Some(Err(e)) => {
                    state.splitter = None;
                    return Some((Err(AgentError::Origin(e)), state));
                }
                None => {
                    let leftover = state.splitter.take().and_then(EventSplitter::finish);
                    state.ready.extend(leftover);
                }
            }
        }
    })
    .boxed()
}

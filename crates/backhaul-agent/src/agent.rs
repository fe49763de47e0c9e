//! Tunnel agent: dials the proxy and answers requests from an origin

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::origin::{Origin, OriginReply};
use backhaul_proto::{TunnelMessage, TunnelReply};
use futures::StreamExt;
use futures_util::SinkExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Capacity of the outbound reply channel
const REPLY_CHANNEL_CAPACITY: usize = 256;

pub struct Agent<O: Origin> {
    config: AgentConfig,
    origin: Arc<O>,
}

impl<O: Origin> Agent<O> {
    pub fn new(config: AgentConfig, origin: O) -> Self {
        Self {
            config,
            origin: Arc::new(origin),
        }
    }

    /// Keep a session open, reconnecting with exponential backoff.
    ///
    /// Returns only when `max_attempts` consecutive connects failed.
    pub async fn run(&self) -> Result<(), AgentError> {
        let url = self.config.socket_url()?;
        let mut current_backoff = self.config.initial_backoff;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            info!("Connecting to proxy at {} (attempt {})", url, attempt);

            match self.run_session().await {
                Ok(()) => {
                    info!("Tunnel session ended");
                    current_backoff = self.config.initial_backoff;
                    attempt = 0;
                }
                Err(e) => {
                    error!("Failed to connect to proxy: {}", e);
                    if self.config.max_attempts > 0 && attempt >= self.config.max_attempts {
                        return Err(AgentError::MaxAttempts(attempt));
                    }
                }
            }

            info!(
                "Reconnecting in {}s...",
                current_backoff.as_secs_f64()
            );
            tokio::time::sleep(current_backoff).await;
            current_backoff = next_backoff(current_backoff, self.config.max_backoff);
        }
    }

    /// One connection to the proxy.
    ///
    /// Fails only if the connect itself fails; once connected, the session
    /// runs until the socket closes.
    pub async fn run_session(&self) -> Result<(), AgentError> {
        let url = self.config.socket_url()?;
        let (ws, _) = connect_async(url.as_str()).await?;
        info!(capability = %self.config.capability, "Connected to proxy at {}", url);

        let (mut sink, mut source) = ws.split();
        let (reply_tx, mut reply_rx) = mpsc::channel::<String>(REPLY_CHANNEL_CAPACITY);

        let writer = tokio::spawn(async move {
            while let Some(frame) = reply_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    debug!("Failed to send reply frame: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(frame) = source.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Ignoring non-UTF-8 binary frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("Proxy closed the tunnel socket");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Tunnel socket error: {}", e);
                    break;
                }
            };

            match TunnelMessage::from_json(&text) {
                Ok(message) => {
                    let origin = self.origin.clone();
                    let reply_tx = reply_tx.clone();
                    tokio::spawn(async move {
                        answer(origin.as_ref(), message, reply_tx).await;
                    });
                }
                Err(e) => warn!("Ignoring malformed tunnel message: {}", e),
            }
        }

        drop(reply_tx);
        writer.abort();
        Ok(())
    }
}

/// Run one request through the origin and send every reply frame it yields
pub async fn answer<O: Origin + ?Sized>(origin: &O, message: TunnelMessage, replies: mpsc::Sender<String>) {
    let id = message.id.clone();
    debug!(request_id = %id, method = %message.method, endpoint = %message.endpoint, "Handling request");

    match origin.handle(message).await {
        Ok(OriginReply::Single { status, data }) => {
            let reply = TunnelReply::Response {
                id,
                status_code: Some(status),
                data: Some(data),
            };
            let _ = replies.send(reply.to_json()).await;
        }
        Ok(OriginReply::Stream(mut events)) => {
            while let Some(event) = events.next().await {
                match event {
                    Ok(event) => {
                        let chunk = TunnelReply::Chunk {
                            id: id.clone(),
                            event,
                        };
                        if replies.send(chunk.to_json()).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(request_id = %id, "Origin stream failed: {}", e);
                        break;
                    }
                }
            }
            let _ = replies.send(TunnelReply::End { id }.to_json()).await;
        }
        Err(e) => {
            warn!(request_id = %id, "Origin request failed: {}", e);
            let reply = TunnelReply::Response {
                id,
                status_code: Some(502),
                data: Some(json!({ "error": e.to_string() })),
            };
            let _ = replies.send(reply.to_json()).await;
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

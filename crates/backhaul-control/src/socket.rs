//! Agent socket handle

use backhaul_proto::Capability;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Unique connection handle
pub type SocketId = Uuid;

/// Capacity of the per-socket outbound frame channel
pub const SOCKET_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Socket {0} is closed")]
    Closed(SocketId),

    #[error("Socket {0} outbound queue is full")]
    Full(SocketId),
}

/// Handle to one connected agent
///
/// The WebSocket itself is owned by the connection's writer task; this handle
/// only holds the sending half of the channel feeding that task. Once the
/// writer task ends the channel closes and every send fails, which is how a
/// dead socket is detected. Sends never wait: a full channel means the agent
/// is stalled and is reported as [`SendError::Full`].
#[derive(Debug, Clone)]
pub struct TunnelSocket {
    id: SocketId,
    capability: Capability,
    remote_addr: Option<SocketAddr>,
    connected_at: chrono::DateTime<chrono::Utc>,
    tx: mpsc::Sender<String>,
}

impl TunnelSocket {
    /// Create a handle and the receiving half for the writer task
    pub fn new(capability: Capability) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
        let socket = Self {
            id: Uuid::new_v4(),
            capability,
            remote_addr: None,
            connected_at: chrono::Utc::now(),
            tx,
        };
        (socket, rx)
    }

    pub fn with_remote_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_addr = addr;
        self
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whole seconds since the connection was accepted
    pub fn connected_secs(&self) -> i64 {
        (chrono::Utc::now() - self.connected_at).num_seconds()
    }

    /// Queue an encoded frame for the writer task without waiting
    pub fn send_text(&self, frame: String) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full(self.id),
            TrySendError::Closed(_) => SendError::Closed(self.id),
        })
    }
}

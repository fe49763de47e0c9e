//! Registry of connected agent sockets
//!
//! Sockets are partitioned by capability into a `regular` pool (fan-out
//! targets for request/response calls) and a `stream` pool (one socket per SSE
//! call). Each pool keeps registration order, so "first available" stream
//! socket means the longest-connected one.

use crate::socket::{SocketId, TunnelSocket};
use backhaul_proto::Capability;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Pool sizes for health reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub regular: usize,
    pub stream: usize,
}

impl RegistryCounts {
    pub fn total(&self) -> usize {
        self.regular + self.stream
    }
}

#[derive(Debug, Default)]
struct Pools {
    regular: Vec<TunnelSocket>,
    stream: Vec<TunnelSocket>,
}

impl Pools {
    fn pool_mut(&mut self, capability: Capability) -> &mut Vec<TunnelSocket> {
        match capability {
            Capability::Regular => &mut self.regular,
            Capability::Stream => &mut self.stream,
        }
    }

    fn remove(&mut self, socket_id: SocketId) -> Option<TunnelSocket> {
        for pool in [&mut self.regular, &mut self.stream] {
            if let Some(pos) = pool.iter().position(|s| s.id() == socket_id) {
                return Some(pool.remove(pos));
            }
        }
        None
    }
}

/// Tracks live agent sockets
///
/// Registration, removal and the snapshots the dispatcher fans out over all go
/// through the same lock. Fan-out works on a snapshot, so sockets may come and
/// go while a request is being sent.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    pools: Arc<RwLock<Pools>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a socket to the pool matching its capability.
    ///
    /// Registering a handle that is already present replaces the old entry,
    /// so one connection never appears twice.
    pub async fn register(&self, socket: TunnelSocket) {
        let mut pools = self.pools.write().await;

        let replaced = pools.remove(socket.id()).is_some();
        let capability = socket.capability();
        let socket_id = socket.id();
        let remote_addr = socket.remote_addr();
        pools.pool_mut(capability).push(socket);

        info!(
            socket_id = %socket_id,
            capability = %capability,
            remote_addr = ?remote_addr,
            replaced,
            "Agent socket registered"
        );
    }

    /// Remove a socket from whichever pool holds it.
    ///
    /// Unknown or already removed ids are a no-op.
    pub async fn unregister(&self, socket_id: SocketId) -> Option<TunnelSocket> {
        let removed = self.pools.write().await.remove(socket_id);

        match &removed {
            Some(socket) => info!(
                socket_id = %socket_id,
                capability = %socket.capability(),
                connected_secs = socket.connected_secs(),
                "Agent socket unregistered"
            ),
            None => debug!(socket_id = %socket_id, "Socket already unregistered"),
        }

        removed
    }

    /// Snapshot of every regular socket, in registration order
    pub async fn regular_sockets(&self) -> Vec<TunnelSocket> {
        self.pools.read().await.regular.clone()
    }

    /// Snapshot of every stream socket, earliest registered first
    pub async fn stream_sockets(&self) -> Vec<TunnelSocket> {
        self.pools.read().await.stream.clone()
    }

    pub async fn counts(&self) -> RegistryCounts {
        let pools = self.pools.read().await;
        RegistryCounts {
            regular: pools.regular.len(),
            stream: pools.stream.len(),
        }
    }
}

//! Control plane for the tunnel proxy
//!
//! Holds the two pieces of shared state: the registry of connected agent
//! sockets and the correlation table binding in-flight request ids to the
//! HTTP handlers awaiting them.
pub mod correlation;
pub mod registry;
pub mod socket;

pub use correlation::{
    CallError, CorrelationTable, DisconnectPolicy, ReleaseSummary, Resolution, SingleCall,
    StreamCall, StreamChunk,
};
pub use registry::{ConnectionRegistry, RegistryCounts};
pub use socket::{SendError, SocketId, TunnelSocket, SOCKET_CHANNEL_CAPACITY};

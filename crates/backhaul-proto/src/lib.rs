//! Backhaul Tunnel Protocol Definitions
//!
//! This crate defines the JSON wire types exchanged between the proxy and its
//! agents over the tunnel WebSocket:
//!
//! - [`TunnelMessage`]: agent-bound request envelope
//! - [`TunnelReply`]: proxy-bound reply frame (terminal response or stream chunk)
//! - [`Capability`]: which pool an agent socket serves

pub mod headers;
pub mod messages;
pub mod reply;

pub use headers::{filter_forwarded_headers, FORWARDED_HEADERS};
pub use messages::*;
pub use reply::{ReplyDecodeError, TunnelReply};

/// Protocol version advertised in the health report
pub const PROTOCOL_VERSION: u32 = 1;

/// SSE event delimiter (blank line)
pub const SSE_DELIMITER: &str = "\n\n";

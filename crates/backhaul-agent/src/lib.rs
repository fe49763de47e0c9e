//! Reference tunnel agent
//!
//! Dials the proxy's agent socket, receives tunneled requests and replays
//! them against an [`Origin`], usually a local HTTP service.
pub mod agent;
pub mod config;
pub mod error;
pub mod origin;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::AgentError;
pub use origin::{EventSplitter, HttpOrigin, Origin, OriginReply};

//! Local forwarding proxy
//!
//! This module provides the forwarding server and its building blocks:
//! - CONNECT tunneling and plain HTTP forwarding
//! - Sticky fallback across upstream endpoints
//! - Upstream failure reporting
//! - Idle-aware bidirectional relay

pub mod events;
pub mod handler;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use events::FailureReporter;
pub use handler::{ConnectionHandler, ForwarderConfig};
pub use server::ForwardingServer;
pub use transport::{UpstreamDialer, UpstreamSet};
pub use tunnel::TunnelHandler;

//! jobproxy - Per-job forwarding proxies
//!
//! Local `127.0.0.1` forward proxies that relay job traffic to authenticated
//! upstream proxies.
//!
//! ## Features
//!
//! - HTTPS CONNECT tunneling and plain HTTP forwarding
//! - `Proxy-Authorization: Basic` injection per upstream endpoint
//! - Sticky fallback to sibling endpoints when the current one is unreachable
//! - Round-robin pool issuing one server per job on a disjoint local port
//! - Time-boxed endpoint blocking with lazy expiry
//! - Dial, head and idle deadlines on every connection

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod proxy;

pub use config::Config;
pub use error::{JobProxyError, Result};
pub use models::{PoolStats, ProxyEndpoint};
pub use pool::{PoolConfig, PoolManager};
pub use proxy::{FailureReporter, ForwarderConfig, ForwardingServer};

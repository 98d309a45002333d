//! Per-job proxy pool
//!
//! Round-robin endpoint selection with a time-boxed blocklist, plus local port
//! allocation for the forwarding servers the pool issues.

mod blocklist;
mod manager;
mod ports;

pub use blocklist::Blocklist;
pub use manager::{PoolConfig, PoolManager, DEFAULT_BLOCK_COOLDOWN};
pub use ports::PortAllocator;

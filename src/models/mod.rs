pub mod endpoint;
pub mod stats;

pub use endpoint::*;
pub use stats::*;

pub(crate) use endpoint::format_tcp_addr;

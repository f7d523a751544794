//! Upstream tunnel clients
//!
//! - [`TunnelClient`]: the contract the redirect listener dials through
//! - [`DirectTunnel`]: plain TCP implementation with optional routing mark

mod direct;
mod traits;

pub use direct::DirectTunnel;
pub use traits::{endpoint, TunnelClient, TunnelStream};

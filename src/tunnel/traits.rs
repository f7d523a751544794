//! Tunnel client trait definitions
//!
//! The redirect listener never speaks a tunnel protocol itself. It hands the
//! recovered destination, formatted as an endpoint string, to a
//! [`TunnelClient`] and pipes whatever stream comes back.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DialError;

/// A bidirectional byte stream returned by a tunnel client
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> TunnelStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Client able to open upstream TCP connections on behalf of redirected ones
#[async_trait]
pub trait TunnelClient: Send + Sync {
    /// Open a TCP connection to `endpoint`.
    ///
    /// `endpoint` is `IP:port`, with IPv6 addresses bracketed
    /// (see [`endpoint`]).
    ///
    /// # Errors
    ///
    /// Returns `DialError` if the upstream connection cannot be established.
    async fn dial_tcp(&self, endpoint: &str) -> Result<Box<dyn TunnelStream>, DialError>;

    /// Short name used in log output
    fn name(&self) -> &str;
}

/// Format a destination as the endpoint string passed to [`TunnelClient::dial_tcp`]
#[must_use]
pub fn endpoint(addr: SocketAddr) -> String {
    addr.to_string()
}

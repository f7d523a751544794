//! Direct tunnel implementation
//!
//! `DirectTunnel` dials the endpoint over plain TCP. It stands in for a real
//! tunnel client in the binary and in tests. Upstream sockets can carry an
//! `SO_MARK` so the redirect rule can exclude the proxy's own traffic:
//!
//! ```bash
//! iptables -t nat -A OUTPUT -p tcp -m mark --mark 0xff -j RETURN
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::traits::{TunnelClient, TunnelStream};
use crate::config::SessionConfig;
use crate::error::DialError;

/// Direct tunnel - connects straight to the destination
#[derive(Debug, Clone)]
pub struct DirectTunnel {
    connect_timeout: Duration,
    routing_mark: Option<u32>,
}

impl DirectTunnel {
    /// Create a direct tunnel with the given connect timeout
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            routing_mark: None,
        }
    }

    /// Create a direct tunnel from session configuration
    #[must_use]
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            routing_mark: config.routing_mark,
        }
    }

    /// Set `SO_MARK` on upstream sockets
    #[must_use]
    pub const fn with_routing_mark(mut self, mark: u32) -> Self {
        self.routing_mark = Some(mark);
        self
    }

    /// Connect timeout
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Routing mark, if any
    #[must_use]
    pub const fn routing_mark(&self) -> Option<u32> {
        self.routing_mark
    }

    /// Create a socket for `addr` with the configured options
    fn create_socket(&self, addr: SocketAddr) -> Result<Socket, DialError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| DialError::connection_failed(addr.to_string(), e.to_string()))?;

        if let Some(mark) = self.routing_mark {
            socket.set_mark(mark).map_err(|e| DialError::SocketOption {
                option: "SO_MARK".into(),
                reason: format!("Failed to set routing mark {mark}: {e}"),
            })?;
            debug!("Set routing mark: {}", mark);
        }

        socket.set_nonblocking(true).map_err(|e| DialError::SocketOption {
            option: "O_NONBLOCK".into(),
            reason: e.to_string(),
        })?;

        // 60s idle before the first probe, then every 15s
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(15));

        socket
            .set_tcp_keepalive(&keepalive)
            .map_err(|e| DialError::SocketOption {
                option: "TCP_KEEPALIVE".into(),
                reason: e.to_string(),
            })?;

        Ok(socket)
    }

    /// Connect to `addr`, waiting at most the configured timeout
    pub async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let endpoint = addr.to_string();
        let socket = self.create_socket(addr)?;

        // EINPROGRESS is expected for non-blocking sockets
        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
            Err(e) => return Err(DialError::connection_failed(endpoint, e.to_string())),
        }

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpStream::from_std(std_stream)
            .map_err(|e| DialError::connection_failed(endpoint.clone(), e.to_string()))?;

        let connect_result = timeout(self.connect_timeout, async {
            stream
                .writable()
                .await
                .map_err(|e| DialError::connection_failed(endpoint.clone(), e.to_string()))?;

            match stream.take_error() {
                Ok(None) => Ok(()),
                Ok(Some(e)) | Err(e) => {
                    Err(DialError::connection_failed(endpoint.clone(), e.to_string()))
                }
            }
        })
        .await;

        match connect_result {
            Ok(Ok(())) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                debug!("Connected to {}", endpoint);
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(DialError::timeout(endpoint, self.connect_timeout)),
        }
    }
}

impl Default for DirectTunnel {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

#[async_trait]
impl TunnelClient for DirectTunnel {
    async fn dial_tcp(&self, endpoint: &str) -> Result<Box<dyn TunnelStream>, DialError> {
        let addr: SocketAddr = endpoint.parse().map_err(|e: std::net::AddrParseError| {
            DialError::InvalidEndpoint {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            }
        })?;

        let stream = self.connect(addr).await?;
        Ok(Box::new(stream))
    }

    fn name(&self) -> &str {
        "direct"
    }
}

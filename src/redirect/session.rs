//! Per-connection redirect flow
//!
//! resolve → loopback filter → observe → dial → pipe. The accepted stream and
//! the dialed upstream are owned by the session, so every early return closes
//! them.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::resolver::DestinationResolver;
use crate::error::SessionError;
use crate::io::{CopyResult, Pipe};
use crate::tunnel::{endpoint, TunnelClient};

/// Called once a redirected connection has a usable destination
pub type ConnectHook = Arc<dyn Fn(SocketAddr, SocketAddr) + Send + Sync>;

/// Called once per session after a dial attempt; `None` means a clean finish
pub type ErrorHook = Arc<dyn Fn(SocketAddr, SocketAddr, Option<&SessionError>) + Send + Sync>;

/// Observer callbacks shared by all sessions of a listener
#[derive(Clone)]
pub struct SessionHooks {
    on_connect: ConnectHook,
    on_error: ErrorHook,
}

impl SessionHooks {
    /// Hooks that do nothing
    #[must_use]
    pub fn new() -> Self {
        Self {
            on_connect: Arc::new(|_, _| {}),
            on_error: Arc::new(|_, _, _| {}),
        }
    }

    /// Set the "connection observed" hook `(client, destination)`
    #[must_use]
    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr, SocketAddr) + Send + Sync + 'static,
    {
        self.on_connect = Arc::new(f);
        self
    }

    /// Set the "session ended" hook `(client, destination, error)`
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr, SocketAddr, Option<&SessionError>) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(f);
        self
    }

    fn connected(&self, client: SocketAddr, destination: SocketAddr) {
        (self.on_connect)(client, destination);
    }

    fn ended(&self, client: SocketAddr, destination: SocketAddr, error: Option<&SessionError>) {
        (self.on_error)(client, destination, error);
    }
}

impl Default for SessionHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks").finish_non_exhaustive()
    }
}

/// Collaborators shared read-only by every session of a listener
#[derive(Clone)]
pub struct SessionContext {
    pub(crate) resolver: Arc<dyn DestinationResolver>,
    pub(crate) tunnel: Arc<dyn TunnelClient>,
    pub(crate) pipe: Arc<dyn Pipe>,
    pub(crate) hooks: SessionHooks,
    pub(crate) idle_timeout: Duration,
}

impl SessionContext {
    /// Create a context from its collaborators
    pub fn new(
        resolver: Arc<dyn DestinationResolver>,
        tunnel: Arc<dyn TunnelClient>,
        pipe: Arc<dyn Pipe>,
        hooks: SessionHooks,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            tunnel,
            pipe,
            hooks,
            idle_timeout,
        }
    }

    /// Idle timeout handed to the pipe
    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("tunnel", &self.tunnel.name())
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Resolution failed or the destination was loopback; nothing reported
    Dropped,
    /// The session reached the dial step; the hooks saw this result
    Ended {
        destination: SocketAddr,
        result: Result<CopyResult, SessionError>,
    },
}

impl SessionOutcome {
    /// Whether the connection was silently dropped
    #[must_use]
    pub const fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped)
    }
}

/// A freshly accepted redirected connection
#[derive(Debug)]
pub struct RedirectSession {
    stream: TcpStream,
    client_addr: SocketAddr,
}

impl RedirectSession {
    /// Wrap an accepted stream
    #[must_use]
    pub const fn new(stream: TcpStream, client_addr: SocketAddr) -> Self {
        Self {
            stream,
            client_addr,
        }
    }

    /// Client's source address
    #[must_use]
    pub const fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Drive the session to completion.
    ///
    /// Both connections are closed when this returns.
    pub async fn run(self, ctx: &SessionContext) -> SessionOutcome {
        let Self {
            stream,
            client_addr,
        } = self;

        let destination = match ctx.resolver.resolve(&stream) {
            Ok(dst) if !is_loopback_destination(dst.ip()) => dst,
            Ok(dst) => {
                trace!("Dropping {} -> {}: loopback destination", client_addr, dst);
                return SessionOutcome::Dropped;
            }
            Err(e) => {
                trace!("Dropping {}: {}", client_addr, e);
                return SessionOutcome::Dropped;
            }
        };

        ctx.hooks.connected(client_addr, destination);

        let upstream = match ctx.tunnel.dial_tcp(&endpoint(destination)).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let err = SessionError::from(e);
                debug!(
                    "Dial {} via {} failed: {}",
                    destination,
                    ctx.tunnel.name(),
                    err
                );
                ctx.hooks.ended(client_addr, destination, Some(&err));
                return SessionOutcome::Ended {
                    destination,
                    result: Err(err),
                };
            }
        };

        debug!(
            "Proxying {} -> {} via {}",
            client_addr,
            destination,
            ctx.tunnel.name()
        );

        let result = ctx
            .pipe
            .pipe(stream, upstream, ctx.idle_timeout)
            .await
            .map_err(SessionError::from);

        ctx.hooks.ended(client_addr, destination, result.as_ref().err());

        SessionOutcome::Ended {
            destination,
            result,
        }
    }
}

/// Whether `ip` is a loopback address, including IPv4-mapped loopback
#[must_use]
pub fn is_loopback_destination(ip: IpAddr) -> bool {
    ip.to_canonical().is_loopback()
}

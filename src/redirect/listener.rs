//! Redirect TCP listener
//!
//! Binds the local port that iptables `REDIRECT` points at and spawns one
//! task per accepted connection. Accept failures end the loop.

use std::future::{pending, Future};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener};
use tracing::{debug, info, info_span, Instrument};

use super::resolver::{DestinationResolver, OriginalDstResolver};
use super::session::{RedirectSession, SessionContext, SessionHooks};
use crate::config::{Config, ListenConfig};
use crate::error::{ListenerError, SessionError};
use crate::io::{IdleTimeoutPipe, Pipe};
use crate::tunnel::TunnelClient;

/// A bound redirect listener
#[derive(Debug)]
pub struct RedirectListener {
    /// The underlying tokio TCP listener
    listener: TcpListener,

    /// Address actually bound
    listen_addr: SocketAddr,

    /// Collaborators shared with every session
    ctx: Arc<SessionContext>,
}

impl RedirectListener {
    /// Resolve `config.address`, then bind and listen on it.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError` if the address does not resolve or the socket
    /// cannot be created, configured or bound.
    pub async fn bind(config: &ListenConfig, ctx: SessionContext) -> Result<Self, ListenerError> {
        let addr = resolve_listen_addr(&config.address).await?;

        info!("Creating redirect listener on {}", addr);

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ListenerError::SocketCreation(e.to_string()))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| ListenerError::socket_option("SO_REUSEADDR", e.to_string()))?;

        if config.reuse_port {
            socket
                .set_reuse_port(true)
                .map_err(|e| ListenerError::socket_option("SO_REUSEPORT", e.to_string()))?;
        }

        socket
            .set_nonblocking(true)
            .map_err(|e| ListenerError::socket_option("O_NONBLOCK", e.to_string()))?;

        socket
            .bind(&addr.into())
            .map_err(|e| ListenerError::bind(addr, e.to_string()))?;

        let backlog = i32::try_from(config.backlog).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|e| ListenerError::bind(addr, e.to_string()))?;

        let listener = TcpListener::from_std(socket.into())
            .map_err(|e| ListenerError::SocketCreation(e.to_string()))?;

        // Port 0 binds pick an ephemeral port
        let listen_addr = listener.local_addr().unwrap_or(addr);

        info!(
            "Redirect listener ready on {} (backlog={}, tunnel={})",
            listen_addr,
            config.backlog,
            ctx.tunnel.name()
        );

        Ok(Self {
            listener,
            listen_addr,
            ctx: Arc::new(ctx),
        })
    }

    /// Get the bound address
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Session context shared by spawned sessions
    #[must_use]
    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    /// Accept the next connection without running it
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Accept` if accept fails.
    pub async fn accept(&self) -> Result<RedirectSession, ListenerError> {
        let (stream, client_addr) = self
            .listener
            .accept()
            .await
            .map_err(ListenerError::Accept)?;

        debug!("Accepted connection from {}", client_addr);
        Ok(RedirectSession::new(stream, client_addr))
    }

    /// Run the accept loop forever.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Accept` on the first accept failure.
    pub async fn serve(self) -> Result<(), ListenerError> {
        self.serve_with_shutdown(pending::<()>()).await
    }

    /// Run the accept loop until `shutdown` completes.
    ///
    /// Sessions already spawned keep running after shutdown; only accepting
    /// stops. The listening socket is closed on return.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError::Accept` on the first accept failure.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<(), ListenerError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting accept loop on {}", self.listen_addr);

        tokio::pin!(shutdown);

        loop {
            let session = tokio::select! {
                () = &mut shutdown => {
                    info!("Accept loop on {} stopping", self.listen_addr);
                    return Ok(());
                }
                accepted = self.accept() => accepted?,
            };

            let ctx = Arc::clone(&self.ctx);
            let span = info_span!("redirect_session", client = %session.client_addr());

            tokio::spawn(
                async move {
                    session.run(&ctx).await;
                }
                .instrument(span),
            );
        }
    }
}

/// Resolve a `host:port` listen address, preferring the first IPv4 result
async fn resolve_listen_addr(address: &str) -> Result<SocketAddr, ListenerError> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let addrs: Vec<SocketAddr> = lookup_host(address)
        .await
        .map_err(|e| ListenerError::AddrResolve {
            addr: address.to_string(),
            reason: e.to_string(),
        })?
        .collect();

    let preferred = addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied();

    preferred.ok_or_else(|| ListenerError::AddrResolve {
        addr: address.to_string(),
        reason: "no addresses found".into(),
    })
}

/// Builder for a redirect listener
///
/// Only the tunnel client is required. The resolver defaults to
/// [`OriginalDstResolver`] and the pipe to [`IdleTimeoutPipe`].
pub struct RedirectListenerBuilder {
    listen: ListenConfig,
    idle_timeout: Duration,
    tunnel: Arc<dyn TunnelClient>,
    resolver: Arc<dyn DestinationResolver>,
    pipe: Arc<dyn Pipe>,
    hooks: SessionHooks,
}

impl RedirectListenerBuilder {
    /// Create a builder that dials through `tunnel`
    #[must_use]
    pub fn new(tunnel: Arc<dyn TunnelClient>) -> Self {
        Self {
            listen: ListenConfig::default(),
            idle_timeout: Duration::from_secs(300),
            tunnel,
            resolver: Arc::new(OriginalDstResolver::new()),
            pipe: Arc::new(IdleTimeoutPipe::new()),
            hooks: SessionHooks::new(),
        }
    }

    /// Create a builder from loaded configuration
    #[must_use]
    pub fn from_config(config: &Config, tunnel: Arc<dyn TunnelClient>) -> Self {
        Self {
            listen: config.listen.clone(),
            idle_timeout: config.session.idle_timeout(),
            pipe: Arc::new(IdleTimeoutPipe::new().with_half_close(config.session.half_close)),
            ..Self::new(tunnel)
        }
    }

    /// Set the listen address (`host:port`)
    #[must_use]
    pub fn listen(mut self, address: impl Into<String>) -> Self {
        self.listen.address = address.into();
        self
    }

    /// Set the TCP backlog
    #[must_use]
    pub const fn backlog(mut self, backlog: u32) -> Self {
        self.listen.backlog = backlog;
        self
    }

    /// Set whether to use `SO_REUSEPORT`
    #[must_use]
    pub const fn reuse_port(mut self, reuse: bool) -> Self {
        self.listen.reuse_port = reuse;
        self
    }

    /// Set the idle timeout handed to the pipe
    #[must_use]
    pub const fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Replace the destination resolver
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn DestinationResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the pipe
    #[must_use]
    pub fn pipe(mut self, pipe: Arc<dyn Pipe>) -> Self {
        self.pipe = pipe;
        self
    }

    /// Set the "connection observed" hook
    #[must_use]
    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr, SocketAddr) + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_connect(f);
        self
    }

    /// Set the "session ended" hook
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr, SocketAddr, Option<&SessionError>) + Send + Sync + 'static,
    {
        self.hooks = self.hooks.on_error(f);
        self
    }

    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError` if listener creation fails.
    pub async fn bind(self) -> Result<RedirectListener, ListenerError> {
        let ctx = SessionContext::new(
            self.resolver,
            self.tunnel,
            self.pipe,
            self.hooks,
            self.idle_timeout,
        );
        RedirectListener::bind(&self.listen, ctx).await
    }

    /// Bind the listener and run its accept loop.
    ///
    /// # Errors
    ///
    /// Returns `ListenerError` on bind failure or the first accept failure.
    pub async fn listen_and_serve(self) -> Result<(), ListenerError> {
        self.bind().await?.serve().await
    }
}

impl std::fmt::Debug for RedirectListenerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedirectListenerBuilder")
            .field("listen", &self.listen)
            .field("idle_timeout", &self.idle_timeout)
            .field("tunnel", &self.tunnel.name())
            .finish_non_exhaustive()
    }
}

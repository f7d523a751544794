//! Error types for tcp-redirect
//!
//! Errors are split by subsystem. Listener errors are fatal and surface to the
//! caller of `bind`/`serve`; resolution errors are swallowed per connection;
//! dial and pipe errors are reported through the session error hook.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type for tcp-redirect
#[derive(Debug, Error)]
pub enum TcpRedirectError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener setup and accept errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// Per-session errors (dial, pipe)
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TcpRedirectError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Listener(e) => e.is_recoverable(),
            Self::Session(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Redirect listener errors
///
/// Every variant is fatal to the listener: a bind failure aborts startup and
/// an accept failure ends the accept loop. There is no retry at this layer.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The configured listen address could not be resolved
    #[error("Failed to resolve listen address {addr}: {reason}")]
    AddrResolve { addr: String, reason: String },

    /// Failed to create the listening socket
    #[error("Failed to create listener socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option on the listening socket
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind or listen
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Accept failed; the listener is considered broken
    #[error("Accept error: {0}")]
    Accept(#[source] io::Error),
}

impl ListenerError {
    /// Listener errors are never retried
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }
}

/// Failure to recover the original destination of an accepted connection
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// Every original-destination probe failed; carries the last failure
    #[error("getsockopt {option} failed: {source}")]
    Unavailable {
        option: &'static str,
        #[source]
        source: io::Error,
    },

    /// The kernel returned fewer bytes than the family/port header
    #[error("Original destination record truncated to {len} bytes")]
    Truncated { len: usize },

    /// The family tag is neither `AF_INET` nor `AF_INET6`
    #[error("unknown address family {0}")]
    UnknownFamily(u16),
}

/// Upstream tunnel dial errors
#[derive(Debug, Error)]
pub enum DialError {
    /// The endpoint string is not an `IP:port` pair
    #[error("Invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    /// Connection failed
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Connection timeout
    #[error("Connection to {endpoint} timed out after {timeout_secs}s")]
    Timeout { endpoint: String, timeout_secs: u64 },

    /// Failed to set an outgoing socket option (`SO_MARK`, keepalive)
    #[error("Failed to set upstream socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },
}

impl DialError {
    /// Create a connection failed error
    pub fn connection_failed(endpoint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            endpoint: endpoint.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            endpoint: endpoint.into(),
            timeout_secs: timeout.as_secs(),
        }
    }
}

/// Bidirectional copy errors
#[derive(Debug, Error)]
pub enum PipeError {
    /// No data moved in either direction within the idle timeout
    #[error("Idle timeout after {0:?}")]
    IdleTimeout(Duration),

    /// I/O error on either side
    #[error("Pipe I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Outcome reported to the session error hook
#[derive(Debug, Error)]
pub enum SessionError {
    /// The tunnel client could not open an upstream connection
    #[error("Dial failed: {0}")]
    Dial(#[from] DialError),

    /// The copy phase ended with an error
    #[error("Pipe failed: {0}")]
    Pipe(#[from] PipeError),
}

impl SessionError {
    /// Whether the session ended because the idle timeout elapsed
    #[must_use]
    pub const fn is_idle_timeout(&self) -> bool {
        matches!(self, Self::Pipe(PipeError::IdleTimeout(_)))
    }
}

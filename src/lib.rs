//! tcp-redirect: transparent TCP redirect inbound for tunnel clients
//!
//! This crate accepts connections redirected to a local port by netfilter
//! `REDIRECT` rules, recovers each connection's original destination with
//! `SO_ORIGINAL_DST`, and forwards it through a tunnel client.
//!
//! # Architecture
//!
//! ```text
//! Client → iptables REDIRECT → RedirectListener → TunnelClient → Destination
//!                                    ↓
//!                          DestinationResolver (SO_ORIGINAL_DST)
//!                                    ↓
//!                          loopback filter → hooks → Pipe
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tcp_redirect::config::load_config;
//! use tcp_redirect::redirect::RedirectListenerBuilder;
//! use tcp_redirect::tunnel::DirectTunnel;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tcp-redirect/config.json")?;
//! let tunnel = Arc::new(DirectTunnel::from_config(&config.session));
//!
//! RedirectListenerBuilder::from_config(&config, tunnel)
//!     .listen_and_serve()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`io`]: Pipe contract and idle-timeout bidirectional copy
//! - [`redirect`]: Original destination resolution and the redirect listener
//! - [`tunnel`]: Tunnel client contract and the direct implementation

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod io;
pub mod redirect;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{Config, ListenConfig, LogConfig, SessionConfig};
pub use error::{
    ConfigError, DialError, ListenerError, PipeError, ResolutionError, SessionError,
    TcpRedirectError,
};
pub use io::{CopyResult, IdleTimeoutPipe, Pipe};
pub use redirect::{
    DestinationResolver, OriginalDstResolver, RedirectListener, RedirectListenerBuilder,
    SessionHooks,
};
pub use tunnel::{DirectTunnel, TunnelClient, TunnelStream};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

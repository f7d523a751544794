//! Transparent TCP redirect inbound
//!
//! Accepts connections that netfilter `REDIRECT` rewrote to a local port,
//! recovers where the client was really going, and forwards the connection
//! through a [`TunnelClient`](crate::tunnel::TunnelClient).
//!
//! # Requirements
//!
//! - Linux with `nf_conntrack` (`SO_ORIGINAL_DST` reads the conntrack entry)
//! - `ip6tables` `REDIRECT` support for IPv6 traffic
//!
//! Unlike TPROXY, `REDIRECT` needs no special socket options or
//! `CAP_NET_ADMIN` on the listener itself; only installing the rules does.
//!
//! ## Example iptables Setup
//!
//! ```bash
//! # Redirect forwarded traffic
//! iptables -t nat -A PREROUTING -i br-lan -p tcp -j REDIRECT --to-ports 7892
//!
//! # Redirect locally generated traffic, skipping the proxy's own (marked) sockets
//! iptables -t nat -A OUTPUT -p tcp -m mark --mark 0xff -j RETURN
//! iptables -t nat -A OUTPUT -p tcp -d 127.0.0.0/8 -j RETURN
//! iptables -t nat -A OUTPUT -p tcp -j REDIRECT --to-ports 7892
//!
//! # IPv6
//! ip6tables -t nat -A PREROUTING -i br-lan -p tcp -j REDIRECT --to-ports 7892
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tcp_redirect::redirect::RedirectListenerBuilder;
//! use tcp_redirect::tunnel::DirectTunnel;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = RedirectListenerBuilder::new(Arc::new(DirectTunnel::default()))
//!     .listen("0.0.0.0:7892")
//!     .idle_timeout(Duration::from_secs(300))
//!     .on_connect(|client, dst| println!("{client} -> {dst}"))
//!     .on_error(|client, dst, err| println!("{client} -> {dst} closed: {err:?}"))
//!     .bind()
//!     .await?;
//!
//! listener.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Silent drops
//!
//! A connection whose destination cannot be resolved, or resolves to a
//! loopback address, was not redirected (for example a client dialing the
//! listener directly). It is closed without invoking any hook.

mod listener;
mod resolver;
mod session;
mod sockaddr;

pub use listener::{RedirectListener, RedirectListenerBuilder};
pub use resolver::{
    get_original_dst, DestinationResolver, OriginalDstProbe, OriginalDstResolver,
    IP6T_SO_ORIGINAL_DST, ORIGINAL_DST_PROBES, SO_ORIGINAL_DST,
};
pub use session::{
    is_loopback_destination, ConnectHook, ErrorHook, RedirectSession, SessionContext,
    SessionHooks, SessionOutcome,
};
pub use sockaddr::{decode_original_dst, KernelSockAddr, RawOriginalDst, ORIGINAL_DST_LEN};

//! Original destination resolution
//!
//! After an iptables `REDIRECT` the accepted socket's local address is the
//! listener itself. The address the client actually dialed lives in the
//! conntrack entry and is read back with `getsockopt(SO_ORIGINAL_DST)`.
//!
//! There is no reliable way to know up front which family the conntrack entry
//! belongs to, so the IPv6 option is probed first and the IPv4 option second.
//! Dual-stack listeners may present IPv4 traffic on an IPv6 socket, in which
//! case only one of the two succeeds.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use tokio::net::TcpStream;
use tracing::trace;

use super::sockaddr::{RawOriginalDst, HEADER_LEN, ORIGINAL_DST_LEN};
use crate::error::ResolutionError;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Linux kernel constant: `IP6T_SO_ORIGINAL_DST` (`SOL_IPV6` level)
pub const IP6T_SO_ORIGINAL_DST: libc::c_int = 80;

/// One `getsockopt` attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OriginalDstProbe {
    /// Protocol level
    pub level: libc::c_int,
    /// Option name
    pub option: libc::c_int,
    /// Name used in error messages
    pub name: &'static str,
}

/// Probes tried in order until one succeeds
pub const ORIGINAL_DST_PROBES: [OriginalDstProbe; 2] = [
    OriginalDstProbe {
        level: libc::SOL_IPV6,
        option: IP6T_SO_ORIGINAL_DST,
        name: "IP6T_SO_ORIGINAL_DST",
    },
    OriginalDstProbe {
        level: libc::SOL_IP,
        option: SO_ORIGINAL_DST,
        name: "SO_ORIGINAL_DST",
    },
];

/// Recovers the pre-redirection destination of an accepted connection
pub trait DestinationResolver: Send + Sync {
    /// Resolve the original destination of `stream`.
    ///
    /// Must not read from or otherwise disturb the stream's data.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError` if the destination cannot be determined.
    fn resolve(&self, stream: &TcpStream) -> Result<SocketAddr, ResolutionError>;
}

/// Kernel-backed resolver using `SO_ORIGINAL_DST`
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginalDstResolver;

impl OriginalDstResolver {
    /// Create a new resolver
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DestinationResolver for OriginalDstResolver {
    fn resolve(&self, stream: &TcpStream) -> Result<SocketAddr, ResolutionError> {
        get_original_dst(stream.as_raw_fd())
    }
}

/// Get the original destination of a redirected TCP connection.
///
/// # Errors
///
/// Returns `ResolutionError::Unavailable` carrying the last probe's failure
/// when every probe fails, `ResolutionError::Truncated` if the kernel wrote
/// less than the family/port header, or `ResolutionError::UnknownFamily`.
pub fn get_original_dst(fd: RawFd) -> Result<SocketAddr, ResolutionError> {
    let (raw, len) = query_original_dst(fd, &ORIGINAL_DST_PROBES)?;

    if len < HEADER_LEN {
        return Err(ResolutionError::Truncated { len });
    }

    raw.decode().map(SocketAddr::from)
}

/// Run `probes` in order, returning the first record the kernel fills in
fn query_original_dst(
    fd: RawFd,
    probes: &[OriginalDstProbe],
) -> Result<(RawOriginalDst, usize), ResolutionError> {
    let mut last_error = None;

    for probe in probes {
        let mut raw = RawOriginalDst::zeroed();
        let mut len = ORIGINAL_DST_LEN as libc::socklen_t;

        // Safety: raw is a repr(C) buffer of `len` bytes that outlives the call
        let ret = unsafe {
            libc::getsockopt(fd, probe.level, probe.option, raw.as_mut_ptr(), &mut len)
        };

        if ret == 0 {
            return Ok((raw, len as usize));
        }

        let err = io::Error::last_os_error();
        trace!("getsockopt {} on fd {} failed: {}", probe.name, fd, err);
        last_error = Some((probe.name, err));
    }

    let (option, source) = last_error.unwrap_or_else(|| {
        ("SO_ORIGINAL_DST", io::Error::from_raw_os_error(libc::ENOPROTOOPT))
    });
    Err(ResolutionError::Unavailable { option, source })
}

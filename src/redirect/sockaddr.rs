//! Original destination record decoding
//!
//! `getsockopt(SO_ORIGINAL_DST)` fills a `sockaddr_in` or `sockaddr_in6`
//! depending on which family the conntrack entry belongs to. Both share the
//! same 4-byte header (family tag, network-order port), so the buffer is
//! modeled as that header plus a 24-byte payload that is only interpreted
//! after the family tag has been matched.
//!
//! ```text
//!  0      2      4                                             28
//!  +------+------+---------------------------------------------+
//!  |family| port |                    data                     |
//!  +------+------+---------------------------------------------+
//!  AF_INET:        | addr (4) | zero (8) |
//!  AF_INET6:       | flowinfo (4) | addr (16) | scope_id (4)   |
//! ```

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::ResolutionError;

/// Size of the largest record the kernel may return (`sockaddr_in6`)
pub const ORIGINAL_DST_LEN: usize = 28;

/// Size of the family tag and port header shared by both layouts
pub const HEADER_LEN: usize = 4;

/// Raw original destination record, laid out like `sockaddr_in6`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawOriginalDst {
    /// Address family, host byte order
    family: libc::sa_family_t,
    /// Port, network byte order regardless of host
    port: [u8; 2],
    /// Family-dependent payload
    data: [u8; 24],
}

const _: () = assert!(mem::size_of::<RawOriginalDst>() == ORIGINAL_DST_LEN);
const _: () = assert!(mem::size_of::<libc::sockaddr_in6>() == ORIGINAL_DST_LEN);

impl RawOriginalDst {
    /// An all-zero record, ready to be filled by the kernel
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            family: 0,
            port: [0; 2],
            data: [0; 24],
        }
    }

    /// Build a record from its parts
    #[must_use]
    pub const fn new(family: libc::sa_family_t, port: [u8; 2], data: [u8; 24]) -> Self {
        Self { family, port, data }
    }

    /// Reinterpret raw bytes exactly as the kernel would have written them
    #[must_use]
    pub fn from_bytes(bytes: &[u8; ORIGINAL_DST_LEN]) -> Self {
        let mut data = [0u8; 24];
        data.copy_from_slice(&bytes[HEADER_LEN..]);
        Self {
            family: libc::sa_family_t::from_ne_bytes([bytes[0], bytes[1]]),
            port: [bytes[2], bytes[3]],
            data,
        }
    }

    /// The raw family tag
    #[must_use]
    pub const fn family(&self) -> libc::sa_family_t {
        self.family
    }

    /// Pointer handed to `getsockopt` as the option value
    pub fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        std::ptr::addr_of_mut!(*self).cast::<libc::c_void>()
    }

    /// Match on the family tag and extract the matching payload shape.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError::UnknownFamily` for any tag other than
    /// `AF_INET` or `AF_INET6`; no payload bytes are read in that case.
    pub fn decode(&self) -> Result<KernelSockAddr, ResolutionError> {
        let port = u16::from_be_bytes(self.port);

        match libc::c_int::from(self.family) {
            libc::AF_INET => {
                let mut addr = [0u8; 4];
                addr.copy_from_slice(&self.data[..4]);
                Ok(KernelSockAddr::V4 { port, addr })
            }
            libc::AF_INET6 => {
                let mut flowinfo = [0u8; 4];
                flowinfo.copy_from_slice(&self.data[..4]);
                let mut addr = [0u8; 16];
                addr.copy_from_slice(&self.data[4..20]);
                let mut scope_id = [0u8; 4];
                scope_id.copy_from_slice(&self.data[20..24]);
                Ok(KernelSockAddr::V6 {
                    port,
                    flowinfo: u32::from_be_bytes(flowinfo),
                    addr,
                    scope_id: u32::from_ne_bytes(scope_id),
                })
            }
            _ => Err(ResolutionError::UnknownFamily(self.family)),
        }
    }
}

impl Default for RawOriginalDst {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// A decoded original destination record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSockAddr {
    /// `sockaddr_in` payload
    V4 { port: u16, addr: [u8; 4] },
    /// `sockaddr_in6` payload
    V6 {
        port: u16,
        flowinfo: u32,
        addr: [u8; 16],
        scope_id: u32,
    },
}

impl KernelSockAddr {
    /// Destination port
    #[must_use]
    pub const fn port(&self) -> u16 {
        match self {
            Self::V4 { port, .. } | Self::V6 { port, .. } => *port,
        }
    }

    /// Destination IP; IPv4-mapped IPv6 addresses come back as IPv4
    #[must_use]
    pub fn ip(&self) -> IpAddr {
        match self {
            Self::V4 { addr, .. } => IpAddr::V4(Ipv4Addr::from(*addr)),
            Self::V6 { addr, .. } => IpAddr::V6(Ipv6Addr::from(*addr)).to_canonical(),
        }
    }

    /// The destination to dial.
    ///
    /// Flow label and scope id are dropped so the endpoint string stays
    /// in plain `[addr]:port` form.
    #[must_use]
    pub fn to_socket_addr(&self) -> SocketAddr {
        match self.ip() {
            IpAddr::V4(ip) => SocketAddr::V4(SocketAddrV4::new(ip, self.port())),
            IpAddr::V6(ip) => SocketAddr::V6(SocketAddrV6::new(ip, self.port(), 0, 0)),
        }
    }
}

impl From<KernelSockAddr> for SocketAddr {
    fn from(addr: KernelSockAddr) -> Self {
        addr.to_socket_addr()
    }
}

/// Decode a byte image of the kernel record into the destination address.
///
/// # Errors
///
/// Returns `ResolutionError::UnknownFamily` for unrecognized family tags.
pub fn decode_original_dst(bytes: &[u8; ORIGINAL_DST_LEN]) -> Result<SocketAddr, ResolutionError> {
    RawOriginalDst::from_bytes(bytes)
        .decode()
        .map(SocketAddr::from)
}

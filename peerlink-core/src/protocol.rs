//! Link roles, transport kinds and modes shared by both peers.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Default maximum payload per block (4 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Which side of the link this endpoint is. Fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Connector,
}

/// Underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    /// TCP.
    #[default]
    Stream,
    /// UDP. A pseudo-connection: "connected" means a default peer is known.
    Datagram,
}

/// Payload treatment on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Header + checksum + cipher on every payload, heartbeat on streams.
    #[default]
    Framed,
    /// Raw bytes verbatim. No header, no checksum, no cipher, no heartbeat.
    Simplify,
}

impl Mode {
    /// Whether a link in this mode over `transport` emits heartbeat probes.
    pub fn heartbeat(self, transport: TransportKind) -> bool {
        self == Mode::Framed && transport == TransportKind::Stream
    }
}

/// Remote endpoint captured at connect/accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostInfo {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl HostInfo {
    /// Host info for an IPv4 socket address; `None` for IPv6 peers.
    pub fn from_socket_addr(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(HostInfo {
                ip: *v4.ip(),
                port: v4.port(),
            }),
            SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().map(|ip| HostInfo {
                ip,
                port: v6.port(),
            }),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.ip, self.port)
    }
}

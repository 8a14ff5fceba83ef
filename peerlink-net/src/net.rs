//! Transport primitives: socket creation, bounded connect, bind+listen,
//! bounded accept, UDP pseudo-connect. One call, no state.
//!
//! Every socket is created with a zero linger (close aborts instead of
//! lingering) and address reuse, then handed to the tokio reactor.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use peerlink_core::{HostInfo, TransportKind};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

/// Pending-connection backlog for listeners.
pub const LISTEN_BACKLOG: i32 = 4;

/// Error from a transport primitive.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("socket create failed: {0}")]
    SocketCreate(#[source] io::Error),
    #[error("connect {addr} failed: {failure}")]
    Connect { addr: SocketAddr, failure: ConnectFailure },
    #[error("bind {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("listen on {addr} failed: {source}")]
    Listen { addr: SocketAddr, source: io::Error },
    #[error("accept wait failed: {0}")]
    AcceptWait(#[source] io::Error),
    #[error("resolve host {host} failed")]
    HostResolution { host: String },
}

/// Why a bounded connect did not complete.
#[derive(Debug, thiserror::Error)]
pub enum ConnectFailure {
    /// The connect call itself was rejected.
    #[error("connect call: {0}")]
    Syscall(#[source] io::Error),
    /// No completion within the wait.
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    /// Completed, but the socket reported an error status.
    #[error("socket status: {0}")]
    Status(#[source] io::Error),
}

/// Create an IPv4 socket of `kind`: zero linger, address reuse, non-blocking.
pub fn create(kind: TransportKind) -> Result<Socket, NetError> {
    let (ty, protocol) = match kind {
        TransportKind::Stream => (Type::STREAM, Protocol::TCP),
        TransportKind::Datagram => (Type::DGRAM, Protocol::UDP),
    };
    let socket = Socket::new(Domain::IPV4, ty, Some(protocol)).map_err(NetError::SocketCreate)?;
    socket
        .set_linger(Some(Duration::ZERO))
        .map_err(NetError::SocketCreate)?;
    socket.set_reuse_address(true).map_err(NetError::SocketCreate)?;
    socket.set_nonblocking(true).map_err(NetError::SocketCreate)?;
    Ok(socket)
}

/// TCP connect to `addr`, waiting at most `wait` for completion.
pub async fn connect(addr: SocketAddr, wait: Duration) -> Result<TcpStream, NetError> {
    let fail = |failure| NetError::Connect { addr, failure };
    let socket = create(TransportKind::Stream)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if connect_in_progress(&e) => {}
        Err(e) => return Err(fail(ConnectFailure::Syscall(e))),
    }
    let stream = TcpStream::from_std(socket.into()).map_err(|e| fail(ConnectFailure::Syscall(e)))?;
    match tokio::time::timeout(wait, stream.writable()).await {
        Err(_) => return Err(fail(ConnectFailure::TimedOut(wait))),
        Ok(Err(e)) => return Err(fail(ConnectFailure::Status(e))),
        Ok(Ok(())) => {}
    }
    if let Some(e) = stream.take_error().map_err(|e| fail(ConnectFailure::Status(e)))? {
        return Err(fail(ConnectFailure::Status(e)));
    }
    // Writable without an error status can still mean "not connected" on some stacks.
    stream.peer_addr().map_err(|e| fail(ConnectFailure::Status(e)))?;
    Ok(stream)
}

fn connect_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    let in_progress = err.raw_os_error() == Some(libc::EINPROGRESS);
    #[cfg(not(unix))]
    let in_progress = false;
    in_progress || err.kind() == io::ErrorKind::WouldBlock
}

fn local_addr(port: u16, bind: Option<Ipv4Addr>) -> SocketAddr {
    SocketAddr::from((bind.unwrap_or(Ipv4Addr::UNSPECIFIED), port))
}

/// Bind a TCP listener on `port` (wildcard address unless `bind` is given).
pub fn listen(port: u16, bind: Option<Ipv4Addr>) -> Result<TcpListener, NetError> {
    let addr = local_addr(port, bind);
    let socket = create(TransportKind::Stream)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| NetError::Bind { addr, source })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| NetError::Listen { addr, source })?;
    TcpListener::from_std(socket.into()).map_err(|source| NetError::Listen { addr, source })
}

/// Wait up to `wait` for one inbound connection. `Ok(None)` when the wait
/// elapsed; the caller decides how many waits to spend.
pub async fn accept(listener: &TcpListener, wait: Duration) -> Result<Option<(TcpStream, HostInfo)>, NetError> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, listener.accept()).await {
            Err(_) => return Ok(None),
            Ok(Ok((stream, addr))) => return Ok(Some((stream, host_info(addr)))),
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(NetError::AcceptWait(e)),
        }
    }
}

/// Host info for a peer address; an IPv6 peer is reported as unspecified.
pub fn host_info(addr: SocketAddr) -> HostInfo {
    HostInfo::from_socket_addr(addr).unwrap_or(HostInfo {
        ip: Ipv4Addr::UNSPECIFIED,
        port: addr.port(),
    })
}

/// UDP socket with `addr` as its default destination. No handshake happens.
pub fn udp_connect(addr: SocketAddr) -> Result<UdpSocket, NetError> {
    let socket = create(TransportKind::Datagram)?;
    socket.connect(&SockAddr::from(addr)).map_err(|e| NetError::Connect {
        addr,
        failure: ConnectFailure::Syscall(e),
    })?;
    UdpSocket::from_std(socket.into()).map_err(NetError::SocketCreate)
}

/// UDP socket bound on `port` for the listening side.
pub fn udp_bind(port: u16, bind: Option<Ipv4Addr>) -> Result<UdpSocket, NetError> {
    let addr = local_addr(port, bind);
    let socket = create(TransportKind::Datagram)?;
    socket
        .bind(&SockAddr::from(addr))
        .map_err(|source| NetError::Bind { addr, source })?;
    UdpSocket::from_std(socket.into()).map_err(NetError::SocketCreate)
}

/// Resolve `host` (dotted IPv4 literal or DNS name) to its first IPv4 address.
pub async fn resolve(host: &str) -> Result<Ipv4Addr, NetError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    let unresolved = || NetError::HostResolution { host: host.to_owned() };
    let addrs = tokio::net::lookup_host((host, 0)).await.map_err(|_| unresolved())?;
    first_v4(addrs).ok_or_else(unresolved)
}

fn first_v4(addrs: impl Iterator<Item = SocketAddr>) -> Option<Ipv4Addr> {
    addrs.into_iter().find_map(|a| match a {
        SocketAddr::V4(v4) => Some(*v4.ip()),
        SocketAddr::V6(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

    #[test]
    fn created_socket_options() {
        let socket = create(TransportKind::Stream).unwrap();
        assert_eq!(socket.linger().unwrap(), Some(Duration::ZERO));
        assert!(socket.reuse_address().unwrap());

        let socket = create(TransportKind::Datagram).unwrap();
        assert!(socket.reuse_address().unwrap());
    }

    #[tokio::test]
    async fn connect_and_accept() {
        let listener = listen(0, Some(LOCALHOST)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let (client, accepted) = tokio::join!(
            connect(SocketAddr::from((LOCALHOST, port)), Duration::from_secs(2)),
            accept(&listener, Duration::from_secs(2)),
        );
        let mut client = client.unwrap();
        let (mut server, peer) = accepted.unwrap().unwrap();
        assert_eq!(peer.ip, LOCALHOST);
        assert_eq!(peer.port, client.local_addr().unwrap().port());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn accept_wait_elapses() {
        let listener = listen(0, Some(LOCALHOST)).unwrap();
        let accepted = accept(&listener, Duration::from_millis(50)).await.unwrap();
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn connect_refused_is_not_a_timeout() {
        let port = {
            let spare = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
            spare.local_addr().unwrap().port()
        };
        let err = connect(SocketAddr::from((LOCALHOST, port)), Duration::from_secs(2))
            .await
            .unwrap_err();
        match err {
            NetError::Connect {
                failure: ConnectFailure::Syscall(_) | ConnectFailure::Status(_),
                ..
            } => {}
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn second_listener_on_same_port_fails_bind() {
        let first = listen(0, Some(LOCALHOST)).unwrap();
        let port = first.local_addr().unwrap().port();
        assert!(matches!(listen(port, Some(LOCALHOST)), Err(NetError::Bind { .. })));
    }

    #[tokio::test]
    async fn udp_pseudo_connection() {
        let server = udp_bind(0, Some(LOCALHOST)).unwrap();
        let port = server.local_addr().unwrap().port();
        let client = udp_connect(SocketAddr::from((LOCALHOST, port))).unwrap();

        client.send(b"datagram").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn resolve_literal_and_localhost() {
        assert_eq!(resolve("127.0.0.1").await.unwrap(), LOCALHOST);
        assert_eq!(resolve("10.0.0.7").await.unwrap(), Ipv4Addr::new(10, 0, 0, 7));
        assert!(matches!(
            resolve("no-such-host.invalid").await,
            Err(NetError::HostResolution { .. })
        ));
    }
}

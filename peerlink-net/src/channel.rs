//! Socket handle of a live link: a split TCP stream or a UDP pseudo-connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};

use crate::shared::lock;

/// Largest UDP payload over IPv4.
pub(crate) const MAX_DATAGRAM: usize = 65_507;

/// Receive buffer for one datagram; anything longer is truncated by the OS.
pub(crate) const DATAGRAM_BUF: usize = 65_536;

pub(crate) enum Channel {
    /// Reads and writes are each serialized; a heartbeat never lands inside a block.
    Stream {
        reader: tokio::sync::Mutex<OwnedReadHalf>,
        writer: tokio::sync::Mutex<OwnedWriteHalf>,
    },
    Datagram(DatagramChannel),
}

pub(crate) struct DatagramChannel {
    socket: UdpSocket,
    /// Default destination. Fixed for a connector; the last sender for a listener.
    peer: Mutex<Option<SocketAddr>>,
    connected: bool,
}

impl Channel {
    pub(crate) fn stream(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Channel::Stream {
            reader: tokio::sync::Mutex::new(reader),
            writer: tokio::sync::Mutex::new(writer),
        }
    }

    /// UDP socket already `connect`ed to `peer`.
    pub(crate) fn datagram_connected(socket: UdpSocket, peer: SocketAddr) -> Self {
        Channel::Datagram(DatagramChannel {
            socket,
            peer: Mutex::new(Some(peer)),
            connected: true,
        })
    }

    /// Bound UDP socket that learns its peer from inbound datagrams.
    pub(crate) fn datagram_bound(socket: UdpSocket) -> Self {
        Channel::Datagram(DatagramChannel {
            socket,
            peer: Mutex::new(None),
            connected: false,
        })
    }

    pub(crate) fn is_stream(&self) -> bool {
        matches!(self, Channel::Stream { .. })
    }

    /// Write all of `bytes`. Streams retry partial writes until done; a
    /// datagram goes out whole or fails.
    pub(crate) async fn write_all(&self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Channel::Stream { writer, .. } => {
                let mut writer = writer.lock().await;
                writer.write_all(bytes).await?;
                writer.flush().await
            }
            Channel::Datagram(dgram) => dgram.send(bytes).await,
        }
    }

    /// Pull-style read of whatever is available. 0 means the stream peer closed.
    pub(crate) async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Stream { reader, .. } => reader.lock().await.read(buf).await,
            Channel::Datagram(dgram) => dgram.recv(buf).await.map(|(n, _)| n),
        }
    }

    /// Half-close the write side so the peer sees end of stream. Skipped when
    /// a writer is mid-send; dropping the last handle still closes the socket.
    pub(crate) async fn close(&self) {
        if let Channel::Stream { writer, .. } = self {
            if let Ok(mut writer) = writer.try_lock() {
                let _ = writer.shutdown().await;
            }
        }
    }
}

impl DatagramChannel {
    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        *lock(&self.peer)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected
    }

    /// Receive one datagram. A listener adopts the sender as its peer.
    pub(crate) async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.connected {
            let n = self.socket.recv(buf).await?;
            let from = self.peer().unwrap_or(self.socket.peer_addr()?);
            return Ok((n, from));
        }
        let (n, from) = self.socket.recv_from(buf).await?;
        *lock(&self.peer) = Some(from);
        Ok((n, from))
    }

    async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let sent = if self.connected {
            self.socket.send(bytes).await?
        } else {
            let peer = self
                .peer()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no datagram peer yet"))?;
            self.socket.send_to(bytes, peer).await?
        };
        if sent != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("datagram truncated: {sent} of {} bytes", bytes.len()),
            ));
        }
        Ok(())
    }
}

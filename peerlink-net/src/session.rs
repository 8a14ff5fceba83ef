//! Per-connection tasks: the receive loop that turns inbound bytes into
//! handler calls, and the heartbeat loop that keeps a framed stream warm.
//!
//! A stream receive step reads up to one 16-byte unit first. A full unit
//! with the sign is completed to a 20-byte header and the body follows; a
//! full unit without it is a heartbeat, whatever its content. A short read
//! that cannot start the sign is noise, drained up to one maximum frame.
//! Each datagram is classified as a whole.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use peerlink_core::{
    classify, has_sign, FrameError, FrameHeader, Inbound, Mode, HEADER_LEN, HEARTBEAT_PROBE, PROBE_LEN, SIGN,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, DatagramChannel, DATAGRAM_BUF};
use crate::error::SessionError;
use crate::net;
use crate::shared::{Settings, Shared};
use crate::state::ConnectionState;

enum Step {
    Continue,
    /// Peer closed the stream.
    Closed,
}

pub(crate) struct Session {
    shared: Arc<Shared>,
    settings: Arc<Settings>,
    channel: Arc<Channel>,
}

impl Session {
    pub(crate) fn new(shared: Arc<Shared>, settings: Arc<Settings>, channel: Arc<Channel>) -> Self {
        Self {
            shared,
            settings,
            channel,
        }
    }

    /// A bound datagram socket has no peer until the first datagram arrives.
    fn waits_for_peer(&self) -> bool {
        matches!(&*self.channel, Channel::Datagram(dgram) if !dgram.is_connected())
    }

    /// A simplify stream without a handler leaves its bytes to `Link::receive`;
    /// the task then only keeps the session open.
    fn pull_only(&self) -> bool {
        self.settings.mode == Mode::Simplify && self.settings.handler.is_none()
    }

    fn alive(&self) -> bool {
        match self.shared.state.get() {
            ConnectionState::Connected => true,
            ConnectionState::Idle => self.waits_for_peer(),
            ConnectionState::Terminated => false,
        }
    }

    /// Receive until the peer goes away, the link leaves Connected, or stop.
    pub(crate) async fn receive(self) {
        let mut shutdown = self.shared.shutdown_signal();
        let mut scratch = Vec::new();
        while self.alive() {
            let step = tokio::select! {
                _ = shutdown.wait() => break,
                step = self.step(&mut scratch) => step,
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Closed) => {
                    info!("peer closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("{e}, dropping connection");
                    break;
                }
            }
        }
        if self.shared.state.disconnect() {
            debug!("link idle");
        }
        debug!("receive task terminate");
    }

    async fn step(&self, scratch: &mut Vec<u8>) -> Result<Step, SessionError> {
        let recv_timeout = self.settings.config.recv_timeout();
        match &*self.channel {
            Channel::Stream { reader, .. } => {
                if self.pull_only() {
                    tokio::time::sleep(recv_timeout).await;
                    return Ok(Step::Continue);
                }
                let mut reader = reader.lock().await;
                match timeout(recv_timeout, reader.readable()).await {
                    Err(_) => return Ok(Step::Continue),
                    Ok(ready) => ready?,
                }
                match self.settings.mode {
                    Mode::Framed => self.framed_stream(&mut reader, scratch).await,
                    Mode::Simplify => self.raw_stream(&mut reader, scratch).await,
                }
            }
            Channel::Datagram(dgram) => {
                scratch.resize(DATAGRAM_BUF, 0);
                let (n, from) = match timeout(recv_timeout, dgram.recv(scratch)).await {
                    Err(_) => return Ok(Step::Continue),
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) if self.waits_for_peer() => {
                        // A bound socket outlives any one sender; stay up.
                        warn!("datagram receive failed: {e}");
                        return Ok(Step::Continue);
                    }
                    Ok(Err(e)) => return Err(e.into()),
                };
                self.datagram_from(dgram, from);
                let unit = &mut scratch[..n];
                match self.settings.mode {
                    Mode::Framed => self.framed_datagram(unit),
                    Mode::Simplify => self.dispatch_raw(unit),
                }
                Ok(Step::Continue)
            }
        }
    }

    async fn framed_stream(&self, reader: &mut OwnedReadHalf, scratch: &mut Vec<u8>) -> Result<Step, SessionError> {
        let max_payload = self.settings.config.max_payload;
        let mut head = [0u8; HEADER_LEN];
        let got = reader.read(&mut head[..PROBE_LEN]).await?;
        if got == 0 {
            return Ok(Step::Closed);
        }
        let seen = got.min(SIGN.len());
        if got < PROBE_LEN && head[..seen] != SIGN[..seen] {
            return match drain(reader, HEADER_LEN + max_payload)? {
                None => Ok(Step::Closed),
                Some(n) => {
                    debug!("discarded {} unrecognized bytes", got + n);
                    Ok(Step::Continue)
                }
            };
        }
        let got = got + read_full(reader, &mut head[got..PROBE_LEN]).await?;
        if got < PROBE_LEN {
            return Err(FrameError::PartialHeader { needed: PROBE_LEN, got }.into());
        }
        if !has_sign(&head) {
            trace!("heartbeat received");
            return Ok(Step::Continue);
        }

        let rest = read_full(reader, &mut head[PROBE_LEN..]).await?;
        if PROBE_LEN + rest < HEADER_LEN {
            return Err(FrameError::PartialHeader {
                needed: HEADER_LEN,
                got: PROBE_LEN + rest,
            }
            .into());
        }
        let header = FrameHeader::parse(&head)?;

        let len = match header.body_len(max_payload) {
            Ok(len) => len,
            Err(e) => {
                warn!("{e}, skipping block");
                let want = u64::from(header.length);
                let skipped = tokio::io::copy(&mut (&mut *reader).take(want), &mut tokio::io::sink()).await?;
                if skipped < want {
                    return Ok(Step::Closed);
                }
                return Ok(Step::Continue);
            }
        };

        scratch.resize(len, 0);
        if read_full(reader, &mut scratch[..len]).await? < len {
            return Ok(Step::Closed);
        }
        self.deliver(&header, &mut scratch[..len]);
        Ok(Step::Continue)
    }

    async fn raw_stream(&self, reader: &mut OwnedReadHalf, scratch: &mut Vec<u8>) -> Result<Step, SessionError> {
        scratch.resize(self.settings.config.max_payload, 0);
        let n = reader.read(scratch).await?;
        if n == 0 {
            return Ok(Step::Closed);
        }
        self.dispatch(&scratch[..n]);
        Ok(Step::Continue)
    }

    /// A bound socket follows whoever sent last.
    fn datagram_from(&self, dgram: &DatagramChannel, from: std::net::SocketAddr) {
        if dgram.is_connected() {
            return;
        }
        self.shared.set_remote(net::host_info(from));
        let was = self.shared.state.get();
        if self.shared.state.connect() && was == ConnectionState::Idle {
            info!("datagram peer {from}");
        }
    }

    fn framed_datagram(&self, unit: &mut [u8]) {
        let (header, body_len) = match classify(unit) {
            Inbound::Block { header, body } => (header, body.len()),
            Inbound::Heartbeat => {
                trace!("heartbeat received");
                return;
            }
            Inbound::Unrecognized => {
                debug!("discarded {} byte datagram", unit.len());
                return;
            }
        };
        if let Err(e) = header.body_len(self.settings.config.max_payload) {
            warn!("{e}, skipping datagram");
            return;
        }
        self.deliver(&header, &mut unit[HEADER_LEN..HEADER_LEN + body_len]);
    }

    fn dispatch_raw(&self, unit: &[u8]) {
        if unit.is_empty() {
            trace!("empty datagram dropped");
            return;
        }
        self.dispatch(unit);
    }

    fn deliver(&self, header: &FrameHeader, body: &mut [u8]) {
        match self.shared.codec.decrypt_and_verify_in_place(header, body) {
            Ok(()) => self.dispatch(body),
            Err(e) => warn!("{e}, block dropped"),
        }
    }

    fn dispatch(&self, payload: &[u8]) {
        trace!(len = payload.len(), "payload");
        if let Some(handler) = &self.settings.handler {
            handler.on_payload(payload);
        }
    }
}

/// Send the probe every `interval` while connected. A failed send drops the link.
pub(crate) async fn heartbeat(shared: Arc<Shared>, channel: Arc<Channel>, interval: Duration) {
    let mut shutdown = shared.shutdown_signal();
    while shared.state.is_connected() {
        if let Err(e) = channel.write_all(&HEARTBEAT_PROBE).await {
            warn!("heartbeat send failed: {e}");
            shared.state.disconnect();
            break;
        }
        trace!("heartbeat sent");
        tokio::select! {
            _ = shutdown.wait() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("heartbeat task terminate");
}

/// Read until `buf` is full or the peer closes. Returns the bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]).await? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Discard what is already buffered, up to `limit` bytes. `None` if the peer closed.
fn drain(reader: &OwnedReadHalf, limit: usize) -> io::Result<Option<usize>> {
    let mut sink = [0u8; 4096];
    let mut total = 0;
    while total < limit {
        let want = sink.len().min(limit - total);
        match reader.try_read(&mut sink[..want]) {
            Ok(0) => return Ok(None),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    #[tokio::test]
    async fn failed_heartbeat_drops_the_link() {
        let listener = net::listen(0, Some(Ipv4Addr::LOCALHOST)).unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, listener.local_addr().unwrap().port()));
        let (client, accepted) = tokio::join!(
            net::connect(addr, Duration::from_secs(2)),
            net::accept(&listener, Duration::from_secs(2)),
        );
        let _server = accepted.unwrap().unwrap();
        let channel = Arc::new(Channel::stream(client.unwrap()));
        // Writes after the write side is shut down fail.
        channel.close().await;

        let shared = Arc::new(Shared::new(0));
        assert!(shared.state.connect());
        tokio::time::timeout(
            Duration::from_secs(2),
            heartbeat(shared.clone(), channel, Duration::from_millis(10)),
        )
        .await
        .unwrap();
        assert_eq!(shared.state.get(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn read_full_stops_at_eof() {
        let mut src: &[u8] = b"abc";
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut src, &mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");

        let mut src: &[u8] = b"0123456789";
        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut src, &mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"0123");
    }

    #[tokio::test]
    async fn read_full_joins_split_reads() {
        let mut src = split_reader(&[b"12", b"345", b"6"]);
        let mut buf = [0u8; 6];
        assert_eq!(read_full(&mut src, &mut buf).await.unwrap(), 6);
        assert_eq!(&buf, b"123456");
    }

    fn split_reader(parts: &[&[u8]]) -> impl AsyncRead + Unpin {
        let (client, mut server) = tokio::io::duplex(64);
        let parts: Vec<Vec<u8>> = parts.iter().map(|p| p.to_vec()).collect();
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for part in parts {
                server.write_all(&part).await.unwrap();
                tokio::task::yield_now().await;
            }
        });
        client
    }
}

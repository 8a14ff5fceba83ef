//! The application-facing link: configure, start, send, receive, stop.
//!
//! ```no_run
//! # async fn demo() -> Result<(), peerlink_net::LinkError> {
//! use peerlink_net::Link;
//!
//! let mut link = Link::connector("127.0.0.1", 8301);
//! link.on_payload(|payload: &[u8]| println!("{} bytes", payload.len()))?;
//! link.start()?;
//! // ... once connection_status() is true:
//! link.send(b"hello world!").await?;
//! link.stop().await;
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use peerlink_core::{HostInfo, Mode, Role, TransportKind, HEADER_LEN};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::MAX_DATAGRAM;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::shared::{lock, Endpoint, Settings, Shared};
use crate::state::ConnectionState;
use crate::supervisor;

/// Receives every payload the link delivers.
///
/// Called on the link's receive task: a slow handler stalls receiving, so
/// hand heavy work off (for example through a channel).
pub trait PayloadHandler: Send + Sync + 'static {
    fn on_payload(&self, payload: &[u8]);
}

impl<F> PayloadHandler for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn on_payload(&self, payload: &[u8]) {
        self(payload)
    }
}

/// One end of a supervised point-to-point link.
///
/// Mode, transport, config and handler are fixed once [`Link::start`] has run.
pub struct Link {
    shared: Arc<Shared>,
    settings: Settings,
    started: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Listening side on `port` (0 picks a free port; see [`Link::local_port`]).
    pub fn listener(port: u16) -> Self {
        Self::new(Endpoint::Listener { port, bind: None })
    }

    /// Connecting side. `host` is a dotted IPv4 literal or a DNS name. Names
    /// are resolved by the supervisor, again on every attempt until one works.
    pub fn connector(host: &str, port: u16) -> Self {
        let resolved = host.parse::<Ipv4Addr>().ok();
        if resolved.is_none() {
            debug!("{host} resolves after start");
        }
        Self::new(Endpoint::Connector {
            host: host.to_owned(),
            port,
            resolved,
        })
    }

    fn new(endpoint: Endpoint) -> Self {
        Self {
            shared: Arc::new(Shared::new(endpoint.port())),
            settings: Settings::new(endpoint),
            started: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    /// Bind the listener to one local address instead of all of them.
    /// No effect on a connector.
    pub fn with_bind_address(mut self, ip: Ipv4Addr) -> Self {
        if let Endpoint::Listener { bind, .. } = &mut self.settings.endpoint {
            *bind = Some(ip);
        }
        self
    }

    fn ensure_not_started(&self) -> Result<(), LinkError> {
        if self.started.load(Ordering::Acquire) {
            return Err(LinkError::AlreadyStarted);
        }
        Ok(())
    }

    pub fn set_mode(&mut self, mode: Mode) -> Result<(), LinkError> {
        self.ensure_not_started()?;
        self.settings.mode = mode;
        Ok(())
    }

    pub fn set_transport(&mut self, transport: TransportKind) -> Result<(), LinkError> {
        self.ensure_not_started()?;
        self.settings.transport = transport;
        Ok(())
    }

    /// Replace the config. Rejected if it does not validate.
    pub fn set_config(&mut self, config: LinkConfig) -> Result<(), LinkError> {
        self.ensure_not_started()?;
        config.validate()?;
        self.settings.config = config;
        Ok(())
    }

    pub fn on_payload(&mut self, handler: impl PayloadHandler) -> Result<(), LinkError> {
        self.ensure_not_started()?;
        self.settings.handler = Some(Arc::new(handler));
        Ok(())
    }

    /// Spawn the supervisor on the current tokio runtime and return at once.
    pub fn start(&self) -> Result<(), LinkError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| LinkError::NoRuntime)?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(LinkError::AlreadyStarted);
        }
        debug!(role = ?self.role(), transport = ?self.settings.transport, mode = ?self.settings.mode, "starting link");
        let run = supervisor::run(self.shared.clone(), Arc::new(self.settings.clone()));
        *lock(&self.supervisor) = Some(runtime.spawn(run));
        Ok(())
    }

    /// Terminate the link and wait for its tasks to exit. Idempotent; a
    /// stopped link stays stopped.
    pub async fn stop(&self) {
        if self.shared.state.terminate() {
            debug!("stopping link");
        }
        self.shared.signal_shutdown();
        if let Some(channel) = self.shared.take_channel() {
            channel.close().await;
        }
        let supervisor = lock(&self.supervisor).take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                error!("supervisor task failed: {e}");
            }
        }
    }

    /// Send one payload. Framed mode writes header plus ciphertext; simplify
    /// writes the bytes as they are. Returns the payload length.
    ///
    /// A write failure drops the link to idle; the supervisor reconnects.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, LinkError> {
        if !self.shared.state.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let max = self.settings.config.max_payload;
        if payload.len() > max {
            return Err(LinkError::PayloadTooLarge { len: payload.len(), max });
        }
        let channel = self.shared.channel().ok_or(LinkError::NotConnected)?;

        let wire = match self.settings.mode {
            Mode::Framed => Cow::Owned(self.shared.codec.encode(payload)?),
            Mode::Simplify => Cow::Borrowed(payload),
        };
        if self.settings.transport == TransportKind::Datagram && wire.len() > MAX_DATAGRAM {
            let overhead = wire.len() - payload.len();
            return Err(LinkError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_DATAGRAM - overhead,
            });
        }

        let mut shutdown = self.shared.shutdown_signal();
        let written = tokio::select! {
            _ = shutdown.wait() => return Err(LinkError::NotConnected),
            written = channel.write_all(&wire) => written,
        };
        match written {
            Ok(()) => Ok(payload.len()),
            Err(e) => {
                if self.shared.state.disconnect() {
                    warn!("send failed, link idle: {e}");
                }
                Err(LinkError::WriteFailed(e))
            }
        }
    }

    /// Pull-style read straight from the socket, bypassing framing. 0 means
    /// the stream peer closed, and the link goes idle. Meant for simplify
    /// streams without a handler; otherwise the receive task reads too.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if !self.shared.state.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let channel = self.shared.channel().ok_or(LinkError::NotConnected)?;
        let mut shutdown = self.shared.shutdown_signal();
        let read = tokio::select! {
            _ = shutdown.wait() => return Err(LinkError::NotConnected),
            read = channel.read(buf) => read,
        };
        match read {
            Ok(0) if channel.is_stream() => {
                if self.shared.state.disconnect() {
                    info!("peer closed the connection");
                }
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                if self.shared.state.disconnect() {
                    warn!("receive failed, link idle: {e}");
                }
                Err(LinkError::ReadFailed(e))
            }
        }
    }

    pub fn connection_status(&self) -> bool {
        self.shared.state.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Peer captured at the last connect or accept.
    pub fn remote_host_info(&self) -> Option<HostInfo> {
        self.shared.remote()
    }

    /// Listener: the bound port once listening (the configured one before).
    /// Connector: the remote port.
    pub fn local_port(&self) -> u16 {
        match self.settings.endpoint {
            Endpoint::Listener { .. } => self.shared.bound_port(),
            Endpoint::Connector { port, .. } => port,
        }
    }

    pub fn role(&self) -> Role {
        self.settings.endpoint.role()
    }

    pub fn mode(&self) -> Mode {
        self.settings.mode
    }

    pub fn transport(&self) -> TransportKind {
        self.settings.transport
    }

    pub fn config(&self) -> &LinkConfig {
        &self.settings.config
    }

    /// Largest payload a single `send` accepts with the current settings.
    pub fn max_send(&self) -> usize {
        let max = self.settings.config.max_payload;
        match (self.settings.transport, self.settings.mode) {
            (TransportKind::Stream, _) => max,
            (TransportKind::Datagram, Mode::Framed) => max.min(MAX_DATAGRAM - HEADER_LEN),
            (TransportKind::Datagram, Mode::Simplify) => max.min(MAX_DATAGRAM),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shared.state.terminate();
        self.shared.signal_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_handlers() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn PayloadHandler> = Arc::new(move |p: &[u8]| sink.lock().unwrap().push(p.to_vec()));
        handler.on_payload(b"abc");
        assert_eq!(*seen.lock().unwrap(), vec![b"abc".to_vec()]);
    }

    #[test]
    fn start_needs_a_runtime() {
        let link = Link::listener(0);
        assert!(matches!(link.start(), Err(LinkError::NoRuntime)));
        assert_eq!(link.state(), ConnectionState::Idle);
    }

    #[test]
    fn connector_defers_name_resolution() {
        let named = Link::connector("localhost", 8301);
        assert!(matches!(named.settings.endpoint, Endpoint::Connector { resolved: None, .. }));

        let literal = Link::connector("10.0.0.7", 8301);
        assert!(matches!(
            literal.settings.endpoint,
            Endpoint::Connector {
                resolved: Some(ip),
                ..
            } if ip == Ipv4Addr::new(10, 0, 0, 7)
        ));
    }

    #[test]
    fn unresolved_connector_is_still_constructed() {
        let link = Link::connector("no-such-host.invalid", 8301);
        assert_eq!(link.role(), Role::Connector);
        assert_eq!(link.local_port(), 8301);
        assert!(!link.connection_status());
    }

    #[test]
    fn settings_and_limits() {
        let mut link = Link::listener(8301).with_bind_address(Ipv4Addr::LOCALHOST);
        assert_eq!(link.mode(), Mode::Framed);
        assert_eq!(link.transport(), TransportKind::Stream);
        assert_eq!(link.max_send(), 4 * 1024 * 1024);

        link.set_transport(TransportKind::Datagram).unwrap();
        assert_eq!(link.max_send(), MAX_DATAGRAM - HEADER_LEN);
        link.set_mode(Mode::Simplify).unwrap();
        assert_eq!(link.max_send(), MAX_DATAGRAM);

        let bad = LinkConfig {
            recv_timeout_ms: 0,
            ..LinkConfig::default()
        };
        assert!(matches!(link.set_config(bad), Err(LinkError::Config(_))));
    }

    #[tokio::test]
    async fn send_before_connect() {
        let link = Link::listener(0).with_bind_address(Ipv4Addr::LOCALHOST);
        assert!(matches!(link.send(b"x").await, Err(LinkError::NotConnected)));
        let mut buf = [0u8; 4];
        assert!(matches!(link.receive(&mut buf).await, Err(LinkError::NotConnected)));
    }
}

//! State shared between a [`crate::Link`] handle and its background tasks.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use peerlink_core::{FrameCodec, HostInfo, Mode, Role, TransportKind};
use tokio::sync::watch;

use crate::channel::Channel;
use crate::config::LinkConfig;
use crate::link::PayloadHandler;
use crate::state::LinkState;

/// Lock a std mutex, ignoring poison: guarded values stay valid after a panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
pub(crate) enum Endpoint {
    Listener {
        port: u16,
        bind: Option<Ipv4Addr>,
    },
    Connector {
        host: String,
        port: u16,
        /// Address resolved at construction, if resolution succeeded then.
        resolved: Option<Ipv4Addr>,
    },
}

impl Endpoint {
    pub(crate) fn role(&self) -> Role {
        match self {
            Endpoint::Listener { .. } => Role::Listener,
            Endpoint::Connector { .. } => Role::Connector,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        match self {
            Endpoint::Listener { port, .. } | Endpoint::Connector { port, .. } => *port,
        }
    }
}

/// Everything fixed at `start`.
#[derive(Clone)]
pub(crate) struct Settings {
    pub(crate) endpoint: Endpoint,
    pub(crate) transport: TransportKind,
    pub(crate) mode: Mode,
    pub(crate) config: LinkConfig,
    pub(crate) handler: Option<Arc<dyn PayloadHandler>>,
}

impl Settings {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            transport: TransportKind::default(),
            mode: Mode::default(),
            config: LinkConfig::default(),
            handler: None,
        }
    }
}

pub(crate) struct Shared {
    pub(crate) codec: FrameCodec,
    pub(crate) state: LinkState,
    channel: Mutex<Option<Arc<Channel>>>,
    remote: Mutex<Option<HostInfo>>,
    bound_port: AtomicU16,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn new(port: u16) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            codec: FrameCodec::new(),
            state: LinkState::new(),
            channel: Mutex::new(None),
            remote: Mutex::new(None),
            bound_port: AtomicU16::new(port),
            shutdown,
        }
    }

    pub(crate) fn channel(&self) -> Option<Arc<Channel>> {
        lock(&self.channel).clone()
    }

    pub(crate) fn install(&self, channel: Arc<Channel>) {
        *lock(&self.channel) = Some(channel);
    }

    pub(crate) fn take_channel(&self) -> Option<Arc<Channel>> {
        lock(&self.channel).take()
    }

    pub(crate) fn remote(&self) -> Option<HostInfo> {
        *lock(&self.remote)
    }

    pub(crate) fn set_remote(&self, info: HostInfo) {
        *lock(&self.remote) = Some(info);
    }

    pub(crate) fn bound_port(&self) -> u16 {
        self.bound_port.load(Ordering::Acquire)
    }

    pub(crate) fn set_bound_port(&self, port: u16) {
        self.bound_port.store(port, Ordering::Release);
    }

    pub(crate) fn shutdown_signal(&self) -> Shutdown {
        Shutdown(self.shutdown.subscribe())
    }

    /// Wake every task parked on a [`Shutdown`].
    pub(crate) fn signal_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// Receiver side of the stop signal, raced against every blocking wait.
pub(crate) struct Shutdown(watch::Receiver<bool>);

impl Shutdown {
    /// Resolves once stop has been requested (immediately if it already was).
    pub(crate) async fn wait(&mut self) {
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn shutdown_wakes_late_and_early_waiters() {
        let shared = Shared::new(0);
        let mut early = shared.shutdown_signal();
        let waiter = tokio::spawn(async move { early.wait().await });

        shared.signal_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        let mut late = shared.shutdown_signal();
        tokio::time::timeout(Duration::from_secs(1), late.wait()).await.unwrap();
    }

    #[test]
    fn endpoint_role_and_port() {
        let listener = Endpoint::Listener { port: 8301, bind: None };
        assert_eq!(listener.role(), Role::Listener);
        assert_eq!(listener.port(), 8301);

        let connector = Endpoint::Connector {
            host: "localhost".into(),
            port: 8302,
            resolved: None,
        };
        assert_eq!(connector.role(), Role::Connector);
        assert_eq!(connector.port(), 8302);
    }
}

//! Long-lived task per started link. A connector keeps (re)connecting; a
//! listener binds once and keeps accepting. Each established connection
//! runs as one session: a receive task, plus a heartbeat task for framed
//! streams, both joined before the next attempt.

use std::net::SocketAddr;
use std::sync::Arc;

use peerlink_core::TransportKind;
use tracing::{debug, error, info, instrument, warn, Instrument, Span};

use crate::channel::Channel;
use crate::net::{self, NetError};
use crate::session::{self, Session};
use crate::shared::{Endpoint, Settings, Shared, Shutdown};

#[instrument(name = "link", skip_all, fields(role = ?settings.endpoint.role(), port = settings.endpoint.port()))]
pub(crate) async fn run(shared: Arc<Shared>, settings: Arc<Settings>) {
    match (&settings.endpoint, settings.transport) {
        (Endpoint::Connector { .. }, _) => connector(&shared, &settings).await,
        (Endpoint::Listener { .. }, TransportKind::Stream) => stream_listener(&shared, &settings).await,
        (Endpoint::Listener { .. }, TransportKind::Datagram) => datagram_listener(&shared, &settings).await,
    }
    debug!("supervisor terminate");
}

async fn connector(shared: &Arc<Shared>, settings: &Arc<Settings>) {
    let Endpoint::Connector { host, port, resolved } = &settings.endpoint else {
        return;
    };
    let mut shutdown = shared.shutdown_signal();
    let mut ip = *resolved;
    while !shared.state.is_terminated() {
        if ip.is_none() {
            match net::resolve(host).await {
                Ok(addr) => {
                    info!("resolved {host} to {addr}");
                    ip = Some(addr);
                }
                Err(e) => warn!("{e}"),
            }
        }
        if let Some(ip) = ip {
            let target = SocketAddr::from((ip, *port));
            debug!("connecting {target}...");
            let opened = tokio::select! {
                _ = shutdown.wait() => break,
                opened = open(settings, target) => opened,
            };
            match opened {
                Ok(channel) => {
                    shared.set_remote(net::host_info(target));
                    info!("connected to {target}");
                    run_session(shared, settings, channel, true).await;
                }
                Err(e) => debug!("{e}"),
            }
        }
        if !pause(&mut shutdown, settings).await {
            break;
        }
    }
}

async fn open(settings: &Settings, target: SocketAddr) -> Result<Arc<Channel>, NetError> {
    let channel = match settings.transport {
        TransportKind::Stream => Channel::stream(net::connect(target, settings.config.connect_timeout()).await?),
        TransportKind::Datagram => Channel::datagram_connected(net::udp_connect(target)?, target),
    };
    Ok(Arc::new(channel))
}

async fn stream_listener(shared: &Arc<Shared>, settings: &Arc<Settings>) {
    let Endpoint::Listener { port, bind } = &settings.endpoint else {
        return;
    };
    let listener = match net::listen(*port, *bind) {
        Ok(listener) => listener,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    if let Ok(addr) = listener.local_addr() {
        shared.set_bound_port(addr.port());
    }
    info!("listening on {}...", shared.bound_port());

    let mut shutdown = shared.shutdown_signal();
    let mut budget = settings.config.accept_budget;
    while !shared.state.is_terminated() {
        let accepted = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = net::accept(&listener, settings.config.accept_timeout()) => accepted,
        };
        match accepted {
            Ok(None) => continue,
            Ok(Some((stream, peer))) => {
                info!("accepted connection from {peer}");
                shared.set_remote(peer);
                run_session(shared, settings, Arc::new(Channel::stream(stream)), true).await;
            }
            Err(e) => {
                warn!("{e}");
                if !pause(&mut shutdown, settings).await {
                    break;
                }
            }
        }
        if let Some(left) = budget.as_mut() {
            *left = left.saturating_sub(1);
            if *left == 0 {
                info!("accept budget exhausted");
                break;
            }
        }
    }
}

async fn datagram_listener(shared: &Arc<Shared>, settings: &Arc<Settings>) {
    let Endpoint::Listener { port, bind } = &settings.endpoint else {
        return;
    };
    let socket = match net::udp_bind(*port, *bind) {
        Ok(socket) => socket,
        Err(e) => {
            error!("{e}");
            return;
        }
    };
    if let Ok(addr) = socket.local_addr() {
        shared.set_bound_port(addr.port());
    }
    info!("listening on {} (datagram)...", shared.bound_port());
    run_session(shared, settings, Arc::new(Channel::datagram_bound(socket)), false).await;
}

/// Install `channel`, run its tasks to completion, then release it.
/// `connected` marks the link Connected up front; a bound datagram socket
/// instead connects on its first inbound datagram.
async fn run_session(shared: &Arc<Shared>, settings: &Arc<Settings>, channel: Arc<Channel>, connected: bool) {
    shared.install(channel.clone());
    if connected && !shared.state.connect() {
        shared.take_channel();
        return;
    }

    let receive = Session::new(shared.clone(), settings.clone(), channel.clone()).receive();
    let receive = tokio::spawn(receive.instrument(Span::current()));
    let heartbeat = settings.mode.heartbeat(settings.transport).then(|| {
        let beat = session::heartbeat(shared.clone(), channel, settings.config.heartbeat_interval());
        tokio::spawn(beat.instrument(Span::current()))
    });

    if let Err(e) = receive.await {
        error!("receive task failed: {e}");
    }
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
        let _ = heartbeat.await;
    }

    shared.state.disconnect();
    if let Some(channel) = shared.take_channel() {
        channel.close().await;
    }
}

/// Sleep one retry interval. False if stop was requested meanwhile.
async fn pause(shutdown: &mut Shutdown, settings: &Settings) -> bool {
    tokio::select! {
        _ = shutdown.wait() => false,
        _ = tokio::time::sleep(settings.config.conn_interval()) => true,
    }
}

// peerlink: line-oriented link endpoint. Stdin lines go out as payloads,
// received payloads are printed.
//
//   peerlink listen [port] [--udp] [--simplify]
//   peerlink connect <host> [port] [--udp] [--simplify]

use std::io::Write;

use anyhow::{bail, Context};
use peerlink_net::{config, Link, Mode, TransportKind};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log filter used when RUST_LOG is unset or unparsable.
const DEFAULT_LOG: &str = "peerlink_net=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut flags = Vec::new();
    let mut words = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg.starts_with('-') {
            flags.push(arg);
        } else {
            words.push(arg);
        }
    }
    if flags.iter().any(|f| f == "--version" || f == "-V") {
        println!("peerlink {VERSION}");
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_writer(std::io::stderr)
        .init();

    let cfg = config::load();
    let port_arg = |i: usize| -> anyhow::Result<u16> {
        match words.get(i) {
            Some(p) => p.parse().with_context(|| format!("bad port {p:?}")),
            None => Ok(cfg.data_port),
        }
    };
    let mut link = match words.first().map(String::as_str) {
        Some("listen") => Link::listener(port_arg(1)?),
        Some("connect") => {
            let host = words.get(1).context("connect needs a host")?;
            Link::connector(host, port_arg(2)?)
        }
        _ => bail!("usage: peerlink listen [port] | peerlink connect <host> [port] [--udp] [--simplify]"),
    };
    if flags.iter().any(|f| f == "--udp") {
        link.set_transport(TransportKind::Datagram)?;
    }
    if flags.iter().any(|f| f == "--simplify") {
        link.set_mode(Mode::Simplify)?;
    }
    link.set_config(cfg)?;
    link.on_payload(|payload: &[u8]| {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(payload);
        let _ = out.write_all(b"\n");
        let _ = out.flush();
    })?;
    link.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            res = shutdown_signal() => {
                res?;
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => {
                    if let Err(e) = link.send(line.as_bytes()).await {
                        tracing::warn!("not sent: {e}");
                    }
                }
                None => break,
            },
        }
    }
    link.stop().await;
    Ok(())
}

fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG))
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

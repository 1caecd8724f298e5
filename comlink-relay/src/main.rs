// Comlink relay: dials the configured devices, forwards routed traffic, stops on ENTER.

mod config;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use comlink_core::{Radio, RelayManager, TcpRadio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const ACCEPT_POLL: Duration = Duration::from_millis(200);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("comlink-relay {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let mut radio = match cfg.listen {
        Some(addr) => TcpRadio::bind(cfg.name.clone(), addr)
            .with_context(|| format!("cannot listen on {addr}"))?,
        None => TcpRadio::new(cfg.name.clone()),
    }
    .with_hello_timeout(cfg.link.hello_timeout());
    for (device, addr) in &cfg.devices {
        radio = radio.with_peer(device.clone(), *addr);
    }
    let radio: Arc<dyn Radio> = Arc::new(radio);
    let devices: Vec<String> = cfg.devices.keys().cloned().collect();
    let relay = Arc::new(RelayManager::start(
        cfg.name.clone(),
        cfg.link.clone(),
        radio.as_ref(),
        &devices,
    ));

    if let Some(addr) = cfg.listen {
        info!(%addr, "accepting devices");
        let relay = relay.clone();
        let radio = radio.clone();
        thread::Builder::new()
            .name("comlink-accept".into())
            .spawn(move || accept_loop(&relay, radio.as_ref()))?;
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(shutdown_signal())?;

    relay.close();
    Ok(())
}

fn accept_loop(relay: &RelayManager, radio: &dyn Radio) {
    while !relay.is_closing() {
        match relay.accept(radio, ACCEPT_POLL) {
            Ok(Some(device)) => info!(%device, "device dialed in"),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "accepting device failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Wait for ENTER, end of stdin, Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    println!("Relay running. Press ENTER to stop.");
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
            _ = stdin.next_line() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = stdin.next_line() => {}
        }
    }
    info!("shutting down");
    Ok(())
}

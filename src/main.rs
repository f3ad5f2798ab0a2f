use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use tftpd::config::{Cli, Config};
use tftpd::demux::Demux;
use tftpd::events::{ServerEvent, log_event};
use tftpd::io::{DatagramIo, SystemClock, TokioDatagramIo, TokioFileSystem};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(cli.log_filter()).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let dir = std::fs::canonicalize(&cli.dir)
        .with_context(|| format!("cannot canonicalize served directory {:?}", cli.dir))?;
    let config = Config::from(&cli);

    let listen_addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.port).parse().unwrap();
    let listening = TokioDatagramIo
        .bind(listen_addr)
        .await
        .with_context(|| format!("cannot bind UDP port {}", config.port))?;

    let (ev_tx, ev_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let _ = ev_tx.send(ServerEvent::Log(format!(
        "listening on 0.0.0.0:{} serving {}",
        config.port,
        dir.display()
    )));

    let demux = Demux::new(
        listening,
        dir,
        Arc::new(TokioDatagramIo),
        Arc::new(TokioFileSystem),
        Arc::new(SystemClock),
        config,
        ev_tx,
    );

    let local = tokio::task::LocalSet::new();
    local
        .run_until(drive(demux, ev_rx, shutdown_tx, shutdown_rx))
        .await;

    Ok(())
}

async fn drive(
    demux: Demux,
    mut ev_rx: mpsc::UnboundedReceiver<ServerEvent>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let events_task = tokio::task::spawn_local(async move {
        while let Some(ev) = ev_rx.recv().await {
            log_event(&ev);
        }
    });

    let ctrlc_task = tokio::task::spawn_local(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    demux.run(shutdown_rx).await;

    ctrlc_task.abort();
    events_task.abort();
}

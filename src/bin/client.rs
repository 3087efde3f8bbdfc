//! Client-side entry point (spec §6 "CLI plumbing").
//!
//! This binary owns the tunnel-facing half of the system: it loads the
//! embedded config, builds a [`Diverter`], and wires it to the two channels
//! that stand in for the kernel-mode packet hook (spec §1, out of scope
//! here). A real deployment replaces `run_packet_source_stub` with whatever
//! drives those channels from the OS.

use std::net::Ipv4Addr;

use anyhow::Context;
use clap::Parser;
use dnf_relay_tunnel::config;
use dnf_relay_tunnel::diverter::{Diverter, DiverterConfig};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Diverts local game traffic through a relay tunnel.")]
struct Args {
    /// Override the embedded game server address instead of reading it from the binary.
    #[arg(long)]
    game_server_ip: Option<Ipv4Addr>,

    /// Override the embedded relay host.
    #[arg(long)]
    tunnel_server_ip: Option<String>,

    /// Override the embedded relay port.
    #[arg(long)]
    tunnel_port: Option<u16>,

    /// The client's own IPv4 address, as the relay's UDP bootstrap will see it.
    #[arg(long, default_value = "127.0.0.1")]
    client_ip: Ipv4Addr,

    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let embedded = config::load_embedded_client_config().ok();

    let game_server_ip = match args.game_server_ip {
        Some(ip) => ip,
        None => embedded
            .as_ref()
            .context("no embedded config found; pass --game-server-ip")?
            .game_server_ip
            .parse()
            .context("embedded game_server_ip is not a valid IPv4 address")?,
    };
    let tunnel_server_ip = args.tunnel_server_ip.or_else(|| {
        embedded.as_ref().map(|c| c.tunnel_server_ip.clone())
    }).context("no relay host: pass --tunnel-server-ip or embed a config")?;
    let tunnel_port = match args.tunnel_port.or_else(|| embedded.as_ref().map(|c| c.tunnel_port)) {
        Some(p) => p,
        None => anyhow::bail!("no relay port: pass --tunnel-port or embed a config"),
    };

    info!(%game_server_ip, %tunnel_server_ip, tunnel_port, "starting client diverter");

    let (injector_tx, injector_rx) = mpsc::unbounded_channel();
    let (incoming_tx, incoming_rx) = mpsc::channel(1024);

    // Stands in for the kernel-mode hook (spec §1): it would feed diverted
    // packets into `incoming_tx` and drain synthesised packets out of
    // `injector_rx` for re-injection. Kept alive here only so the diverter
    // doesn't see a closed channel and exit immediately.
    tokio::spawn(run_packet_source_stub(injector_rx));

    let diverter = Diverter::new(
        DiverterConfig {
            game_server_ip,
            relay_host: tunnel_server_ip,
            relay_port: tunnel_port,
        },
        args.client_ip,
        injector_tx,
    );

    let _incoming_tx = incoming_tx;
    diverter.run(incoming_rx).await;
    Ok(())
}

async fn run_packet_source_stub(mut injector_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(packet) = injector_rx.recv().await {
        tracing::trace!(len = packet.len(), "synthesised packet awaiting re-injection by the OS hook");
    }
}

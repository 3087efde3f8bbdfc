//! Relay entry point (spec §6 "CLI plumbing", "Exit codes").
//!
//! Binds one [`RelayServer`] per `servers[]` entry in the config file. A
//! `SIGHUP` re-reads the config and swaps the listener set; anything bound
//! under the old config keeps running until its replacement is confirmed up.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dnf_relay_tunnel::config::{self, RelayConfig};
use dnf_relay_tunnel::relay::RelayServer;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Relay server: forwards tunnel connections to game servers.")]
struct Args {
    /// Path to the relay's JSON config file.
    #[arg(long, default_value = "relay.json")]
    config: PathBuf,

    /// Overrides the config file's `log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = config::load_relay_config(&args.config)
        .with_context(|| format!("failed to load relay config from {}", args.config.display()))?;

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut handles = spawn_servers(&config).await?;
    info!(count = handles.len(), "relay servers listening");

    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("failed to install sighup handler")?;

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!(path = %args.config.display(), "sighup received, reloading config");
                match config::load_relay_config(&args.config) {
                    Ok(new_config) => match spawn_servers(&new_config).await {
                        Ok(new_handles) => {
                            for h in handles.drain(..) {
                                h.abort();
                            }
                            handles = new_handles;
                            info!(count = handles.len(), "relay servers reloaded");
                        }
                        Err(e) => {
                            error!(error = %e, "failed to bind servers from reloaded config, keeping old listeners");
                        }
                    },
                    Err(e) => error!(error = %e, "failed to reload relay config, keeping old listeners"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received, shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn spawn_servers(config: &RelayConfig) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(config.servers.len());
    for entry in &config.servers {
        let game_server_ip: IpAddr = entry
            .game_server_ip
            .parse()
            .with_context(|| format!("server `{}` has an invalid game_server_ip", entry.name))?;
        let server = RelayServer::new(entry.name.clone(), entry.listen_port, game_server_ip)
            .with_context(|| format!("server `{}` failed to initialise", entry.name))?;
        let listener = server
            .bind()
            .await
            .with_context(|| format!("server `{}` failed to bind port {}", entry.name, entry.listen_port))?;
        let name = entry.name.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                warn!(error = %e, server = %name, "relay server exited");
            }
        }));
    }
    Ok(handles)
}

//! fleetd — fleet orchestrator daemon.
//!
//! `fleetd server` runs the engine, the bus hub and the liveness detector.
//! `fleetd agent` runs the node-agent dispatcher on a cluster node.
//! `fleetd submit <request.json>` hands an operation request to a server.

use anyhow::{bail, Result};

use fleet_core::config::FleetConfig;

mod agent;
mod server;
mod signal;
mod submit;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = FleetConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = FleetConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        FleetConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| "server".to_string());

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    match mode.as_str() {
        "server" => server::run(config, shutdown_tx).await,
        "agent" => agent::run(config, shutdown_tx).await,
        "submit" => {
            let Some(path) = args.next() else {
                bail!("usage: fleetd submit <request.json>");
            };
            submit::run(&config, &path).await
        }
        other => bail!("unknown mode {other:?}, expected server, agent or submit"),
    }
}

/// This machine's hostname, used when no node id or engine host is configured.
pub(crate) fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_string())
}

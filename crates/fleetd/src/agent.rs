//! Agent mode: dispatcher over a TCP bus connection, reconnecting when the
//! server goes away.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;

use fleet_core::config::FleetConfig;
use fleet_core::ProviderError;
use fleet_services::provider::platform::{self, ProviderSettings};
use fleet_services::{
    CapabilityProvider, ClientRuntimeConfig, Dispatcher, RuntimeCache, ShellRunner, TcpBus,
};

use crate::signal;

pub async fn run(config: FleetConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let node_id = match config.node.node_id.as_str() {
        "" => crate::hostname(),
        id => id.to_string(),
    };
    let group = config.node.group.clone();

    let cache = RuntimeCache::new();
    let runtime = ClientRuntimeConfig::from_config(&config, &node_id);
    if let Err(e) = std::fs::create_dir_all(&runtime.work_dir) {
        tracing::warn!(path = %runtime.work_dir.display(), error = %e, "failed to create work dir");
    }
    cache.set_client_runtime_config(runtime.clone());

    let signal_task = tokio::spawn(signal::serve(
        config.agent.signal_port,
        shutdown_tx.subscribe(),
    ));

    let grace = Duration::from_secs(config.agent.shutdown_grace_secs);
    let reconnect = Duration::from_secs(config.bus.reconnect_secs.max(1));
    let mut shutdown = shutdown_tx.subscribe();
    tracing::info!(%node_id, %group, server = %config.bus.server_addr, "fleetd agent starting");

    loop {
        match TcpBus::connect(&config.bus.server_addr).await {
            Ok(bus) => {
                tracing::info!(server = %config.bus.server_addr, "connected to bus");
                let dispatcher = Dispatcher::new(
                    node_id.as_str(),
                    group.as_str(),
                    Arc::new(bus),
                    provider(&config, &runtime),
                    cache.clone(),
                    shutdown_tx.clone(),
                );
                match dispatcher.run(grace).await {
                    Ok(()) => break,
                    Err(e) => tracing::warn!(error = %e, "bus connection lost"),
                }
            }
            Err(e) => tracing::warn!(error = %e, "bus connect failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(reconnect) => {}
            _ = shutdown.recv() => break,
        }
    }

    signal_task.abort();
    tracing::info!("agent stopped");
    Ok(())
}

/// Resolve the capability provider for this host's OS.
fn provider(
    config: &FleetConfig,
    runtime: &ClientRuntimeConfig,
) -> Result<Arc<dyn CapabilityProvider>, ProviderError> {
    let detected = platform::detect(&config.agent.os_release_path);
    let resolved = detected.and_then(|p| {
        tracing::info!(platform = %p, "detected platform");
        platform::resolve(
            &p,
            Arc::new(ShellRunner::new(runtime.work_dir.clone())),
            ProviderSettings::from_runtime(runtime, "/"),
        )
    });
    if let Err(e) = &resolved {
        tracing::error!(error = %e, "no capability provider, every task will fail");
    }
    resolved
}

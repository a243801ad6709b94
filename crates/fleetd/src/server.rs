//! Server mode: bus hub, engine, liveness detector and operation intake.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use fleet_core::config::FleetConfig;
use fleet_core::envelope::subjects;
use fleet_core::model::short;
use fleet_core::{EngineError, Operation, OperationRequest};
use fleet_services::bus::serve_hub;
use fleet_services::engine::plan;
use fleet_services::{
    Bus, BusMessage, Engine, EngineSettings, LivenessDetector, LocalBus, MemoryStore,
    RuntimeCache, ServerRuntimeConfig, Store, TcpProber,
};

use crate::submit::SubmitResponse;

pub async fn run(config: FleetConfig, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let host = match config.server.host.as_str() {
        "" => crate::hostname(),
        h => h.to_string(),
    };

    let bus = LocalBus::new();
    let listener = TcpListener::bind(&config.bus.listen_addr)
        .await
        .with_context(|| format!("failed to bind bus hub on {}", config.bus.listen_addr))?;
    let hub_task = tokio::spawn(serve_hub(listener, bus.clone(), shutdown_tx.subscribe()));

    let store = Arc::new(MemoryStore::with_persistence(config.server.state_path.clone()));
    tracing::info!(path = %config.server.state_path.display(), "state store ready");

    let cache = RuntimeCache::new();
    cache.set_server_runtime_config(ServerRuntimeConfig::from_config(&config, &host));
    let settings = cache
        .server_runtime_config()
        .map(|cfg| EngineSettings::from(&cfg))
        .context("server runtime config missing")?;

    let engine = Engine::new(settings, Arc::new(bus.clone()), store.clone());
    engine.start().await?;

    let liveness_task = if config.liveness.enabled {
        let detector = LivenessDetector::new(
            store.clone(),
            Arc::new(TcpProber),
            config.liveness.clone(),
        );
        Some(tokio::spawn(detector.run(shutdown_tx.subscribe())))
    } else {
        tracing::info!("liveness detector disabled");
        None
    };

    let mut submissions = bus.subscribe(subjects::SUBMIT, None).await?;
    let mut shutdown = shutdown_tx.subscribe();
    tracing::info!(%host, "fleetd server ready");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("shutting down");
                break;
            }
            msg = submissions.next() => {
                let Some(msg) = msg else { break };
                let response = match intake(&engine, store.as_ref(), &msg.payload) {
                    Ok(operation_id) => SubmitResponse::Accepted { operation_id },
                    Err(e) => {
                        tracing::warn!(error = %e, "operation request rejected");
                        SubmitResponse::Rejected { error: e.to_string() }
                    }
                };
                if let Some(reply_to) = msg.reply_to {
                    let payload = serde_json::to_vec(&response)?;
                    if let Err(e) = bus.publish(BusMessage::new(reply_to, payload)).await {
                        tracing::warn!(error = %e, "failed to answer submission");
                    }
                }
            }
        }
    }

    engine.shutdown();
    if let Some(task) = liveness_task {
        task.abort();
    }
    hub_task.abort();
    Ok(())
}

/// Plan and start an Operation for a raw request. Returns its id.
fn intake(engine: &Arc<Engine>, store: &dyn Store, payload: &[u8]) -> Result<String> {
    let request: OperationRequest =
        serde_json::from_slice(payload).context("malformed operation request")?;
    let steps = plan(&request)?;
    store
        .save_cluster(&request.cluster)
        .map_err(|e| EngineError::Store(e.to_string()))?;

    let op = Operation::new(
        request.name,
        request.operation_type,
        request.cluster.id.clone(),
        request.parameters,
    );
    let id = op.id.clone();
    engine.submit(op, request.cluster, steps)?;
    tracing::info!(operation_id = short(&id), "operation accepted");
    Ok(id)
}

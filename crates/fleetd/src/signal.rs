//! Signal port: the liveness detector only checks that a TCP connect succeeds.

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

pub async fn serve(port: u16, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind signal port {port}"))?;
    tracing::info!(port, "signal listener ready");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => drop(stream),
                Err(e) => tracing::warn!(error = %e, "signal accept failed"),
            },
            _ = shutdown.recv() => return Ok(()),
        }
    }
}

//! Operation submission over the bus.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use fleet_core::config::FleetConfig;
use fleet_core::envelope::subjects;
use fleet_core::OperationRequest;
use fleet_services::{bus, TcpBus};

/// Server answer to a submission.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum SubmitResponse {
    Accepted { operation_id: String },
    Rejected { error: String },
}

pub async fn run(config: &FleetConfig, path: &str) -> Result<()> {
    let raw = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
    let request: OperationRequest =
        serde_json::from_slice(&raw).with_context(|| format!("invalid request in {path}"))?;

    let conn = TcpBus::connect(&config.bus.server_addr)
        .await
        .with_context(|| format!("failed to reach server at {}", config.bus.server_addr))?;
    let reply = bus::request(
        &conn,
        subjects::SUBMIT,
        serde_json::to_vec(&request)?,
        Duration::from_secs(10),
    )
    .await
    .context("submission failed")?;

    match serde_json::from_slice::<SubmitResponse>(&reply.payload)? {
        SubmitResponse::Accepted { operation_id } => {
            println!("{operation_id}");
            Ok(())
        }
        SubmitResponse::Rejected { error } => bail!("server rejected request: {error}"),
    }
}

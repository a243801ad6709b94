//! Agent liveness: periodic TCP probes of every node's signal port.
//!
//! The detector only flips `agent_status`. It never removes nodes and never
//! touches Operations; Steps that set `skip_unreachable` consult the flag
//! before dispatching.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use fleet_core::config::LivenessConfig;
use fleet_core::{AgentStatus, Node};

use crate::store::Store;

#[async_trait]
pub trait Prober: Send + Sync {
    /// `true` when something answers at `addr` within `timeout`.
    async fn probe(&self, addr: &str, timeout: Duration) -> bool;
}

/// Plain TCP connect; the connection is dropped at once.
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, addr: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Counts from one pass over the node list.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub marked_unreachable: usize,
    pub recovered: usize,
}

pub struct LivenessDetector {
    store: Arc<dyn Store>,
    prober: Arc<dyn Prober>,
    config: LivenessConfig,
}

impl LivenessDetector {
    pub fn new(store: Arc<dyn Store>, prober: Arc<dyn Prober>, config: LivenessConfig) -> Self {
        Self {
            store,
            prober,
            config,
        }
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.config.interval_secs,
            signal_port = self.config.signal_port,
            "liveness detector started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    if report.marked_unreachable > 0 || report.recovered > 0 {
                        tracing::info!(
                            probed = report.probed,
                            unreachable = report.marked_unreachable,
                            recovered = report.recovered,
                            "liveness sweep"
                        );
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("liveness detector stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Probe every stored node concurrently and record status changes.
    pub async fn sweep(&self) -> SweepReport {
        let nodes = self.store.nodes();
        let timeout = self.config.probe_timeout();
        let probes = nodes.iter().map(|node| {
            let addr = format!("{}:{}", node.ip, self.config.signal_port);
            let prober = self.prober.clone();
            async move { prober.probe(&addr, timeout).await }
        });
        let answers = futures::future::join_all(probes).await;

        let mut report = SweepReport {
            probed: nodes.len(),
            ..SweepReport::default()
        };
        for (node, alive) in nodes.iter().zip(answers) {
            match self.transition(node, alive) {
                Some(AgentStatus::Unreachable) => report.marked_unreachable += 1,
                Some(AgentStatus::Running) => report.recovered += 1,
                _ => {}
            }
        }
        report
    }

    fn transition(&self, node: &Node, alive: bool) -> Option<AgentStatus> {
        let next = match (alive, node.agent_status) {
            (false, AgentStatus::Unreachable) | (true, AgentStatus::Running) => return None,
            (false, _) => AgentStatus::Unreachable,
            (true, _) => AgentStatus::Running,
        };
        if let Err(e) = self.store.update_agent_status(&node.id, next) {
            tracing::warn!(node_id = %node.id, error = %e, "failed to record agent status");
            return None;
        }
        if next == AgentStatus::Unreachable {
            tracing::warn!(node_id = %node.id, ip = %node.ip, "agent unreachable");
        } else {
            tracing::info!(node_id = %node.id, "agent reachable");
        }
        Some(next)
    }
}

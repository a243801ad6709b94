//! Runtime configuration cache.
//!
//! Agents look up their settings by their own node id; the orchestrator
//! keeps a single server-side record. Populated once at startup from
//! `FleetConfig` and read on every task.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;

use fleet_core::config::FleetConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRuntimeConfig {
    pub node_id: String,
    pub group: String,
    pub work_dir: PathBuf,
    pub command_timeout: Option<Duration>,
    pub kubeadm_attempts: u32,
    pub kubeadm_backoff: Duration,
}

impl ClientRuntimeConfig {
    pub fn from_config(config: &FleetConfig, node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            group: config.node.group.clone(),
            work_dir: config.agent.work_dir.clone(),
            command_timeout: config.agent.command_timeout(),
            kubeadm_attempts: config.kubeadm.retry_attempts,
            kubeadm_backoff: config.kubeadm.backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRuntimeConfig {
    pub host: String,
    pub resource_server_url: String,
    pub node_step_timeout: Duration,
    pub max_parallel_node_steps: usize,
}

impl ServerRuntimeConfig {
    pub fn from_config(config: &FleetConfig, host: &str) -> Self {
        Self {
            host: host.to_string(),
            resource_server_url: config.server.resource_server_url.clone(),
            node_step_timeout: config.server.node_step_timeout(),
            max_parallel_node_steps: config.server.max_parallel_node_steps as usize,
        }
    }
}

#[derive(Clone, Default)]
pub struct RuntimeCache {
    clients: Arc<DashMap<String, ClientRuntimeConfig>>,
    server: Arc<RwLock<Option<ServerRuntimeConfig>>>,
}

impl RuntimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_client_runtime_config(&self, config: ClientRuntimeConfig) {
        self.clients.insert(config.node_id.clone(), config);
    }

    pub fn client_runtime_config(&self, node_id: &str) -> Option<ClientRuntimeConfig> {
        self.clients.get(node_id).map(|c| c.value().clone())
    }

    pub fn set_server_runtime_config(&self, config: ServerRuntimeConfig) {
        let mut slot = self.server.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(config);
    }

    pub fn server_runtime_config(&self) -> Option<ServerRuntimeConfig> {
        self.server
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_is_keyed_by_node_id() {
        let cache = RuntimeCache::new();
        let mut config = FleetConfig::default();
        config.agent.command_timeout_secs = 90;
        cache.set_client_runtime_config(ClientRuntimeConfig::from_config(&config, "n1"));

        let got = cache.client_runtime_config("n1").unwrap();
        assert_eq!(got.command_timeout, Some(Duration::from_secs(90)));
        assert_eq!(got.kubeadm_attempts, 5);
        assert!(cache.client_runtime_config("n2").is_none());
    }

    #[test]
    fn server_config_round_trips() {
        let cache = RuntimeCache::new();
        assert!(cache.server_runtime_config().is_none());
        cache.set_server_runtime_config(ServerRuntimeConfig::from_config(
            &FleetConfig::default(),
            "engine-a",
        ));
        let got = cache.server_runtime_config().unwrap();
        assert_eq!(got.host, "engine-a");
        assert_eq!(got.node_step_timeout, Duration::from_secs(600));
    }
}

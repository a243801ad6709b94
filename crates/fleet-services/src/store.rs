//! Persistence for operations, clusters and node liveness.
//!
//! The engine and the liveness detector only write through [`Store`]. The
//! bundled [`MemoryStore`] keeps everything in `DashMap`s and, when given a
//! path, mirrors a JSON snapshot to disk on every mutation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use fleet_core::model::new_id;
use fleet_core::{AgentStatus, Cluster, Node, Operation};

pub trait Store: Send + Sync {
    fn save_operation(&self, op: &Operation) -> Result<()>;
    fn operation(&self, id: &str) -> Option<Operation>;

    /// Save a cluster record. Known nodes keep their agent status.
    fn save_cluster(&self, cluster: &Cluster) -> Result<()>;
    fn cluster(&self, id: &str) -> Option<Cluster>;

    /// Every node the orchestrator manages.
    fn nodes(&self) -> Vec<Node>;
    fn node(&self, id: &str) -> Option<Node>;

    /// Persist only the agent-status field of one node.
    fn update_agent_status(&self, node_id: &str, status: AgentStatus) -> Result<()>;
}

#[derive(Default, Serialize, Deserialize)]
struct Snapshot {
    operations: BTreeMap<String, Operation>,
    clusters: BTreeMap<String, Cluster>,
    nodes: BTreeMap<String, Node>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    operations: Arc<DashMap<String, Operation>>,
    clusters: Arc<DashMap<String, Cluster>>,
    nodes: Arc<DashMap<String, Node>>,
    persist_path: Arc<Option<PathBuf>>,
    /// Serializes snapshot writers so the file always holds the newest state.
    write_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that mirrors its contents to `path`, loading it first if present.
    pub fn with_persistence(path: PathBuf) -> Self {
        let store = Self {
            persist_path: Arc::new(Some(path)),
            ..Self::default()
        };
        store.load_from_disk();
        store
    }

    fn save_to_disk(&self) -> Result<()> {
        let Some(path) = self.persist_path.as_ref() else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = Snapshot {
            operations: self
                .operations
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            clusters: self
                .clusters
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            nodes: self
                .nodes
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension(format!("json.{}.tmp", new_id()));
        std::fs::write(&tmp, json)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn load_from_disk(&self) {
        let Some(path) = self.persist_path.as_ref() else {
            return;
        };
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to read state snapshot");
                return;
            }
        };
        let snapshot: Snapshot = match serde_json::from_str(&text) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to parse state snapshot");
                return;
            }
        };
        let count = snapshot.operations.len();
        for (k, v) in snapshot.operations {
            self.operations.insert(k, v);
        }
        for (k, v) in snapshot.clusters {
            self.clusters.insert(k, v);
        }
        for (k, v) in snapshot.nodes {
            self.nodes.insert(k, v);
        }
        tracing::info!(operations = count, path = %path.display(), "loaded state snapshot");
    }
}

impl Store for MemoryStore {
    fn save_operation(&self, op: &Operation) -> Result<()> {
        self.operations.insert(op.id.clone(), op.clone());
        self.save_to_disk()
    }

    fn operation(&self, id: &str) -> Option<Operation> {
        self.operations.get(id).map(|o| o.value().clone())
    }

    fn save_cluster(&self, cluster: &Cluster) -> Result<()> {
        let mut cluster = cluster.clone();
        for node in &mut cluster.nodes {
            if let Some(known) = self.nodes.get(&node.id) {
                node.agent_status = known.agent_status;
            }
            self.nodes.insert(node.id.clone(), node.clone());
        }
        self.clusters.insert(cluster.id.clone(), cluster);
        self.save_to_disk()
    }

    fn cluster(&self, id: &str) -> Option<Cluster> {
        self.clusters.get(id).map(|c| c.value().clone())
    }

    fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|n| n.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn node(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|n| n.value().clone())
    }

    fn update_agent_status(&self, node_id: &str, status: AgentStatus) -> Result<()> {
        match self.nodes.get_mut(node_id) {
            Some(mut node) => node.agent_status = status,
            None => anyhow::bail!("unknown node {node_id}"),
        }
        for mut cluster in self.clusters.iter_mut() {
            if let Some(node) = cluster.nodes.iter_mut().find(|n| n.id == node_id) {
                node.agent_status = status;
            }
        }
        self.save_to_disk()
    }
}

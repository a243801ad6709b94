//! Cluster, node and operation records.
//!
//! Status strings are an external contract consumed by the REST layer and
//! must not change once published.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Flat key/value data returned by a task and threaded into later envelopes.
pub type ReturnData = BTreeMap<String, String>;

/// Well-known return-data keys. Producers namespace their keys so that merging
/// replies from many nodes never clobbers unrelated values.
pub mod return_keys {
    pub const JOIN_CONTROL_PLANE_CMD: &str = "joinControlPlaneCMD";
    pub const JOIN_WORKER_CMD: &str = "joinWorkerCMD";
    pub const CRI_SKIPPED: &str = "cri.skipped";
    pub const CRI_RUNTIME: &str = "cri.runtime";
    pub const HOSTNAME: &str = "node.hostname";
    pub const CURL_STATUS: &str = "curl.status";
    pub const CLUSTER_CONFIG_PATH: &str = "cluster_config.path";
    pub const KUBEADM_ATTEMPTS: &str = "kubeadm.attempts";

    pub fn command_stdout(index: usize) -> String {
        format!("command.{index}.stdout")
    }

    pub fn command_error(index: usize) -> String {
        format!("command.{index}.error")
    }
}

/// Generate a random 128-bit identifier, hex-encoded.
pub fn new_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Unix timestamp in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shorten an id to its first 12 characters for log fields.
pub fn short(id: &str) -> &str {
    match id.char_indices().nth(12) {
        Some((end, _)) => &id[..end],
        None => id,
    }
}

// ── Cluster ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Master,
    Worker,
}

/// Agent reachability as seen by the liveness detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Unknown,
    Running,
    Unreachable,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Unknown => "unknown",
            AgentStatus::Running => "running",
            AgentStatus::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub role: NodeRole,
    /// Membership status owned by operations (`pending`, `running`, `deleting`, ...).
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub agent_status: AgentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSpec {
    /// Container runtime kind, e.g. `containerd`.
    pub cri: String,
    pub cri_version: String,
    /// Control-plane endpoint. Empty means the first master's address.
    pub api_vip: String,
    pub api_port: u16,
    /// Port of the node-local load balancer fronting the API servers.
    pub lb_port: u16,
    pub lb_enabled: bool,
    pub pod_cidr: String,
    pub service_cidr: String,
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            cri: "containerd".to_string(),
            cri_version: String::new(),
            api_vip: String::new(),
            api_port: 6443,
            lb_port: 8443,
            lb_enabled: true,
            pod_cidr: "10.244.0.0/16".to_string(),
            service_cidr: "10.96.0.0/12".to_string(),
        }
    }
}

/// Value snapshot of a cluster. Agents never see later server-side changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub spec: ClusterSpec,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn masters(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Master)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.role == NodeRole::Worker)
    }

    /// Address the control plane is reached through.
    pub fn api_endpoint(&self) -> String {
        let host = if self.spec.api_vip.is_empty() {
            self.masters().next().map(|n| n.ip.clone()).unwrap_or_default()
        } else {
            self.spec.api_vip.clone()
        };
        format!("{}:{}", host, self.spec.api_port)
    }
}

// ── Operations ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    CreateCluster,
    AddWorkers,
    RemoveNodes,
    DestroyCluster,
    DeployAddons,
    Upgrade,
}

impl OperationType {
    /// Status reported while an operation of this type is running.
    pub fn running_status(&self) -> OperationStatus {
        match self {
            OperationType::CreateCluster | OperationType::DestroyCluster => {
                OperationStatus::Processing
            }
            OperationType::AddWorkers => OperationStatus::AddingNodes,
            OperationType::RemoveNodes => OperationStatus::DeletingNodes,
            OperationType::DeployAddons => OperationStatus::DeployAddons,
            OperationType::Upgrade => OperationStatus::Upgrading,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
    #[default]
    Pending,
    Processing,
    AddingNodes,
    DeletingNodes,
    DeployAddons,
    Upgrading,
    Successful,
    Error,
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Successful | OperationStatus::Error)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Successful,
    Error,
    Skipped,
}

/// How a NodeStep ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Succeeded,
    Failed(String),
    TimedOut,
    Unreachable,
}

/// Persisted view of a Step and the classification of its nodes.
///
/// The four node sets are kept pairwise disjoint by `classify`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub status: StepStatus,
    pub on_success_nodes: BTreeSet<String>,
    pub on_failed_nodes: BTreeMap<String, String>,
    pub on_timeout_nodes: BTreeSet<String>,
    pub unreachable_nodes: BTreeSet<String>,
    /// Dispatch rounds, including retries.
    pub attempts: u32,
}

impl StepState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Record the disposition of one node, replacing any earlier one.
    pub fn classify(&mut self, node_id: &str, disposition: Disposition) {
        self.forget(node_id);
        let id = node_id.to_string();
        match disposition {
            Disposition::Succeeded => {
                self.on_success_nodes.insert(id);
            }
            Disposition::Failed(msg) => {
                self.on_failed_nodes.insert(id, msg);
            }
            Disposition::TimedOut => {
                self.on_timeout_nodes.insert(id);
            }
            Disposition::Unreachable => {
                self.unreachable_nodes.insert(id);
            }
        }
    }

    fn forget(&mut self, node_id: &str) {
        self.on_success_nodes.remove(node_id);
        self.on_failed_nodes.remove(node_id);
        self.on_timeout_nodes.remove(node_id);
        self.unreachable_nodes.remove(node_id);
    }

    /// Number of nodes with any disposition.
    pub fn settled(&self) -> usize {
        self.on_success_nodes.len()
            + self.on_failed_nodes.len()
            + self.on_timeout_nodes.len()
            + self.unreachable_nodes.len()
    }

    /// Nodes that did not succeed.
    pub fn unsuccessful(&self) -> usize {
        self.settled() - self.on_success_nodes.len()
    }

    /// Nodes eligible for a retry round: failed and timed out.
    pub fn retryable_nodes(&self) -> BTreeSet<String> {
        self.on_failed_nodes
            .keys()
            .chain(self.on_timeout_nodes.iter())
            .cloned()
            .collect()
    }

    pub fn disposition(&self, node_id: &str) -> Option<Disposition> {
        if self.on_success_nodes.contains(node_id) {
            Some(Disposition::Succeeded)
        } else if let Some(msg) = self.on_failed_nodes.get(node_id) {
            Some(Disposition::Failed(msg.clone()))
        } else if self.on_timeout_nodes.contains(node_id) {
            Some(Disposition::TimedOut)
        } else if self.unreachable_nodes.contains(node_id) {
            Some(Disposition::Unreachable)
        } else {
            None
        }
    }
}

/// One cluster lifecycle request and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub name: String,
    pub status: OperationStatus,
    /// Index of the step being run. Never decreases.
    pub current_step: usize,
    pub cluster_id: String,
    pub operation_type: OperationType,
    pub steps: Vec<StepState>,
    pub pre_step_return_data: ReturnData,
    pub request_parameter: BTreeMap<String, String>,
    /// Engine instance driving this operation.
    pub host: String,
    pub message: String,
    /// Per-node error messages collected from failed steps.
    pub issues: BTreeMap<String, String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Operation {
    pub fn new(
        name: impl Into<String>,
        operation_type: OperationType,
        cluster_id: impl Into<String>,
        request_parameter: BTreeMap<String, String>,
    ) -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            name: name.into(),
            status: OperationStatus::Pending,
            current_step: 0,
            cluster_id: cluster_id.into(),
            operation_type,
            steps: Vec::new(),
            pre_step_return_data: ReturnData::new(),
            request_parameter,
            host: String::new(),
            message: String::new(),
            issues: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `step`. Going backwards is ignored.
    pub fn advance_to(&mut self, step: usize) {
        if step > self.current_step {
            self.current_step = step;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

/// Caller request that creates an Operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub name: String,
    pub operation_type: OperationType,
    pub cluster: Cluster,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_cuts_on_char_boundaries() {
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
        assert_eq!(short("abc"), "abc");
        assert_eq!(short("nœud-é-ü-ßßßßß"), "nœud-é-ü-ßßß");
    }

    #[test]
    fn classify_keeps_sets_disjoint() {
        let mut state = StepState::new("join");
        state.classify("a", Disposition::TimedOut);
        state.classify("a", Disposition::Succeeded);
        state.classify("b", Disposition::Failed("boom".into()));
        state.classify("c", Disposition::Unreachable);

        assert_eq!(state.settled(), 3);
        assert!(state.on_timeout_nodes.is_empty());
        assert_eq!(state.disposition("a"), Some(Disposition::Succeeded));
        assert_eq!(state.unsuccessful(), 2);
        assert_eq!(
            state.retryable_nodes().into_iter().collect::<Vec<_>>(),
            vec!["b".to_string()]
        );
    }

    #[test]
    fn current_step_never_decreases() {
        let mut op = Operation::new("op", OperationType::CreateCluster, "c1", BTreeMap::new());
        op.advance_to(2);
        op.advance_to(1);
        assert_eq!(op.current_step, 2);
    }

    #[test]
    fn status_strings_are_stable() {
        let s = serde_json::to_string(&OperationStatus::AddingNodes).unwrap();
        assert_eq!(s, "\"adding-nodes\"");
        let s = serde_json::to_string(&OperationStatus::DeployAddons).unwrap();
        assert_eq!(s, "\"deploy-addons\"");
        let s = serde_json::to_string(&AgentStatus::Unreachable).unwrap();
        assert_eq!(s, "\"unreachable\"");
    }

    #[test]
    fn api_endpoint_prefers_vip() {
        let mut cluster = Cluster {
            id: "c".into(),
            name: "c".into(),
            version: "v1.30.2".into(),
            spec: ClusterSpec::default(),
            nodes: vec![Node {
                id: "m1".into(),
                name: "m1".into(),
                ip: "10.0.0.1".into(),
                role: NodeRole::Master,
                status: String::new(),
                agent_status: AgentStatus::Unknown,
            }],
        };
        assert_eq!(cluster.api_endpoint(), "10.0.0.1:6443");
        cluster.spec.api_vip = "10.0.0.100".into();
        assert_eq!(cluster.api_endpoint(), "10.0.0.100:6443");
    }
}

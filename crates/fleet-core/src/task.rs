//! Task variants and the task-type registry.
//!
//! A task travels as `(task_type, bytes)`. The registry below is the single
//! table that maps a task-type string to its decoder and execution
//! discipline; nothing else in the system switches on task-type strings.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::model::NodeRole;

/// `timeout_seconds` value meaning "no timeout".
pub const NO_TIMEOUT: u32 = 0;

/// Coarse verb many providers branch on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Create,
    Delete,
}

/// Fields every task variant carries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMeta {
    #[serde(default)]
    pub action: Action,
    /// Seconds, or [`NO_TIMEOUT`].
    #[serde(default)]
    pub timeout_seconds: u32,
}

impl TaskMeta {
    pub fn create() -> Self {
        Self::default()
    }

    pub fn delete() -> Self {
        Self {
            action: Action::Delete,
            timeout_seconds: NO_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, secs: u32) -> Self {
        self.timeout_seconds = secs;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_seconds {
            NO_TIMEOUT => None,
            secs => Some(Duration::from_secs(secs as u64)),
        }
    }
}

// ── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    #[serde(default)]
    pub kernel_modules: Vec<String>,
    #[serde(default)]
    pub sysctl: BTreeMap<String, String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenameTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub hostname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriKind {
    Containerd,
    Docker,
    Crio,
}

impl CriKind {
    /// systemd unit backing this runtime.
    pub fn service(&self) -> &'static str {
        match self {
            CriKind::Containerd => "containerd",
            CriKind::Docker => "docker",
            CriKind::Crio => "crio",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "containerd" => Some(CriKind::Containerd),
            "docker" => Some(CriKind::Docker),
            "crio" | "cri-o" => Some(CriKind::Crio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRuntime {
    pub kind: CriKind,
    #[serde(default)]
    pub version: String,
    /// Remove a running runtime before installing.
    #[serde(default)]
    pub reinstall: bool,
    #[serde(default)]
    pub data_root: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub runtime: ContainerRuntime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    /// Rendered load-balancer configuration.
    #[serde(with = "crate::hex_bytes", default)]
    pub config: Vec<u8>,
    #[serde(default)]
    pub vip: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeadmInitTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    /// kubeadm configuration document.
    #[serde(with = "crate::hex_bytes")]
    pub config: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinControlPlaneTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub join_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinWorkerTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub join_command: String,
    /// API endpoint the worker should join through, e.g. `127.0.0.1:8443`.
    pub local_endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeadmDestroyTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub role: NodeRole,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommandTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    /// Shell commands, run in list order.
    pub commands: Vec<String>,
    /// Record failures and keep going instead of aborting.
    #[serde(default)]
    pub ignore_errors: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFilesTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    /// Absolute path → file content.
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub mode: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDepsTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub packages: Vec<String>,
    #[serde(default)]
    pub target_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualKubeletTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub provider: String,
    pub image: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrintJoinTokenTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    #[serde(default)]
    pub ttl: Option<String>,
    /// Endpoint substituted into the printed worker join command.
    #[serde(default)]
    pub local_endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symlink {
    pub link: String,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinksTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub links: Vec<Symlink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurlTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub url: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
}

fn default_expect_status() -> u16 {
    200
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfigTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub cluster_name: String,
    pub kubernetes_version: String,
    pub api_endpoint: String,
    pub pod_cidr: String,
    pub service_cidr: String,
    pub output_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogShipperTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    #[serde(with = "crate::hex_bytes")]
    pub config: Vec<u8>,
    pub destination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreloadImagesTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEntry {
    pub ip: String,
    pub names: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostsTask {
    #[serde(flatten)]
    pub meta: TaskMeta,
    pub entries: Vec<HostEntry>,
}

// ── Task ─────────────────────────────────────────────────────────────────────

/// Every task the orchestrator can send to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Bootstrap(BootstrapTask),
    Rename(RenameTask),
    Cri(CriTask),
    LoadBalancer(LoadBalancerTask),
    KubeadmInit(KubeadmInitTask),
    JoinControlPlane(JoinControlPlaneTask),
    JoinWorker(JoinWorkerTask),
    KubeadmDestroy(KubeadmDestroyTask),
    RunCommand(RunCommandTask),
    AsyncRunCommand(RunCommandTask),
    WriteFiles(WriteFilesTask),
    DownloadDeps(DownloadDepsTask),
    AsyncDownloadDeps(DownloadDepsTask),
    VirtualKubelet(VirtualKubeletTask),
    PrintJoinToken(PrintJoinTokenTask),
    Symlinks(SymlinksTask),
    Curl(CurlTask),
    ClusterConfig(ClusterConfigTask),
    LogShipper(LogShipperTask),
    PreloadImages(PreloadImagesTask),
    Hosts(HostsTask),
}

/// How the agent runs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Reply when the provider call returns.
    Sync,
    /// Return at once; a background task sends the reply later.
    Detached,
}

/// One registry row.
pub struct Registration {
    pub task_type: &'static str,
    pub execution: Execution,
    decode: fn(&[u8]) -> Result<Task, serde_json::Error>,
}

fn decode_as<T: DeserializeOwned>(
    bytes: &[u8],
    wrap: fn(T) -> Task,
) -> Result<Task, serde_json::Error> {
    serde_json::from_slice(bytes).map(wrap)
}

/// Task-type registry. Tags are wire constants.
pub static REGISTRY: &[Registration] = &[
    Registration {
        task_type: "bootstrap",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::Bootstrap),
    },
    Registration {
        task_type: "rename",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::Rename),
    },
    Registration {
        task_type: "cri",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::Cri),
    },
    Registration {
        task_type: "load_balancer",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::LoadBalancer),
    },
    Registration {
        task_type: "kubeadm_init",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::KubeadmInit),
    },
    Registration {
        task_type: "join_control_plane",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::JoinControlPlane),
    },
    Registration {
        task_type: "join_worker",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::JoinWorker),
    },
    Registration {
        task_type: "kubeadm_destroy",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::KubeadmDestroy),
    },
    Registration {
        task_type: "run_command",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::RunCommand),
    },
    Registration {
        task_type: "async_run_command",
        execution: Execution::Detached,
        decode: |b| decode_as(b, Task::AsyncRunCommand),
    },
    Registration {
        task_type: "write_files",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::WriteFiles),
    },
    Registration {
        task_type: "download_deps",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::DownloadDeps),
    },
    Registration {
        task_type: "async_download_deps",
        execution: Execution::Detached,
        decode: |b| decode_as(b, Task::AsyncDownloadDeps),
    },
    Registration {
        task_type: "virtual_kubelet",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::VirtualKubelet),
    },
    Registration {
        task_type: "print_join_token",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::PrintJoinToken),
    },
    Registration {
        task_type: "symlinks",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::Symlinks),
    },
    Registration {
        task_type: "curl",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::Curl),
    },
    Registration {
        task_type: "cluster_config",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::ClusterConfig),
    },
    Registration {
        task_type: "log_shipper",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::LogShipper),
    },
    Registration {
        task_type: "preload_images",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::PreloadImages),
    },
    Registration {
        task_type: "hosts",
        execution: Execution::Sync,
        decode: |b| decode_as(b, Task::Hosts),
    },
];

/// Look up a registry row by tag.
pub fn registration(task_type: &str) -> Result<&'static Registration, TaskError> {
    REGISTRY
        .iter()
        .find(|r| r.task_type == task_type)
        .ok_or_else(|| TaskError::UnknownTaskType(task_type.to_string()))
}

/// Decode a task payload using the tag it was sent with.
pub fn decode(task_type: &str, bytes: &[u8]) -> Result<Task, TaskError> {
    let reg = registration(task_type)?;
    (reg.decode)(bytes).map_err(|source| TaskError::Malformed {
        task_type: task_type.to_string(),
        source,
    })
}

impl Task {
    /// Wire tag for this variant.
    pub fn task_type(&self) -> &'static str {
        match self {
            Task::Bootstrap(_) => "bootstrap",
            Task::Rename(_) => "rename",
            Task::Cri(_) => "cri",
            Task::LoadBalancer(_) => "load_balancer",
            Task::KubeadmInit(_) => "kubeadm_init",
            Task::JoinControlPlane(_) => "join_control_plane",
            Task::JoinWorker(_) => "join_worker",
            Task::KubeadmDestroy(_) => "kubeadm_destroy",
            Task::RunCommand(_) => "run_command",
            Task::AsyncRunCommand(_) => "async_run_command",
            Task::WriteFiles(_) => "write_files",
            Task::DownloadDeps(_) => "download_deps",
            Task::AsyncDownloadDeps(_) => "async_download_deps",
            Task::VirtualKubelet(_) => "virtual_kubelet",
            Task::PrintJoinToken(_) => "print_join_token",
            Task::Symlinks(_) => "symlinks",
            Task::Curl(_) => "curl",
            Task::ClusterConfig(_) => "cluster_config",
            Task::LogShipper(_) => "log_shipper",
            Task::PreloadImages(_) => "preload_images",
            Task::Hosts(_) => "hosts",
        }
    }

    pub fn meta(&self) -> &TaskMeta {
        match self {
            Task::Bootstrap(t) => &t.meta,
            Task::Rename(t) => &t.meta,
            Task::Cri(t) => &t.meta,
            Task::LoadBalancer(t) => &t.meta,
            Task::KubeadmInit(t) => &t.meta,
            Task::JoinControlPlane(t) => &t.meta,
            Task::JoinWorker(t) => &t.meta,
            Task::KubeadmDestroy(t) => &t.meta,
            Task::RunCommand(t) | Task::AsyncRunCommand(t) => &t.meta,
            Task::WriteFiles(t) => &t.meta,
            Task::DownloadDeps(t) | Task::AsyncDownloadDeps(t) => &t.meta,
            Task::VirtualKubelet(t) => &t.meta,
            Task::PrintJoinToken(t) => &t.meta,
            Task::Symlinks(t) => &t.meta,
            Task::Curl(t) => &t.meta,
            Task::ClusterConfig(t) => &t.meta,
            Task::LogShipper(t) => &t.meta,
            Task::PreloadImages(t) => &t.meta,
            Task::Hosts(t) => &t.meta,
        }
    }

    /// Execution discipline from the registry.
    pub fn execution(&self) -> Execution {
        registration(self.task_type())
            .map(|r| r.execution)
            .unwrap_or(Execution::Sync)
    }

    /// Serialize the variant payload (without the tag).
    pub fn encode(&self) -> Result<Vec<u8>, TaskError> {
        let bytes = match self {
            Task::Bootstrap(t) => serde_json::to_vec(t),
            Task::Rename(t) => serde_json::to_vec(t),
            Task::Cri(t) => serde_json::to_vec(t),
            Task::LoadBalancer(t) => serde_json::to_vec(t),
            Task::KubeadmInit(t) => serde_json::to_vec(t),
            Task::JoinControlPlane(t) => serde_json::to_vec(t),
            Task::JoinWorker(t) => serde_json::to_vec(t),
            Task::KubeadmDestroy(t) => serde_json::to_vec(t),
            Task::RunCommand(t) | Task::AsyncRunCommand(t) => serde_json::to_vec(t),
            Task::WriteFiles(t) => serde_json::to_vec(t),
            Task::DownloadDeps(t) | Task::AsyncDownloadDeps(t) => serde_json::to_vec(t),
            Task::VirtualKubelet(t) => serde_json::to_vec(t),
            Task::PrintJoinToken(t) => serde_json::to_vec(t),
            Task::Symlinks(t) => serde_json::to_vec(t),
            Task::Curl(t) => serde_json::to_vec(t),
            Task::ClusterConfig(t) => serde_json::to_vec(t),
            Task::LogShipper(t) => serde_json::to_vec(t),
            Task::PreloadImages(t) => serde_json::to_vec(t),
            Task::Hosts(t) => serde_json::to_vec(t),
        };
        bytes.map_err(TaskError::Encode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tasks() -> Vec<Task> {
        vec![
            Task::Bootstrap(BootstrapTask {
                meta: TaskMeta::create().with_timeout(300),
                kernel_modules: vec!["br_netfilter".into(), "overlay".into()],
                sysctl: BTreeMap::from([("net.ipv4.ip_forward".into(), "1".into())]),
                packages: vec!["socat".into()],
            }),
            Task::Rename(RenameTask {
                meta: TaskMeta::create(),
                hostname: "master-1".into(),
            }),
            Task::Cri(CriTask {
                meta: TaskMeta::delete(),
                runtime: ContainerRuntime {
                    kind: CriKind::Containerd,
                    version: "1.7.13".into(),
                    reinstall: true,
                    data_root: Some("/data/containerd".into()),
                },
            }),
            Task::LoadBalancer(LoadBalancerTask {
                meta: TaskMeta::create(),
                config: b"frontend api\n  bind *:8443\n".to_vec(),
                vip: "10.0.0.100".into(),
                port: 8443,
            }),
            Task::KubeadmInit(KubeadmInitTask {
                meta: TaskMeta::create().with_timeout(900),
                config: b"apiVersion: kubeadm.k8s.io/v1beta3\n".to_vec(),
            }),
            Task::JoinControlPlane(JoinControlPlaneTask {
                meta: TaskMeta::create(),
                join_command: "kubeadm join 10.0.0.1:6443 --control-plane".into(),
            }),
            Task::JoinWorker(JoinWorkerTask {
                meta: TaskMeta::create(),
                join_command: "kubeadm join 10.0.0.1:6443 --token t".into(),
                local_endpoint: "127.0.0.1:8443".into(),
            }),
            Task::KubeadmDestroy(KubeadmDestroyTask {
                meta: TaskMeta::delete(),
                role: NodeRole::Worker,
            }),
            Task::RunCommand(RunCommandTask {
                meta: TaskMeta::create(),
                commands: vec!["echo 1".into(), "echo 2".into()],
                ignore_errors: true,
            }),
            Task::AsyncRunCommand(RunCommandTask {
                meta: TaskMeta::create().with_timeout(3600),
                commands: vec!["sleep 1".into()],
                ignore_errors: false,
            }),
            Task::WriteFiles(WriteFilesTask {
                meta: TaskMeta::create(),
                files: BTreeMap::from([("/etc/fleet/a".into(), "x".into())]),
                mode: Some(0o644),
            }),
            Task::DownloadDeps(DownloadDepsTask {
                meta: TaskMeta::create(),
                packages: vec!["kubelet-1.30.2".into()],
                target_dir: None,
            }),
            Task::AsyncDownloadDeps(DownloadDepsTask {
                meta: TaskMeta::create(),
                packages: vec!["kubeadm-1.30.2".into()],
                target_dir: Some("/opt/deps".into()),
            }),
            Task::VirtualKubelet(VirtualKubeletTask {
                meta: TaskMeta::create(),
                provider: "edge".into(),
                image: "vk:1".into(),
            }),
            Task::PrintJoinToken(PrintJoinTokenTask::default()),
            Task::Symlinks(SymlinksTask {
                meta: TaskMeta::create(),
                links: vec![Symlink {
                    link: "/usr/bin/kubectl".into(),
                    target: "/opt/bin/kubectl".into(),
                }],
            }),
            Task::Curl(CurlTask {
                meta: TaskMeta::create(),
                url: "https://127.0.0.1:6443/healthz".into(),
                expect_status: 200,
            }),
            Task::ClusterConfig(ClusterConfigTask {
                meta: TaskMeta::create(),
                cluster_name: "prod".into(),
                kubernetes_version: "v1.30.2".into(),
                api_endpoint: "10.0.0.100:6443".into(),
                pod_cidr: "10.244.0.0/16".into(),
                service_cidr: "10.96.0.0/12".into(),
                output_path: "/etc/fleet/kubeadm.yaml".into(),
            }),
            Task::LogShipper(LogShipperTask {
                meta: TaskMeta::create(),
                config: b"[OUTPUT]\n".to_vec(),
                destination: "/etc/fluent-bit/fluent-bit.conf".into(),
            }),
            Task::PreloadImages(PreloadImagesTask {
                meta: TaskMeta::create(),
                images: vec!["registry.k8s.io/pause:3.9".into()],
            }),
            Task::Hosts(HostsTask {
                meta: TaskMeta::create(),
                entries: vec![HostEntry {
                    ip: "10.0.0.1".into(),
                    names: vec!["master-1".into()],
                }],
            }),
        ]
    }

    #[test]
    fn every_variant_round_trips() {
        let tasks = sample_tasks();
        assert_eq!(tasks.len(), REGISTRY.len());
        for task in tasks {
            let bytes = task.encode().unwrap();
            let back = decode(task.task_type(), &bytes).unwrap();
            assert_eq!(back, task);
        }
    }

    #[test]
    fn registry_tags_are_unique() {
        let mut tags: Vec<_> = REGISTRY.iter().map(|r| r.task_type).collect();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), REGISTRY.len());
    }

    #[test]
    fn unknown_task_type_is_an_error() {
        let err = decode("format_disk", b"{}").unwrap_err();
        assert!(matches!(err, TaskError::UnknownTaskType(t) if t == "format_disk"));
    }

    #[test]
    fn malformed_payload_names_the_type() {
        let err = decode("rename", b"{\"nope\":1}").unwrap_err();
        assert!(err.to_string().contains("rename"));
    }

    #[test]
    fn detached_variants_come_from_the_registry() {
        let task = Task::AsyncRunCommand(RunCommandTask::default());
        assert_eq!(task.execution(), Execution::Detached);
        let task = Task::RunCommand(RunCommandTask::default());
        assert_eq!(task.execution(), Execution::Sync);
    }

    #[test]
    fn zero_timeout_means_none() {
        assert_eq!(TaskMeta::create().timeout(), None);
        assert_eq!(
            TaskMeta::create().with_timeout(5).timeout(),
            Some(Duration::from_secs(5))
        );
    }
}

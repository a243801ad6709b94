//! Capability providers: the host-side implementations of every task.
//!
//! One provider instance exists per agent process, chosen from the host's
//! `(vendor, major version)` at startup by [`platform::resolve`]. Every
//! operation has a default body returning `NotImplemented`, so experimental
//! platforms and test doubles only override what they support.

pub mod kubeadm;
pub mod linux;
pub mod platform;
pub mod route;
pub mod runner;

pub use linux::LinuxProvider;
pub use platform::{Platform, PackageManager};
pub use route::invoke;
pub use runner::{CommandOutput, CommandRunner, ShellRunner};

use std::sync::Arc;

use async_trait::async_trait;

use fleet_core::task::{
    BootstrapTask, ClusterConfigTask, CriTask, CurlTask, DownloadDepsTask, HostsTask,
    JoinControlPlaneTask, JoinWorkerTask, KubeadmDestroyTask, KubeadmInitTask, LoadBalancerTask,
    LogShipperTask, PreloadImagesTask, PrintJoinTokenTask, RenameTask, RunCommandTask,
    SymlinksTask, VirtualKubeletTask, WriteFilesTask,
};
use fleet_core::{Cluster, ProviderError, ReturnData};

use crate::runtime_cache::ClientRuntimeConfig;

pub type ProviderResult = Result<ReturnData, ProviderError>;

/// Everything a provider call may read besides its payload.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub node_id: String,
    pub cluster: Arc<Cluster>,
    pub resource_server_url: String,
    pub step_return_data: ReturnData,
    pub runtime: ClientRuntimeConfig,
}

impl TaskContext {
    /// The cluster-side name of this node, falling back to its id.
    pub fn node_name(&self) -> &str {
        self.cluster
            .node(&self.node_id)
            .map(|n| n.name.as_str())
            .unwrap_or(&self.node_id)
    }
}

macro_rules! not_implemented {
    ($self:ident, $op:literal) => {
        Err(ProviderError::NotImplemented {
            platform: $self.platform().to_string(),
            operation: $op,
        })
    };
}

#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    fn platform(&self) -> &Platform;

    async fn bootstrap_node(&self, _ctx: &TaskContext, _task: &BootstrapTask) -> ProviderResult {
        not_implemented!(self, "bootstrap_node")
    }

    async fn rename_node(&self, _ctx: &TaskContext, _task: &RenameTask) -> ProviderResult {
        not_implemented!(self, "rename_node")
    }

    async fn install_cri(&self, _ctx: &TaskContext, _task: &CriTask) -> ProviderResult {
        not_implemented!(self, "install_cri")
    }

    async fn remove_cri(&self, _ctx: &TaskContext, _task: &CriTask) -> ProviderResult {
        not_implemented!(self, "remove_cri")
    }

    async fn install_load_balancer(
        &self,
        _ctx: &TaskContext,
        _task: &LoadBalancerTask,
    ) -> ProviderResult {
        not_implemented!(self, "install_load_balancer")
    }

    async fn remove_load_balancer(
        &self,
        _ctx: &TaskContext,
        _task: &LoadBalancerTask,
    ) -> ProviderResult {
        not_implemented!(self, "remove_load_balancer")
    }

    async fn kubeadm_init(&self, _ctx: &TaskContext, _task: &KubeadmInitTask) -> ProviderResult {
        not_implemented!(self, "kubeadm_init")
    }

    async fn join_control_plane(
        &self,
        _ctx: &TaskContext,
        _task: &JoinControlPlaneTask,
    ) -> ProviderResult {
        not_implemented!(self, "join_control_plane")
    }

    async fn join_worker(&self, _ctx: &TaskContext, _task: &JoinWorkerTask) -> ProviderResult {
        not_implemented!(self, "join_worker")
    }

    async fn kubeadm_destroy(
        &self,
        _ctx: &TaskContext,
        _task: &KubeadmDestroyTask,
    ) -> ProviderResult {
        not_implemented!(self, "kubeadm_destroy")
    }

    async fn run_command(&self, _ctx: &TaskContext, _task: &RunCommandTask) -> ProviderResult {
        not_implemented!(self, "run_command")
    }

    async fn write_files(&self, _ctx: &TaskContext, _task: &WriteFilesTask) -> ProviderResult {
        not_implemented!(self, "write_files")
    }

    async fn download_deps(&self, _ctx: &TaskContext, _task: &DownloadDepsTask) -> ProviderResult {
        not_implemented!(self, "download_deps")
    }

    async fn install_virtual_kubelet(
        &self,
        _ctx: &TaskContext,
        _task: &VirtualKubeletTask,
    ) -> ProviderResult {
        not_implemented!(self, "install_virtual_kubelet")
    }

    async fn remove_virtual_kubelet(
        &self,
        _ctx: &TaskContext,
        _task: &VirtualKubeletTask,
    ) -> ProviderResult {
        not_implemented!(self, "remove_virtual_kubelet")
    }

    async fn print_join_token(
        &self,
        _ctx: &TaskContext,
        _task: &PrintJoinTokenTask,
    ) -> ProviderResult {
        not_implemented!(self, "print_join_token")
    }

    async fn create_symlinks(&self, _ctx: &TaskContext, _task: &SymlinksTask) -> ProviderResult {
        not_implemented!(self, "create_symlinks")
    }

    async fn curl_probe(&self, _ctx: &TaskContext, _task: &CurlTask) -> ProviderResult {
        not_implemented!(self, "curl_probe")
    }

    async fn generate_cluster_config(
        &self,
        _ctx: &TaskContext,
        _task: &ClusterConfigTask,
    ) -> ProviderResult {
        not_implemented!(self, "generate_cluster_config")
    }

    async fn configure_log_shipper(
        &self,
        _ctx: &TaskContext,
        _task: &LogShipperTask,
    ) -> ProviderResult {
        not_implemented!(self, "configure_log_shipper")
    }

    async fn preload_images(
        &self,
        _ctx: &TaskContext,
        _task: &PreloadImagesTask,
    ) -> ProviderResult {
        not_implemented!(self, "preload_images")
    }

    async fn edit_hosts(&self, _ctx: &TaskContext, _task: &HostsTask) -> ProviderResult {
        not_implemented!(self, "edit_hosts")
    }
}

/// Provider for platforms that are recognised but not yet supported.
pub struct UnimplementedProvider {
    platform: Platform,
}

impl UnimplementedProvider {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

#[async_trait]
impl CapabilityProvider for UnimplementedProvider {
    fn platform(&self) -> &Platform {
        &self.platform
    }
}

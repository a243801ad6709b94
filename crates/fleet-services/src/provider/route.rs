//! Task → provider operation routing.

use fleet_core::{Action, Task};

use super::{CapabilityProvider, ProviderResult, TaskContext};

/// Invoke the provider operation a task maps to. Variants with a create and a
/// delete operation pick one by `action`.
pub async fn invoke(
    provider: &dyn CapabilityProvider,
    ctx: &TaskContext,
    task: &Task,
) -> ProviderResult {
    let delete = task.meta().action == Action::Delete;
    match task {
        Task::Bootstrap(t) => provider.bootstrap_node(ctx, t).await,
        Task::Rename(t) => provider.rename_node(ctx, t).await,
        Task::Cri(t) if delete => provider.remove_cri(ctx, t).await,
        Task::Cri(t) => provider.install_cri(ctx, t).await,
        Task::LoadBalancer(t) if delete => provider.remove_load_balancer(ctx, t).await,
        Task::LoadBalancer(t) => provider.install_load_balancer(ctx, t).await,
        Task::KubeadmInit(t) => provider.kubeadm_init(ctx, t).await,
        Task::JoinControlPlane(t) => provider.join_control_plane(ctx, t).await,
        Task::JoinWorker(t) => provider.join_worker(ctx, t).await,
        Task::KubeadmDestroy(t) => provider.kubeadm_destroy(ctx, t).await,
        Task::RunCommand(t) | Task::AsyncRunCommand(t) => provider.run_command(ctx, t).await,
        Task::WriteFiles(t) => provider.write_files(ctx, t).await,
        Task::DownloadDeps(t) | Task::AsyncDownloadDeps(t) => provider.download_deps(ctx, t).await,
        Task::VirtualKubelet(t) if delete => provider.remove_virtual_kubelet(ctx, t).await,
        Task::VirtualKubelet(t) => provider.install_virtual_kubelet(ctx, t).await,
        Task::PrintJoinToken(t) => provider.print_join_token(ctx, t).await,
        Task::Symlinks(t) => provider.create_symlinks(ctx, t).await,
        Task::Curl(t) => provider.curl_probe(ctx, t).await,
        Task::ClusterConfig(t) => provider.generate_cluster_config(ctx, t).await,
        Task::LogShipper(t) => provider.configure_log_shipper(ctx, t).await,
        Task::PreloadImages(t) => provider.preload_images(ctx, t).await,
        Task::Hosts(t) => provider.edit_hosts(ctx, t).await,
    }
}

//! Provider for the supported Linux distributions.
//!
//! Distributions differ only in their package manager and firewall service;
//! everything else is shell composition through the [`CommandRunner`] plus
//! a few direct file writes under `root`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fleet_core::model::return_keys;
use fleet_core::task::{
    BootstrapTask, ClusterConfigTask, ContainerRuntime, CriKind, CriTask, CurlTask,
    DownloadDepsTask, HostsTask, JoinControlPlaneTask, JoinWorkerTask, KubeadmDestroyTask,
    KubeadmInitTask, LoadBalancerTask, LogShipperTask, PreloadImagesTask, PrintJoinTokenTask,
    RenameTask, RunCommandTask, SymlinksTask, VirtualKubeletTask, WriteFilesTask,
};
use fleet_core::{NodeRole, ProviderError, ReturnData};

use super::kubeadm::{self, RetryPolicy};
use super::platform::{PackageManager, Platform, ProviderSettings};
use super::runner::{quote, run_checked, CommandOutput, CommandRunner};
use super::{CapabilityProvider, ProviderResult, TaskContext};

const HAPROXY_CFG: &str = "/etc/haproxy/haproxy.cfg";
const KUBEADM_INIT_CFG: &str = "/etc/fleet/kubeadm-init.yaml";
const VK_UNIT: &str = "/etc/systemd/system/virtual-kubelet.service";
const MODULES_CONF: &str = "/etc/modules-load.d/fleet.conf";
const SYSCTL_CONF: &str = "/etc/sysctl.d/99-fleet.conf";
const HOSTS: &str = "/etc/hosts";
const CONTAINERD_CFG: &str = "/etc/containerd/config.toml";
const HOSTS_BEGIN: &str = "# BEGIN fleet managed hosts";
const HOSTS_END: &str = "# END fleet managed hosts";

pub struct LinuxProvider {
    platform: Platform,
    packages: PackageManager,
    runner: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
    command_timeout: Option<Duration>,
    root: PathBuf,
}

impl LinuxProvider {
    pub fn new(
        platform: Platform,
        packages: PackageManager,
        runner: Arc<dyn CommandRunner>,
        settings: ProviderSettings,
    ) -> Self {
        Self {
            platform,
            packages,
            runner,
            retry: settings.retry,
            command_timeout: settings.command_timeout,
            root: settings.root,
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    async fn sh(&self, command: &str) -> Result<CommandOutput, ProviderError> {
        run_checked(self.runner.as_ref(), command, self.command_timeout).await
    }

    /// Run and only log a non-zero exit. For cleanup that must not block.
    async fn sh_lenient(&self, command: &str) {
        match self.runner.run(command, self.command_timeout).await {
            Ok(out) if !out.success() => {
                tracing::debug!(%command, code = out.code, "cleanup command exited non-zero")
            }
            Err(e) => tracing::warn!(%command, error = %e, "cleanup command failed"),
            Ok(_) => {}
        }
    }

    async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: Option<u32>,
    ) -> Result<(), ProviderError> {
        let target = self.host_path(path);
        let io_err = |source| ProviderError::Io {
            path: path.to_string(),
            source,
        };
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&target, contents).await.map_err(io_err)?;
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(io_err)?;
        }
        Ok(())
    }

    async fn remove_file(&self, path: &str) -> Result<(), ProviderError> {
        match tokio::fs::remove_file(self.host_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProviderError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    fn cri_package(&self, kind: CriKind) -> &'static str {
        match (kind, self.packages) {
            (CriKind::Containerd, PackageManager::Apt) => "containerd",
            (CriKind::Containerd, _) => "containerd.io",
            (CriKind::Docker, PackageManager::Apt) => "docker.io",
            (CriKind::Docker, _) => "docker-ce",
            (CriKind::Crio, _) => "cri-o",
        }
    }

    fn default_data_root(kind: CriKind) -> &'static str {
        match kind {
            CriKind::Containerd => "/var/lib/containerd",
            CriKind::Docker => "/var/lib/docker",
            CriKind::Crio => "/var/lib/containers",
        }
    }

    async fn uninstall_runtime(&self, runtime: &ContainerRuntime) -> Result<(), ProviderError> {
        let service = runtime.kind.service();
        tracing::info!(%service, "removing container runtime");
        self.sh_lenient(&format!("systemctl disable --now {service}"))
            .await;
        self.sh(&self
            .packages
            .remove(&[self.cri_package(runtime.kind).to_string()]))
            .await?;
        let data_root = runtime
            .data_root
            .as_deref()
            .unwrap_or(Self::default_data_root(runtime.kind));
        self.sh(&format!("rm -rf {}", quote(data_root))).await?;
        Ok(())
    }

    async fn configure_runtime(&self, runtime: &ContainerRuntime) -> Result<(), ProviderError> {
        match runtime.kind {
            CriKind::Containerd => {
                let defaults = self.sh("containerd config default").await?.stdout;
                let config = containerd_config(&defaults, runtime.data_root.as_deref());
                self.write_file(CONTAINERD_CFG, config.as_bytes(), None).await?;
            }
            CriKind::Docker => {
                let mut daemon = serde_json::json!({
                    "exec-opts": ["native.cgroupdriver=systemd"],
                });
                if let Some(root) = &runtime.data_root {
                    daemon["data-root"] = serde_json::Value::String(root.clone());
                }
                self.write_file("/etc/docker/daemon.json", daemon.to_string().as_bytes(), None)
                    .await?;
            }
            CriKind::Crio => {}
        }
        Ok(())
    }

    /// Run a kubeadm command under the retry-with-reset policy.
    async fn kubeadm_with_retry(
        &self,
        label: &str,
        command: &str,
    ) -> Result<(CommandOutput, u32), ProviderError> {
        let runner = self.runner.as_ref();
        let timeout = self.command_timeout;
        kubeadm::retry_with_reset(self.retry, runner, label, move || {
            run_checked(runner, command, timeout)
        })
        .await
    }

    fn pull_command(kind: CriKind, image: &str) -> String {
        match kind {
            CriKind::Containerd => format!("ctr -n k8s.io images pull {}", quote(image)),
            CriKind::Docker => format!("docker pull {}", quote(image)),
            CriKind::Crio => format!("crictl pull {}", quote(image)),
        }
    }
}

/// `containerd config default` output with the systemd cgroup driver and an
/// optional data root.
fn containerd_config(defaults: &str, data_root: Option<&str>) -> String {
    let mut out = String::with_capacity(defaults.len());
    for line in defaults.lines() {
        let trimmed = line.trim_start();
        let indent = &line[..line.len() - trimmed.len()];
        if trimmed.starts_with("SystemdCgroup = ") {
            out.push_str(&format!("{indent}SystemdCgroup = true"));
        } else if let (Some(root), true) = (data_root, line.starts_with("root = ")) {
            out.push_str(&format!("root = {root:?}"));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

fn data(pairs: &[(&str, String)]) -> ReturnData {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[async_trait]
impl CapabilityProvider for LinuxProvider {
    fn platform(&self) -> &Platform {
        &self.platform
    }

    async fn bootstrap_node(&self, _ctx: &TaskContext, task: &BootstrapTask) -> ProviderResult {
        self.sh("swapoff -a").await?;
        self.sh(r"sed -ri '/\sswap\s/s/^#?/#/' /etc/fstab").await?;
        match self.packages {
            PackageManager::Apt => self.sh_lenient("systemctl disable --now ufw").await,
            PackageManager::Yum | PackageManager::Dnf => {
                self.sh_lenient("systemctl disable --now firewalld").await;
                self.sh_lenient("setenforce 0").await;
            }
        }

        if !task.kernel_modules.is_empty() {
            let list = task.kernel_modules.join("\n") + "\n";
            self.write_file(MODULES_CONF, list.as_bytes(), None).await?;
            for module in &task.kernel_modules {
                self.sh(&format!("modprobe {}", quote(module))).await?;
            }
        }

        if !task.sysctl.is_empty() {
            let conf: String = task
                .sysctl
                .iter()
                .map(|(k, v)| format!("{k} = {v}\n"))
                .collect();
            self.write_file(SYSCTL_CONF, conf.as_bytes(), None).await?;
            self.sh("sysctl --system").await?;
        }

        if !task.packages.is_empty() {
            self.sh(&self.packages.install(&task.packages)).await?;
        }

        Ok(data(&[(
            "bootstrap.modules",
            task.kernel_modules.len().to_string(),
        )]))
    }

    async fn rename_node(&self, _ctx: &TaskContext, task: &RenameTask) -> ProviderResult {
        if task.hostname.trim().is_empty() {
            return Err(ProviderError::InvalidTask("empty hostname".into()));
        }
        self.sh(&format!("hostnamectl set-hostname {}", quote(&task.hostname)))
            .await?;
        Ok(data(&[(return_keys::HOSTNAME, task.hostname.clone())]))
    }

    async fn install_cri(&self, _ctx: &TaskContext, task: &CriTask) -> ProviderResult {
        let runtime = &task.runtime;
        let service = runtime.kind.service();
        let active = self
            .runner
            .run(&format!("systemctl is-active --quiet {service}"), self.command_timeout)
            .await?
            .success();

        if active && !runtime.reinstall {
            tracing::info!(%service, "container runtime already active, leaving it alone");
            return Ok(data(&[
                (return_keys::CRI_SKIPPED, "true".to_string()),
                (return_keys::CRI_RUNTIME, service.to_string()),
            ]));
        }
        if active {
            self.uninstall_runtime(runtime).await?;
        }

        let package = self.packages.pinned(self.cri_package(runtime.kind), &runtime.version);
        self.sh(&self.packages.install(&[package])).await?;
        self.configure_runtime(runtime).await?;
        self.sh(&format!(
            "systemctl daemon-reload && systemctl enable --now {service}"
        ))
        .await?;
        tracing::info!(%service, version = %runtime.version, "container runtime installed");

        Ok(data(&[
            (return_keys::CRI_SKIPPED, "false".to_string()),
            (return_keys::CRI_RUNTIME, service.to_string()),
        ]))
    }

    async fn remove_cri(&self, _ctx: &TaskContext, task: &CriTask) -> ProviderResult {
        self.uninstall_runtime(&task.runtime).await?;
        Ok(data(&[(
            return_keys::CRI_RUNTIME,
            task.runtime.kind.service().to_string(),
        )]))
    }

    async fn install_load_balancer(
        &self,
        _ctx: &TaskContext,
        task: &LoadBalancerTask,
    ) -> ProviderResult {
        self.sh(&self.packages.install(&["haproxy".to_string()]))
            .await?;
        if !task.config.is_empty() {
            self.write_file(HAPROXY_CFG, &task.config, None).await?;
        }
        self.sh("systemctl enable haproxy && systemctl restart haproxy")
            .await?;
        Ok(data(&[("lb.port", task.port.to_string())]))
    }

    async fn remove_load_balancer(
        &self,
        _ctx: &TaskContext,
        _task: &LoadBalancerTask,
    ) -> ProviderResult {
        self.sh_lenient("systemctl disable --now haproxy").await;
        self.sh(&self.packages.remove(&["haproxy".to_string()]))
            .await?;
        self.remove_file(HAPROXY_CFG).await?;
        Ok(ReturnData::new())
    }

    async fn kubeadm_init(&self, _ctx: &TaskContext, task: &KubeadmInitTask) -> ProviderResult {
        self.write_file(KUBEADM_INIT_CFG, &task.config, Some(0o600))
            .await?;
        let command = format!(
            "kubeadm init --config {} --upload-certs",
            self.host_path(KUBEADM_INIT_CFG).display()
        );
        let (output, attempts) = self.kubeadm_with_retry("kubeadm init", &command).await?;

        self.sh("mkdir -p /root/.kube && cp -f /etc/kubernetes/admin.conf /root/.kube/config")
            .await?;

        let joins = kubeadm::parse_join_commands(&output.stdout);
        let worker = match joins.worker {
            Some(cmd) => cmd,
            None => {
                let out = self.sh("kubeadm token create --print-join-command").await?;
                kubeadm::normalize_join_command(&out.stdout)
            }
        };

        let mut result = data(&[
            (return_keys::JOIN_WORKER_CMD, worker),
            (return_keys::KUBEADM_ATTEMPTS, attempts.to_string()),
        ]);
        if let Some(cmd) = joins.control_plane {
            result.insert(return_keys::JOIN_CONTROL_PLANE_CMD.to_string(), cmd);
        }
        Ok(result)
    }

    async fn join_control_plane(
        &self,
        _ctx: &TaskContext,
        task: &JoinControlPlaneTask,
    ) -> ProviderResult {
        let command = kubeadm::normalize_join_command(&task.join_command);
        if command.is_empty() {
            return Err(ProviderError::InvalidTask("empty join command".into()));
        }
        let (_, attempts) = self
            .kubeadm_with_retry("kubeadm join control-plane", &command)
            .await?;
        self.sh("mkdir -p /root/.kube && cp -f /etc/kubernetes/admin.conf /root/.kube/config")
            .await?;
        Ok(data(&[(return_keys::KUBEADM_ATTEMPTS, attempts.to_string())]))
    }

    async fn join_worker(&self, _ctx: &TaskContext, task: &JoinWorkerTask) -> ProviderResult {
        let mut command = kubeadm::normalize_join_command(&task.join_command);
        if command.is_empty() {
            return Err(ProviderError::InvalidTask("empty join command".into()));
        }
        if !task.local_endpoint.is_empty() {
            command = kubeadm::rewrite_endpoint(&command, &task.local_endpoint);
        }
        let (_, attempts) = self.kubeadm_with_retry("kubeadm join worker", &command).await?;
        Ok(data(&[(return_keys::KUBEADM_ATTEMPTS, attempts.to_string())]))
    }

    async fn kubeadm_destroy(
        &self,
        _ctx: &TaskContext,
        task: &KubeadmDestroyTask,
    ) -> ProviderResult {
        self.sh_lenient("kubeadm reset -f").await;
        self.sh_lenient("ipvsadm --clear").await;
        self.sh_lenient("iptables -F && iptables -t nat -F").await;
        self.sh("rm -rf /etc/cni/net.d /root/.kube").await?;
        if task.role == NodeRole::Master {
            self.sh("rm -rf /var/lib/etcd").await?;
        }
        Ok(data(&[("kubeadm.reset", "true".to_string())]))
    }

    async fn run_command(&self, _ctx: &TaskContext, task: &RunCommandTask) -> ProviderResult {
        let mut result = ReturnData::new();
        for (i, command) in task.commands.iter().enumerate() {
            match self.sh(command).await {
                Ok(out) => {
                    result.insert(return_keys::command_stdout(i), out.stdout.trim().to_string());
                }
                Err(e) if task.ignore_errors => {
                    tracing::warn!(index = i, error = %e, "command failed, continuing");
                    result.insert(return_keys::command_error(i), e.to_string());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    async fn write_files(&self, _ctx: &TaskContext, task: &WriteFilesTask) -> ProviderResult {
        for (path, contents) in &task.files {
            self.write_file(path, contents.as_bytes(), task.mode).await?;
        }
        Ok(data(&[("files.written", task.files.len().to_string())]))
    }

    async fn download_deps(&self, ctx: &TaskContext, task: &DownloadDepsTask) -> ProviderResult {
        let dir = match &task.target_dir {
            Some(dir) => dir.clone(),
            None => ctx.runtime.work_dir.join("deps").display().to_string(),
        };
        self.sh(&format!("mkdir -p {}", quote(&dir))).await?;
        let base = ctx.resource_server_url.trim_end_matches('/');
        for package in &task.packages {
            let command = if base.is_empty() {
                self.packages.download(package, &dir)
            } else {
                format!(
                    "curl -fsSL -o {} {}",
                    quote(&format!("{dir}/{package}")),
                    quote(&format!("{base}/packages/{package}"))
                )
            };
            self.sh(&command).await?;
        }
        Ok(data(&[
            ("deps.dir", dir),
            ("deps.count", task.packages.len().to_string()),
        ]))
    }

    async fn install_virtual_kubelet(
        &self,
        ctx: &TaskContext,
        task: &VirtualKubeletTask,
    ) -> ProviderResult {
        let kind = CriKind::parse(&ctx.cluster.spec.cri).unwrap_or(CriKind::Containerd);
        self.sh(&Self::pull_command(kind, &task.image)).await?;
        let unit = format!(
            "[Unit]\n\
             Description=virtual-kubelet ({provider})\n\
             After=network-online.target\n\n\
             [Service]\n\
             ExecStart=/usr/local/bin/virtual-kubelet --provider {provider} --nodename {node}\n\
             Restart=always\n\n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            provider = task.provider,
            node = ctx.node_name(),
        );
        self.write_file(VK_UNIT, unit.as_bytes(), Some(0o644)).await?;
        self.sh("systemctl daemon-reload && systemctl enable --now virtual-kubelet")
            .await?;
        Ok(data(&[("virtual_kubelet.provider", task.provider.clone())]))
    }

    async fn remove_virtual_kubelet(
        &self,
        _ctx: &TaskContext,
        _task: &VirtualKubeletTask,
    ) -> ProviderResult {
        self.sh_lenient("systemctl disable --now virtual-kubelet").await;
        self.remove_file(VK_UNIT).await?;
        self.sh("systemctl daemon-reload").await?;
        Ok(ReturnData::new())
    }

    async fn print_join_token(
        &self,
        _ctx: &TaskContext,
        task: &PrintJoinTokenTask,
    ) -> ProviderResult {
        let mut command = "kubeadm token create --print-join-command".to_string();
        if let Some(ttl) = &task.ttl {
            command.push_str(&format!(" --ttl {}", quote(ttl)));
        }
        let out = self.sh(&command).await?;
        let mut join = kubeadm::normalize_join_command(&out.stdout);
        if join.is_empty() {
            return Err(ProviderError::CommandFailed {
                command,
                code: out.code,
                output: "no join command printed".into(),
            });
        }
        if let Some(endpoint) = &task.local_endpoint {
            join = kubeadm::rewrite_endpoint(&join, endpoint);
        }
        Ok(data(&[(return_keys::JOIN_WORKER_CMD, join)]))
    }

    async fn create_symlinks(&self, _ctx: &TaskContext, task: &SymlinksTask) -> ProviderResult {
        for link in &task.links {
            let path = self.host_path(&link.link);
            let io_err = |source| ProviderError::Io {
                path: link.link.clone(),
                source,
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
            }
            if tokio::fs::symlink_metadata(&path).await.is_ok() {
                tokio::fs::remove_file(&path).await.map_err(io_err)?;
            }
            tokio::fs::symlink(&link.target, &path)
                .await
                .map_err(io_err)?;
        }
        Ok(data(&[("symlinks.created", task.links.len().to_string())]))
    }

    async fn curl_probe(&self, _ctx: &TaskContext, task: &CurlTask) -> ProviderResult {
        let command = format!(
            "curl -sk -o /dev/null -w '%{{http_code}}' --max-time 10 {}",
            quote(&task.url)
        );
        let out = self.runner.run(&command, self.command_timeout).await?;
        let status: u16 = out.stdout.trim().parse().unwrap_or(0);
        if status != task.expect_status {
            return Err(ProviderError::CommandFailed {
                command,
                code: out.code,
                output: format!("expected HTTP {}, got {status}", task.expect_status),
            });
        }
        Ok(data(&[(return_keys::CURL_STATUS, status.to_string())]))
    }

    async fn generate_cluster_config(
        &self,
        _ctx: &TaskContext,
        task: &ClusterConfigTask,
    ) -> ProviderResult {
        let doc = kubeadm::cluster_configuration(
            &task.cluster_name,
            &task.kubernetes_version,
            &task.api_endpoint,
            &task.pod_cidr,
            &task.service_cidr,
        );
        self.write_file(&task.output_path, doc.as_bytes(), Some(0o600))
            .await?;
        Ok(data(&[(
            return_keys::CLUSTER_CONFIG_PATH,
            task.output_path.clone(),
        )]))
    }

    async fn configure_log_shipper(
        &self,
        _ctx: &TaskContext,
        task: &LogShipperTask,
    ) -> ProviderResult {
        self.write_file(&task.destination, &task.config, Some(0o644))
            .await?;
        self.sh("systemctl enable fluent-bit && systemctl restart fluent-bit")
            .await?;
        Ok(data(&[("log_shipper.config", task.destination.clone())]))
    }

    async fn preload_images(&self, ctx: &TaskContext, task: &PreloadImagesTask) -> ProviderResult {
        let kind = CriKind::parse(&ctx.cluster.spec.cri).unwrap_or(CriKind::Containerd);
        for image in &task.images {
            self.sh(&Self::pull_command(kind, image)).await?;
        }
        Ok(data(&[("images.pulled", task.images.len().to_string())]))
    }

    async fn edit_hosts(&self, _ctx: &TaskContext, task: &HostsTask) -> ProviderResult {
        let path = self.host_path(HOSTS);
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => {
                return Err(ProviderError::Io {
                    path: HOSTS.into(),
                    source,
                })
            }
        };

        let mut out = String::new();
        let mut in_block = false;
        for line in existing.lines() {
            match line.trim() {
                HOSTS_BEGIN => in_block = true,
                HOSTS_END => in_block = false,
                _ if !in_block => {
                    out.push_str(line);
                    out.push('\n');
                }
                _ => {}
            }
        }
        out.push_str(HOSTS_BEGIN);
        out.push('\n');
        for entry in &task.entries {
            out.push_str(&format!("{}\t{}\n", entry.ip, entry.names.join(" ")));
        }
        out.push_str(HOSTS_END);
        out.push('\n');

        self.write_file(HOSTS, out.as_bytes(), None).await?;
        Ok(data(&[("hosts.entries", task.entries.len().to_string())]))
    }
}

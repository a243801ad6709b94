//! kubeadm helpers: retry-with-reset and join-command handling.

use std::future::Future;
use std::time::Duration;

use fleet_core::ProviderError;

use super::runner::{CommandOutput, CommandRunner};

const RESET: &str = "kubeadm reset -f";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff: Duration::from_secs(3),
        }
    }
}

/// Run `attempt` until it succeeds, resetting kubeadm state and backing off
/// between failures. Returns the output and the 1-based attempt that
/// succeeded; after the last failure its error is returned unchanged.
pub async fn retry_with_reset<F, Fut>(
    policy: RetryPolicy,
    runner: &dyn CommandRunner,
    label: &str,
    mut attempt: F,
) -> Result<(CommandOutput, u32), ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CommandOutput, ProviderError>>,
{
    let attempts = policy.attempts.max(1);
    let mut n = 1;
    loop {
        match attempt().await {
            Ok(output) => {
                if n > 1 {
                    tracing::info!(%label, attempt = n, "succeeded after retry");
                }
                return Ok((output, n));
            }
            Err(e) if n >= attempts => {
                tracing::error!(%label, attempts, error = %e, "giving up");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(%label, attempt = n, error = %e, "failed, resetting before retry");
                match runner.run(RESET, None).await {
                    Ok(out) if !out.success() => {
                        tracing::warn!(code = out.code, "kubeadm reset exited non-zero")
                    }
                    Err(e) => tracing::warn!(error = %e, "kubeadm reset failed"),
                    Ok(_) => {}
                }
                tokio::time::sleep(policy.backoff).await;
                n += 1;
            }
        }
    }
}

/// Join strings printed by `kubeadm init`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinCommands {
    pub control_plane: Option<String>,
    pub worker: Option<String>,
}

/// Extract the control-plane and worker join commands from kubeadm stdout.
pub fn parse_join_commands(stdout: &str) -> JoinCommands {
    let mut found = JoinCommands::default();
    let mut lines = stdout.lines();
    while let Some(line) = lines.next() {
        if !line.trim_start().starts_with("kubeadm join") {
            continue;
        }
        let mut raw = line.trim().to_string();
        while raw.trim_end().ends_with('\\') {
            match lines.next() {
                Some(next) => {
                    raw.push('\n');
                    raw.push_str(next);
                }
                None => break,
            }
        }
        let command = normalize_join_command(&raw);
        if command.contains("--control-plane") {
            found.control_plane.get_or_insert(command);
        } else {
            found.worker.get_or_insert(command);
        }
    }
    found
}

/// Strip indentation and continuation backslashes, collapse whitespace.
pub fn normalize_join_command(raw: &str) -> String {
    raw.split_whitespace()
        .filter(|token| *token != "\\")
        .map(|token| token.trim_end_matches('\\'))
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replace the API endpoint argument of a join command.
pub fn rewrite_endpoint(command: &str, endpoint: &str) -> String {
    let mut tokens: Vec<&str> = command.split_whitespace().collect();
    if let Some(pos) = tokens.iter().position(|t| *t == "join") {
        if let Some(next) = tokens.get(pos + 1) {
            if !next.starts_with("--") {
                tokens[pos + 1] = endpoint;
            }
        }
    }
    tokens.join(" ")
}

/// kubeadm `ClusterConfiguration` document.
pub fn cluster_configuration(
    cluster_name: &str,
    kubernetes_version: &str,
    api_endpoint: &str,
    pod_cidr: &str,
    service_cidr: &str,
) -> String {
    format!(
        "apiVersion: kubeadm.k8s.io/v1beta3\n\
         kind: ClusterConfiguration\n\
         clusterName: {cluster_name}\n\
         kubernetesVersion: {kubernetes_version}\n\
         controlPlaneEndpoint: {api_endpoint}\n\
         networking:\n  \
           podSubnet: {pod_cidr}\n  \
           serviceSubnet: {service_cidr}\n"
    )
}

/// kubeadm `InitConfiguration` document for the first control-plane node.
pub fn init_configuration(advertise_address: &str, bind_port: u16, node_name: &str) -> String {
    format!(
        "apiVersion: kubeadm.k8s.io/v1beta3\n\
         kind: InitConfiguration\n\
         localAPIEndpoint:\n  \
           advertiseAddress: {advertise_address}\n  \
           bindPort: {bind_port}\n\
         nodeRegistration:\n  \
           name: {node_name}\n"
    )
}

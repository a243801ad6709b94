//! Step sequences for each operation type.

use std::collections::BTreeMap;

use fleet_core::model::return_keys;
use fleet_core::task::{
    BootstrapTask, ContainerRuntime, CriKind, CriTask, HostEntry, HostsTask, JoinControlPlaneTask,
    JoinWorkerTask, KubeadmDestroyTask, KubeadmInitTask, LoadBalancerTask, PrintJoinTokenTask,
    RenameTask, RunCommandTask, TaskMeta,
};
use fleet_core::{Cluster, EngineError, Node, NodeRole, OperationRequest, OperationType, Task};

use super::policy::{StrictPolicy, TolerantPolicy};
use super::step::{NodeStep, Step};
use crate::provider::kubeadm;

/// Request parameter naming the target nodes, comma separated.
pub const NODES_PARAM: &str = "nodes";

const KERNEL_MODULES: [&str; 2] = ["overlay", "br_netfilter"];
const KUBE_PACKAGES: [&str; 3] = ["kubelet", "kubeadm", "kubectl"];

/// Build the Steps for `request`.
pub fn plan(request: &OperationRequest) -> Result<Vec<Step>, EngineError> {
    let cluster = &request.cluster;
    match request.operation_type {
        OperationType::CreateCluster => create_cluster(cluster),
        OperationType::AddWorkers => {
            let nodes = target_nodes(cluster, &request.parameters)?;
            add_workers(cluster, &nodes)
        }
        OperationType::RemoveNodes => {
            let nodes = target_nodes(cluster, &request.parameters)?;
            Ok(remove_nodes(cluster, &nodes))
        }
        OperationType::DestroyCluster => Ok(destroy_cluster(cluster)),
        OperationType::DeployAddons => Err(EngineError::NoPlan("deploy-addons".into())),
        OperationType::Upgrade => Err(EngineError::NoPlan("upgrade".into())),
    }
}

fn target_nodes<'a>(
    cluster: &'a Cluster,
    parameters: &BTreeMap<String, String>,
) -> Result<Vec<&'a Node>, EngineError> {
    let raw = parameters.get(NODES_PARAM).map(String::as_str).unwrap_or("");
    let ids: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if ids.is_empty() {
        return Err(EngineError::InvalidRequest(format!(
            "missing {NODES_PARAM:?} parameter"
        )));
    }
    ids.into_iter()
        .map(|id| {
            cluster
                .node(id)
                .ok_or_else(|| EngineError::InvalidRequest(format!("unknown node {id:?}")))
        })
        .collect()
}

fn first_master(cluster: &Cluster) -> Result<&Node, EngineError> {
    cluster
        .masters()
        .next()
        .ok_or_else(|| EngineError::InvalidRequest("cluster has no master node".into()))
}

/// One NodeStep per node, each built by `tasks`.
fn per_node(name: &str, nodes: &[&Node], tasks: impl Fn(&Node) -> Vec<Task>) -> Step {
    Step::new(name).with_node_steps(
        nodes
            .iter()
            .map(|n| NodeStep::new(name, n.id.as_str(), tasks(n)))
            .collect(),
    )
}

/// Endpoint workers reach the API server through.
fn local_endpoint(cluster: &Cluster) -> String {
    if cluster.spec.lb_enabled {
        format!("127.0.0.1:{}", cluster.spec.lb_port)
    } else {
        cluster.api_endpoint()
    }
}

fn bootstrap() -> Task {
    let sysctl = [
        "net.bridge.bridge-nf-call-iptables",
        "net.bridge.bridge-nf-call-ip6tables",
        "net.ipv4.ip_forward",
    ]
    .into_iter()
    .map(|k| (k.to_string(), "1".to_string()))
    .collect();
    Task::Bootstrap(BootstrapTask {
        meta: TaskMeta::create(),
        kernel_modules: KERNEL_MODULES.iter().map(|m| m.to_string()).collect(),
        sysctl,
        packages: KUBE_PACKAGES.iter().map(|p| p.to_string()).collect(),
    })
}

fn hosts(cluster: &Cluster) -> Task {
    Task::Hosts(HostsTask {
        meta: TaskMeta::create(),
        entries: cluster
            .nodes
            .iter()
            .map(|n| HostEntry {
                ip: n.ip.clone(),
                names: vec![n.name.clone()],
            })
            .collect(),
    })
}

fn cri(cluster: &Cluster, meta: TaskMeta) -> Task {
    Task::Cri(CriTask {
        meta,
        runtime: ContainerRuntime {
            kind: CriKind::parse(&cluster.spec.cri).unwrap_or(CriKind::Containerd),
            version: cluster.spec.cri_version.clone(),
            reinstall: false,
            data_root: None,
        },
    })
}

fn load_balancer(cluster: &Cluster, meta: TaskMeta) -> Task {
    Task::LoadBalancer(LoadBalancerTask {
        meta,
        config: haproxy_config(cluster).into_bytes(),
        vip: cluster.spec.api_vip.clone(),
        port: cluster.spec.lb_port,
    })
}

fn destroy(node: &Node) -> Task {
    Task::KubeadmDestroy(KubeadmDestroyTask {
        meta: TaskMeta::delete(),
        role: node.role,
    })
}

/// haproxy TCP balancer in front of every master's API server.
pub fn haproxy_config(cluster: &Cluster) -> String {
    let mut cfg = format!(
        "global\n    maxconn 4000\n\n\
         defaults\n    mode tcp\n    timeout connect 5s\n    timeout client 1h\n    timeout server 1h\n\n\
         frontend kube-apiserver\n    bind 127.0.0.1:{}\n    default_backend masters\n\n\
         backend masters\n    balance roundrobin\n",
        cluster.spec.lb_port
    );
    for master in cluster.masters() {
        cfg.push_str(&format!(
            "    server {} {}:{} check\n",
            master.name, master.ip, cluster.spec.api_port
        ));
    }
    cfg
}

pub fn create_cluster(cluster: &Cluster) -> Result<Vec<Step>, EngineError> {
    let first = first_master(cluster)?;
    let all: Vec<&Node> = cluster.nodes.iter().collect();

    let mut steps = vec![
        per_node("bootstrap", &all, |_| vec![bootstrap()]),
        per_node("rename", &all, |n| {
            vec![Task::Rename(RenameTask {
                meta: TaskMeta::create(),
                hostname: n.name.clone(),
            })]
        }),
        per_node("hosts", &all, |_| vec![hosts(cluster)]),
        per_node("container-runtime", &all, |_| {
            vec![cri(cluster, TaskMeta::create())]
        }),
    ];
    if cluster.spec.lb_enabled {
        steps.push(per_node("load-balancer", &all, |_| {
            vec![load_balancer(cluster, TaskMeta::create())]
        }));
    }

    let config = format!(
        "{}---\n{}",
        kubeadm::init_configuration(&first.ip, cluster.spec.api_port, &first.name),
        kubeadm::cluster_configuration(
            &cluster.name,
            &cluster.version,
            &cluster.api_endpoint(),
            &cluster.spec.pod_cidr,
            &cluster.spec.service_cidr,
        )
    );
    steps.push(
        Step::new("init-control-plane")
            .with_node_steps(vec![NodeStep::new(
                "kubeadm-init",
                first.id.as_str(),
                vec![Task::KubeadmInit(KubeadmInitTask {
                    meta: TaskMeta::create(),
                    config: config.into_bytes(),
                })],
            )])
            .policy(StrictPolicy {
                abort_on_first_failure: true,
            }),
    );

    let first_id = first.id.clone();
    steps.push(
        Step::new("join-control-plane").dynamic(move |data, cluster, _op| {
            let others: Vec<&Node> = cluster.masters().filter(|n| n.id != first_id).collect();
            if others.is_empty() {
                return Ok(Vec::new());
            }
            let command = data
                .get(return_keys::JOIN_CONTROL_PLANE_CMD)
                .ok_or_else(|| format!("no {} returned", return_keys::JOIN_CONTROL_PLANE_CMD))?;
            Ok(others
                .into_iter()
                .map(|n| {
                    NodeStep::new(
                        "join-control-plane",
                        n.id.as_str(),
                        vec![Task::JoinControlPlane(JoinControlPlaneTask {
                            meta: TaskMeta::create(),
                            join_command: command.clone(),
                        })],
                    )
                })
                .collect())
        }),
    );

    steps.push(
        Step::new("join-workers")
            .dynamic(|data, cluster, _op| {
                let workers: Vec<String> = cluster.workers().map(|n| n.id.clone()).collect();
                join_workers(data, cluster, &workers)
            })
            .policy(TolerantPolicy::minority()),
    );
    Ok(steps)
}

fn join_workers(
    data: &fleet_core::ReturnData,
    cluster: &Cluster,
    node_ids: &[String],
) -> Result<Vec<NodeStep>, String> {
    if node_ids.is_empty() {
        return Ok(Vec::new());
    }
    let command = data
        .get(return_keys::JOIN_WORKER_CMD)
        .ok_or_else(|| format!("no {} returned", return_keys::JOIN_WORKER_CMD))?;
    let endpoint = local_endpoint(cluster);
    Ok(node_ids
        .iter()
        .map(|id| {
            NodeStep::new(
                "join-worker",
                id.as_str(),
                vec![Task::JoinWorker(JoinWorkerTask {
                    meta: TaskMeta::create(),
                    join_command: command.clone(),
                    local_endpoint: endpoint.clone(),
                })],
            )
        })
        .collect())
}

pub fn add_workers(cluster: &Cluster, nodes: &[&Node]) -> Result<Vec<Step>, EngineError> {
    if let Some(master) = nodes.iter().find(|n| n.role == NodeRole::Master) {
        return Err(EngineError::InvalidRequest(format!(
            "{} is a master node",
            master.id
        )));
    }
    let first = first_master(cluster)?;
    let all: Vec<&Node> = cluster.nodes.iter().collect();

    let mut steps = vec![
        per_node("bootstrap", nodes, |_| vec![bootstrap()]),
        per_node("rename", nodes, |n| {
            vec![Task::Rename(RenameTask {
                meta: TaskMeta::create(),
                hostname: n.name.clone(),
            })]
        }),
        per_node("hosts", &all, |_| vec![hosts(cluster)]).skip_unreachable(),
        per_node("container-runtime", nodes, |_| {
            vec![cri(cluster, TaskMeta::create())]
        }),
    ];
    if cluster.spec.lb_enabled {
        steps.push(per_node("load-balancer", nodes, |_| {
            vec![load_balancer(cluster, TaskMeta::create())]
        }));
    }
    steps.push(
        Step::new("print-join-token")
            .with_node_steps(vec![NodeStep::new(
                "print-join-token",
                first.id.as_str(),
                vec![Task::PrintJoinToken(PrintJoinTokenTask {
                    meta: TaskMeta::create(),
                    ttl: None,
                    local_endpoint: None,
                })],
            )])
            .policy(StrictPolicy::default()),
    );

    let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
    steps.push(
        Step::new("join-workers")
            .dynamic(move |data, cluster, _op| join_workers(data, cluster, &ids)),
    );
    Ok(steps)
}

pub fn remove_nodes(cluster: &Cluster, nodes: &[&Node]) -> Vec<Step> {
    let mut steps = Vec::new();
    let removed: Vec<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
    let survivor = cluster
        .masters()
        .find(|m| !removed.contains(&m.id.as_str()));
    if let Some(master) = survivor {
        let commands = nodes
            .iter()
            .flat_map(|n| {
                [
                    format!(
                        "kubectl drain {} --ignore-daemonsets --delete-emptydir-data --force --timeout=120s",
                        n.name
                    ),
                    format!("kubectl delete node {}", n.name),
                ]
            })
            .collect();
        steps.push(
            Step::new("drain")
                .with_node_steps(vec![NodeStep::new(
                    "drain",
                    master.id.as_str(),
                    vec![Task::RunCommand(RunCommandTask {
                        meta: TaskMeta::create(),
                        commands,
                        ignore_errors: true,
                    })],
                )])
                .skip_unreachable(),
        );
    }
    steps.push(
        per_node("reset-nodes", nodes, |n| vec![destroy(n)])
            .skip_unreachable()
            .policy(TolerantPolicy::minority()),
    );
    steps
}

pub fn destroy_cluster(cluster: &Cluster) -> Vec<Step> {
    let all: Vec<&Node> = cluster.nodes.iter().collect();
    let lb_enabled = cluster.spec.lb_enabled;
    vec![
        per_node("reset-nodes", &all, |n| {
            let mut tasks = vec![destroy(n)];
            if lb_enabled {
                tasks.push(load_balancer(cluster, TaskMeta::delete()));
            }
            tasks
        })
        .skip_unreachable(),
        per_node("remove-runtime", &all, |_| {
            vec![cri(cluster, TaskMeta::delete())]
        })
        .skip_unreachable(),
    ]
}

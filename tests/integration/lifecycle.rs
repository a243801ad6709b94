//! Whole operations, planned and driven through real dispatchers.

use std::sync::atomic::{AtomicUsize, Ordering};

use fleet_core::model::return_keys;
use fleet_core::{OperationStatus, StepStatus};
use fleet_services::engine::plans::NODES_PARAM;

use crate::*;

/// Runtime not installed yet; `kubeadm init` prints `init` when given.
fn fresh_host(init: Option<String>) -> Arc<ScriptedRunner> {
    ScriptedRunner::new(move |cmd| {
        if cmd.starts_with("systemctl is-active") {
            exit(3, "")
        } else if cmd.starts_with("kubeadm init") {
            ok(init.as_deref().unwrap_or(""))
        } else {
            ok("")
        }
    })
}

#[tokio::test]
async fn create_cluster_end_to_end() {
    let fleet = Fleet::start(Duration::from_secs(10)).await;
    let m1 = fresh_host(Some(init_output("10.0.0.1:6443", "abc.def")));
    let m2 = fresh_host(None);
    let w1 = fresh_host(None);
    let m1_root = fleet.linux_agent("m1", m1.clone()).await;
    fleet.linux_agent("m2", m2.clone()).await;
    let w1_root = fleet.linux_agent("w1", w1.clone()).await;

    let op = fleet
        .run(request(
            OperationType::CreateCluster,
            cluster(vec![
                node("m1", "10.0.0.1", NodeRole::Master),
                node("m2", "10.0.0.2", NodeRole::Master),
                node("w1", "10.0.0.11", NodeRole::Worker),
            ]),
        ))
        .await;

    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    let names: Vec<&str> = op.steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        [
            "bootstrap",
            "rename",
            "hosts",
            "container-runtime",
            "load-balancer",
            "init-control-plane",
            "join-control-plane",
            "join-workers",
        ]
    );
    assert!(op.steps.iter().all(|s| s.status == StepStatus::Successful));
    assert_eq!(op.current_step, names.len() - 1);

    // Only the first master initialises.
    assert_eq!(m1.ran("kubeadm init").len(), 1);
    assert!(m2.ran("kubeadm init").is_empty());
    assert!(w1.ran("kubeadm init").is_empty());

    assert_eq!(
        m2.ran("kubeadm join"),
        ["kubeadm join 10.0.0.1:6443 --token abc.def --discovery-token-ca-cert-hash sha256:feed --control-plane --certificate-key c0ffee"]
    );
    // Workers go through the node-local balancer.
    assert_eq!(
        w1.ran("kubeadm join"),
        ["kubeadm join 127.0.0.1:8443 --token abc.def --discovery-token-ca-cert-hash sha256:feed"]
    );
    assert_eq!(w1.ran("hostnamectl"), ["hostnamectl set-hostname w1-host"]);

    let haproxy = std::fs::read_to_string(m1_root.join("etc/haproxy/haproxy.cfg")).unwrap();
    assert!(haproxy.contains("server m1-host 10.0.0.1:6443"));
    assert!(haproxy.contains("server m2-host 10.0.0.2:6443"));
    let hosts = std::fs::read_to_string(w1_root.join("etc/hosts")).unwrap();
    assert!(hosts.contains("m2-host"));

    assert_eq!(
        op.pre_step_return_data[return_keys::JOIN_WORKER_CMD],
        "kubeadm join 10.0.0.1:6443 --token abc.def --discovery-token-ca-cert-hash sha256:feed"
    );
    assert_eq!(fleet.store.operation(&op.id).unwrap(), op);
}

#[tokio::test]
async fn kubeadm_init_retries_report_only_the_final_attempt() {
    let fleet = Fleet::start(Duration::from_secs(10)).await;
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let m1 = ScriptedRunner::new(move |cmd| {
        if cmd.starts_with("kubeadm init") {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 5 {
                let mut out = exit(1, "[ERROR Port-6443]: Port 6443 is in use");
                out.stdout = init_output("10.0.0.1:6443", &format!("bad{n}.token"));
                return out;
            }
            return ok(&init_output("10.0.0.1:6443", "good.token"));
        }
        if cmd.starts_with("systemctl is-active") {
            return exit(3, "");
        }
        ok("")
    });
    let w1 = fresh_host(None);
    fleet.linux_agent("m1", m1.clone()).await;
    fleet.linux_agent("w1", w1.clone()).await;

    let op = fleet
        .run(request(
            OperationType::CreateCluster,
            cluster(vec![
                node("m1", "10.0.0.1", NodeRole::Master),
                node("w1", "10.0.0.11", NodeRole::Worker),
            ]),
        ))
        .await;

    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    assert_eq!(attempts.load(Ordering::SeqCst), 5);
    assert_eq!(m1.ran("kubeadm reset -f").len(), 4);

    let worker_cmd = &op.pre_step_return_data[return_keys::JOIN_WORKER_CMD];
    assert!(worker_cmd.contains("good.token"));
    assert!(!worker_cmd.contains("bad"));
    assert_eq!(
        w1.ran("kubeadm join"),
        ["kubeadm join 127.0.0.1:8443 --token good.token --discovery-token-ca-cert-hash sha256:feed"]
    );
}

#[tokio::test]
async fn control_plane_join_uses_returned_command_verbatim() {
    let fleet = Fleet::start(Duration::from_secs(10)).await;
    let m1 = fresh_host(Some(init_output("10.0.0.1:6443", "abc.def")));
    // m2 reports unrelated keys of its own during the earlier steps.
    let m2 = ScriptedRunner::new(|cmd| {
        if cmd.starts_with("systemctl is-active") {
            exit(3, "")
        } else if cmd.starts_with("kubeadm join") {
            ok("This node has joined the cluster")
        } else {
            ok("noise")
        }
    });
    fleet.linux_agent("m1", m1.clone()).await;
    fleet.linux_agent("m2", m2.clone()).await;

    let mut c = cluster(vec![
        node("m1", "10.0.0.1", NodeRole::Master),
        node("m2", "10.0.0.2", NodeRole::Master),
    ]);
    c.spec.lb_enabled = false;
    let op = fleet.run(request(OperationType::CreateCluster, c)).await;

    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    let expected = "kubeadm join 10.0.0.1:6443 --token abc.def --discovery-token-ca-cert-hash sha256:feed --control-plane --certificate-key c0ffee";
    assert_eq!(
        op.pre_step_return_data[return_keys::JOIN_CONTROL_PLANE_CMD],
        expected
    );
    assert_eq!(m2.ran("kubeadm join"), [expected]);
    assert!(m1.ran("systemctl enable haproxy").is_empty());
}

#[tokio::test]
async fn remove_nodes_drains_then_resets() {
    let fleet = Fleet::start(Duration::from_secs(10)).await;
    let m1 = ScriptedRunner::passing();
    let w1 = ScriptedRunner::passing();
    fleet.linux_agent("m1", m1.clone()).await;
    fleet.linux_agent("w1", w1.clone()).await;

    let mut req = request(
        OperationType::RemoveNodes,
        cluster(vec![
            node("m1", "10.0.0.1", NodeRole::Master),
            node("w1", "10.0.0.11", NodeRole::Worker),
        ]),
    );
    req.parameters.insert(NODES_PARAM.into(), "w1".into());
    let op = fleet.run(req).await;

    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    assert_eq!(m1.ran("kubectl drain").len(), 1);
    assert!(m1.ran("kubectl drain")[0].starts_with("kubectl drain w1-host"));
    assert_eq!(m1.ran("kubectl delete node"), ["kubectl delete node w1-host"]);
    assert!(!w1.ran("kubeadm reset -f").is_empty());
    assert!(m1.ran("kubeadm reset -f").is_empty());
}

#[tokio::test]
async fn destroy_cluster_skips_unreachable_nodes() {
    let fleet = Fleet::start(Duration::from_secs(10)).await;
    let m1 = ScriptedRunner::passing();
    fleet.linux_agent("m1", m1.clone()).await;

    let mut w1 = node("w1", "10.0.0.11", NodeRole::Worker);
    w1.agent_status = AgentStatus::Unreachable;
    let op = fleet
        .run(request(
            OperationType::DestroyCluster,
            cluster(vec![node("m1", "10.0.0.1", NodeRole::Master), w1]),
        ))
        .await;

    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    for step in &op.steps {
        assert!(step.on_success_nodes.contains("m1"), "{}", step.name);
        assert!(step.unreachable_nodes.contains("w1"), "{}", step.name);
    }
    assert!(!m1.ran("kubeadm reset -f").is_empty());
    assert!(!m1.ran("systemctl disable --now haproxy").is_empty());
    assert!(!m1.ran("systemctl disable --now containerd").is_empty());
}

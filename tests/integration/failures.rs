//! Misbehaving tasks, agents and nodes.

use std::collections::HashSet;

use fleet_core::config::LivenessConfig;
use fleet_core::{OperationStatus, QueueBody, QueueReply, ReplyStat, StepStatus};
use fleet_services::provider::platform;
use fleet_services::{BusMessage, LivenessDetector, Prober};

use crate::*;

/// Prober that fails for every address in `down`.
#[derive(Default)]
struct SwitchProber {
    down: Mutex<HashSet<String>>,
}

impl SwitchProber {
    fn take_down(&self, addr: &str) {
        self.down.lock().unwrap().insert(addr.to_string());
    }
}

#[async_trait]
impl Prober for SwitchProber {
    async fn probe(&self, addr: &str, _timeout: Duration) -> bool {
        !self.down.lock().unwrap().contains(addr)
    }
}

fn liveness_config() -> LivenessConfig {
    LivenessConfig {
        enabled: true,
        interval_secs: 1,
        probe_timeout_ms: 100,
        signal_port: 7421,
    }
}

fn one_node(id: &str) -> OperationRequest {
    request(
        OperationType::CreateCluster,
        cluster(vec![node(id, "10.0.0.1", NodeRole::Master)]),
    )
}

#[tokio::test]
async fn unknown_task_type_gets_an_error_reply() {
    let fleet = Fleet::start(Duration::from_secs(5)).await;
    let runner = ScriptedRunner::passing();
    fleet.linux_agent("m1", runner.clone()).await;

    let c = cluster(vec![node("m1", "10.0.0.1", NodeRole::Master)]);
    let one = run_command("m1", &["true"]);
    let mut body = QueueBody::new("op-1234", "ns-5678", c, &one.task).unwrap();
    body.task_type = "launch-rocket".into();

    let inbox = subjects::inbox("it");
    let mut replies = fleet.bus.subscribe(&inbox, None).await.unwrap();
    fleet
        .bus
        .publish(
            BusMessage::new(subjects::node("m1"), body.to_bytes().unwrap()).with_reply_to(&inbox),
        )
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), replies.next())
        .await
        .unwrap()
        .unwrap();
    let reply = QueueReply::from_bytes(&msg.payload).unwrap();
    assert_eq!(reply.stat, ReplyStat::Error);
    assert_eq!(reply.operation_id, "op-1234");
    assert_eq!(reply.node_step_id, "ns-5678");
    assert!(reply.message.contains("launch-rocket"), "{}", reply.message);
    assert!(runner.commands().is_empty());

    // The agent keeps serving.
    let op = fleet
        .run_steps(one_node("m1"), vec![step("run", vec![run_command("m1", &["echo hi"])])])
        .await;
    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    assert_eq!(runner.commands(), ["echo hi"]);
}

#[tokio::test]
async fn garbage_envelope_is_answered_not_fatal() {
    let fleet = Fleet::start(Duration::from_secs(5)).await;
    let runner = ScriptedRunner::passing();
    fleet.linux_agent("m1", runner.clone()).await;

    let inbox = subjects::inbox("it");
    let mut replies = fleet.bus.subscribe(&inbox, None).await.unwrap();
    fleet
        .bus
        .publish(
            BusMessage::new(
                subjects::node("m1"),
                &br#"{"operation_id":"op-9","node_step_id":"ns-9","task_type":7}"#[..],
            )
            .with_reply_to(&inbox),
        )
        .await
        .unwrap();

    let msg = tokio::time::timeout(Duration::from_secs(5), replies.next())
        .await
        .unwrap()
        .unwrap();
    let reply = QueueReply::from_bytes(&msg.payload).unwrap();
    assert_eq!(reply.stat, ReplyStat::Error);
    assert_eq!(reply.operation_id, "op-9");
    assert_eq!(reply.node_step_id, "ns-9");
}

#[tokio::test]
async fn liveness_flip_does_not_disturb_a_dispatched_node_step() {
    let fleet = Fleet::start(Duration::from_secs(5)).await;
    let runner = ScriptedRunner::stalling("slow", Duration::from_millis(300), |_| ok("done"));
    fleet.linux_agent("m1", runner.clone()).await;

    let prober = Arc::new(SwitchProber::default());
    let detector = LivenessDetector::new(fleet.store.clone(), prober.clone(), liveness_config());

    let (_, handle) = fleet.submit(
        one_node("m1"),
        vec![step("run", vec![run_command("m1", &["slow job"])]).skip_unreachable()],
    );
    eventually("dispatch", || !runner.commands().is_empty()).await;

    prober.take_down("10.0.0.1:7421");
    let report = detector.sweep().await;
    assert_eq!(report.marked_unreachable, 1);
    assert_eq!(
        fleet.store.node("m1").unwrap().agent_status,
        AgentStatus::Unreachable
    );

    let op = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    assert!(op.steps[0].on_success_nodes.contains("m1"));
    assert!(op.steps[0].unreachable_nodes.is_empty());

    // The next Step that consults the flag does not dispatch to m1.
    let op = fleet
        .run_steps(
            one_node("m1"),
            vec![step("again", vec![run_command("m1", &["second job"])]).skip_unreachable()],
        )
        .await;
    assert!(op.steps[0].unreachable_nodes.contains("m1"));
    assert!(runner.ran("second").is_empty());
}

#[tokio::test]
async fn unsupported_platform_agent_fails_every_task() {
    let fleet = Fleet::start(Duration::from_secs(5)).await;
    let runner = ScriptedRunner::passing();
    let provider = platform::resolve(
        &platform::Platform::new("plan9", "4"),
        runner.clone(),
        platform::ProviderSettings {
            retry: RetryPolicy::default(),
            command_timeout: None,
            root: temp_root("p9"),
        },
    );
    assert!(provider.is_err());
    fleet.agent("p9", provider).await;

    let op = fleet
        .run_steps(one_node("p9"), vec![step("run", vec![run_command("p9", &["true"])])])
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.steps[0].status, StepStatus::Error);
    let issue = &op.issues["p9"];
    assert!(issue.contains("unsupported platform plan9 4"), "{issue}");
    assert!(runner.commands().is_empty());
}

#[tokio::test]
async fn failed_command_ends_operation_with_node_issue() {
    let fleet = Fleet::start(Duration::from_secs(5)).await;
    let runner = ScriptedRunner::new(|cmd| {
        if cmd == "false" {
            exit(1, "nope")
        } else {
            ok("")
        }
    });
    fleet.linux_agent("m1", runner.clone()).await;

    let op = fleet
        .run_steps(
            one_node("m1"),
            vec![
                step("first", vec![run_command("m1", &["false"])]),
                step("second", vec![run_command("m1", &["echo never"])]),
            ],
        )
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.current_step, 0);
    assert_eq!(op.steps[1].status, StepStatus::Pending);
    assert!(op.message.contains("first"), "{}", op.message);
    assert!(op.issues["m1"].contains("nope"));
    assert_eq!(runner.commands(), ["false"]);
}

#[tokio::test]
async fn silent_agent_times_out() {
    let fleet = Fleet::start(Duration::from_millis(200)).await;
    // Listens on the node subject but never answers.
    let _sub = fleet.bus.subscribe(&subjects::node("m1"), None).await.unwrap();

    let op = fleet
        .run_steps(one_node("m1"), vec![step("run", vec![run_command("m1", &["true"])])])
        .await;

    assert_eq!(op.status, OperationStatus::Error);
    assert!(op.steps[0].on_timeout_nodes.contains("m1"));
    assert_eq!(op.issues["m1"], "timed out");
}

#[tokio::test]
async fn cancel_stops_a_running_operation() {
    let fleet = Fleet::start(Duration::from_secs(30)).await;
    let runner = ScriptedRunner::stalling("hang", Duration::from_secs(20), |_| ok(""));
    fleet.linux_agent("m1", runner.clone()).await;

    let (id, handle) = fleet.submit(
        one_node("m1"),
        vec![
            step("stuck", vec![run_command("m1", &["hang"])]),
            step("after", vec![run_command("m1", &["echo after"])]),
        ],
    );
    eventually("dispatch", || !runner.commands().is_empty()).await;
    assert!(fleet.engine.is_running(&id));
    assert!(fleet.engine.cancel(&id));

    let op = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.status, OperationStatus::Error);
    assert_eq!(op.message, "operation cancelled");
    assert!(!fleet.engine.is_running(&op.id));
    assert!(runner.ran("echo after").is_empty());
}

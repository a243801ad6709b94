//! Agents on the far side of the TCP hub.

use fleet_core::model::return_keys;
use fleet_core::OperationStatus;
use fleet_services::bus::{self, serve_hub};
use fleet_services::{BusMessage, TcpBus};
use tokio::net::TcpListener;

use crate::*;

/// Hub over `local`; the returned sender stops it.
async fn hub(local: &LocalBus) -> (String, broadcast::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (shutdown, _) = broadcast::channel(1);
    tokio::spawn(serve_hub(listener, local.clone(), shutdown.subscribe()));
    (addr, shutdown)
}

#[tokio::test]
async fn operation_runs_on_remote_agent() {
    let local = LocalBus::new();
    let (addr, _shutdown) = hub(&local).await;
    let fleet = Fleet::on_bus(local, Duration::from_secs(5)).await;

    let runner = ScriptedRunner::new(|cmd| match cmd {
        "hostname -i" => ok("10.0.0.1\n"),
        _ => exit(127, "not found"),
    });
    let remote = TcpBus::connect(&addr).await.unwrap();
    fleet
        .agent_on(
            Arc::new(remote),
            "m1",
            Ok(linux_provider(runner.clone(), temp_root("m1"))),
        )
        .await;

    let op = fleet
        .run_steps(
            request(
                OperationType::CreateCluster,
                cluster(vec![node("m1", "10.0.0.1", NodeRole::Master)]),
            ),
            vec![step("ip", vec![run_command("m1", &["hostname -i"])])],
        )
        .await;

    assert_eq!(op.status, OperationStatus::Successful, "{}", op.message);
    assert_eq!(
        op.pre_step_return_data[&return_keys::command_stdout(0)],
        "10.0.0.1"
    );
    assert_eq!(runner.commands(), ["hostname -i"]);
}

#[tokio::test]
async fn request_reply_crosses_the_hub() {
    let local = LocalBus::new();
    let (addr, _shutdown) = hub(&local).await;

    let mut requests = local.subscribe(subjects::SUBMIT, None).await.unwrap();
    let responder = local.clone();
    tokio::spawn(async move {
        while let Some(msg) = requests.next().await {
            let Some(reply_to) = msg.reply_to else { continue };
            let mut answer = b"ack:".to_vec();
            answer.extend_from_slice(&msg.payload);
            responder
                .publish(BusMessage::new(reply_to, answer))
                .await
                .unwrap();
        }
    });

    let remote = TcpBus::connect(&addr).await.unwrap();
    let reply = bus::request(&remote, subjects::SUBMIT, &b"op"[..], Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(&reply.payload[..], b"ack:op");
}

//! fleet integration test harness.
//!
//! Each test starts an engine on an in-process bus and real dispatchers in
//! front of the Linux provider. Shell commands go to a scripted runner that
//! records them; files the provider writes land under a per-agent
//! temporary root. `transport` repeats the round trip over the TCP hub.
//!
//!   cargo test --test integration

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use fleet_core::envelope::subjects;
use fleet_core::model::new_id;
use fleet_core::task::{RunCommandTask, TaskMeta};
use fleet_core::{
    AgentStatus, Cluster, ClusterSpec, Node, NodeRole, Operation, OperationRequest,
    OperationType, ProviderError, Task,
};
use fleet_services::engine::plan;
use fleet_services::provider::kubeadm::RetryPolicy;
use fleet_services::provider::linux::LinuxProvider;
use fleet_services::provider::platform::{PackageManager, Platform, ProviderSettings};
use fleet_services::provider::runner::CommandOutput;
use fleet_services::{
    Bus, CapabilityProvider, ClientRuntimeConfig, CommandRunner, Dispatcher, Engine,
    EngineSettings, LocalBus, MemoryStore, RuntimeCache, Step, Store,
};

mod failures;
mod lifecycle;
mod transport;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const GROUP: &str = "default";

type Script = dyn Fn(&str) -> CommandOutput + Send + Sync;

/// Command runner driven by a closure. Every command is logged before it
/// "runs"; commands matching a stall prefix sleep first.
pub struct ScriptedRunner {
    log: Mutex<Vec<String>>,
    script: Box<Script>,
    stall: Option<(&'static str, Duration)>,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&str) -> CommandOutput + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            script: Box::new(script),
            stall: None,
        })
    }

    /// Every command succeeds with empty output.
    pub fn passing() -> Arc<Self> {
        Self::new(|_| ok(""))
    }

    pub fn stalling(
        prefix: &'static str,
        delay: Duration,
        script: impl Fn(&str) -> CommandOutput + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            script: Box::new(script),
            stall: Some((prefix, delay)),
        })
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn ran(&self, prefix: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        command: &str,
        _timeout: Option<Duration>,
    ) -> Result<CommandOutput, ProviderError> {
        self.log.lock().unwrap().push(command.to_string());
        if let Some((prefix, delay)) = self.stall {
            if command.starts_with(prefix) {
                tokio::time::sleep(delay).await;
            }
        }
        Ok((self.script)(command))
    }
}

pub fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn exit(code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}

/// What `kubeadm init` prints, with `token` in both join commands.
pub fn init_output(api: &str, token: &str) -> String {
    format!(
        "Your Kubernetes control-plane has initialized successfully!\n\n\
         You can now join any number of control-plane nodes by running:\n\n  \
         kubeadm join {api} --token {token} \\\n\t\
         --discovery-token-ca-cert-hash sha256:feed \\\n\t\
         --control-plane --certificate-key c0ffee\n\n\
         Then you can join any number of worker nodes by running:\n\n\
         kubeadm join {api} --token {token} \\\n\t\
         --discovery-token-ca-cert-hash sha256:feed\n"
    )
}

/// Per-agent filesystem root for provider writes.
pub fn temp_root(node_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("fleet-it-{node_id}-{}", new_id()))
}

pub fn linux_provider(runner: Arc<ScriptedRunner>, root: PathBuf) -> Arc<dyn CapabilityProvider> {
    Arc::new(LinuxProvider::new(
        Platform::new("rocky", "9"),
        PackageManager::Dnf,
        runner,
        ProviderSettings {
            retry: RetryPolicy {
                attempts: 5,
                backoff: Duration::from_millis(10),
            },
            command_timeout: None,
            root,
        },
    ))
}

pub fn node(id: &str, ip: &str, role: NodeRole) -> Node {
    Node {
        id: id.into(),
        name: format!("{id}-host"),
        ip: ip.into(),
        role,
        status: String::new(),
        agent_status: AgentStatus::Running,
    }
}

pub fn cluster(nodes: Vec<Node>) -> Cluster {
    Cluster {
        id: "c1".into(),
        name: "prod".into(),
        version: "v1.30.2".into(),
        spec: ClusterSpec::default(),
        nodes,
    }
}

pub fn request(operation_type: OperationType, cluster: Cluster) -> OperationRequest {
    OperationRequest {
        name: format!("{operation_type:?}"),
        operation_type,
        cluster,
        parameters: Default::default(),
    }
}

pub fn run_command(node_id: &str, commands: &[&str]) -> OneTask {
    OneTask {
        node_id: node_id.to_string(),
        task: Task::RunCommand(RunCommandTask {
            meta: TaskMeta::create(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            ignore_errors: false,
        }),
    }
}

/// One single-task NodeStep, for hand-built Steps.
pub struct OneTask {
    pub node_id: String,
    pub task: Task,
}

pub fn step(name: &str, node_steps: Vec<OneTask>) -> Step {
    Step::new(name).with_node_steps(
        node_steps
            .into_iter()
            .map(|s| fleet_services::NodeStep::new(name, s.node_id, vec![s.task]))
            .collect(),
    )
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Engine, store and agents sharing one in-process bus.
pub struct Fleet {
    pub bus: LocalBus,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<Engine>,
    pub cache: RuntimeCache,
    pub stop: broadcast::Sender<()>,
}

impl Fleet {
    pub async fn start(node_step_timeout: Duration) -> Self {
        Self::on_bus(LocalBus::new(), node_step_timeout).await
    }

    pub async fn on_bus(bus: LocalBus, node_step_timeout: Duration) -> Self {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(
            EngineSettings {
                host: "it".into(),
                node_step_timeout,
                max_parallel_node_steps: 0,
                resource_server_url: "http://127.0.0.1:9000".into(),
            },
            Arc::new(bus.clone()),
            store.clone(),
        );
        engine.start().await.unwrap();
        let (stop, _) = broadcast::channel(1);
        Self {
            bus,
            store,
            engine,
            cache: RuntimeCache::new(),
            stop,
        }
    }

    /// Start a dispatcher for `node_id` on `bus` and wait until it listens
    /// on the hub side.
    pub async fn agent_on(
        &self,
        bus: Arc<dyn Bus>,
        node_id: &str,
        provider: Result<Arc<dyn CapabilityProvider>, ProviderError>,
    ) {
        self.cache.set_client_runtime_config(ClientRuntimeConfig {
            node_id: node_id.to_string(),
            group: GROUP.to_string(),
            work_dir: temp_root(node_id),
            command_timeout: None,
            kubeadm_attempts: 5,
            kubeadm_backoff: Duration::from_millis(10),
        });
        let dispatcher = Dispatcher::new(
            node_id,
            GROUP,
            bus,
            provider,
            self.cache.clone(),
            self.stop.clone(),
        );
        tokio::spawn(dispatcher.run(Duration::from_secs(1)));

        let subject = subjects::node(node_id);
        eventually(&format!("agent {node_id}"), || {
            self.bus.subscriber_count(&subject) > 0
        })
        .await;
    }

    pub async fn agent(
        &self,
        node_id: &str,
        provider: Result<Arc<dyn CapabilityProvider>, ProviderError>,
    ) {
        self.agent_on(Arc::new(self.bus.clone()), node_id, provider)
            .await;
    }

    /// Linux agent over `runner`. Returns its filesystem root.
    pub async fn linux_agent(&self, node_id: &str, runner: Arc<ScriptedRunner>) -> PathBuf {
        let root = temp_root(node_id);
        self.agent(node_id, Ok(linux_provider(runner, root.clone())))
            .await;
        root
    }

    /// Plan `request`, run it to the end and return the final record.
    pub async fn run(&self, request: OperationRequest) -> Operation {
        let steps = plan(&request).unwrap();
        self.run_steps(request, steps).await
    }

    pub async fn run_steps(&self, request: OperationRequest, steps: Vec<Step>) -> Operation {
        let (_, handle) = self.submit(request, steps);
        tokio::time::timeout(Duration::from_secs(20), handle)
            .await
            .expect("operation did not finish")
            .unwrap()
    }

    /// Start `steps` for `request`. Returns the Operation id and its handle.
    pub fn submit(
        &self,
        request: OperationRequest,
        steps: Vec<Step>,
    ) -> (String, tokio::task::JoinHandle<Operation>) {
        self.store.save_cluster(&request.cluster).unwrap();
        let op = Operation::new(
            request.name,
            request.operation_type,
            request.cluster.id.clone(),
            request.parameters,
        );
        let id = op.id.clone();
        (id, self.engine.submit(op, request.cluster, steps).unwrap())
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        self.engine.shutdown();
    }
}

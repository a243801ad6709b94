//! Orchestration engine.
//!
//! An Operation is a sequence of Steps. Each Step fans out into NodeSteps, one
//! per target node, and each NodeStep sends its tasks to the node's agent one
//! at a time. Every Operation is driven by its own task; only that task
//! mutates the Operation, and every change is written through the store.

pub mod plans;
pub mod policy;
mod replies;
mod round;
pub mod step;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use fleet_core::envelope::subjects;
use fleet_core::model::short;
use fleet_core::{Cluster, EngineError, Operation, OperationStatus, StepState, StepStatus};

use crate::bus::Bus;
use crate::runtime_cache::ServerRuntimeConfig;
use crate::store::Store;

pub use plans::plan;
pub use policy::{StepDecision, StepPolicy, StrictPolicy, TimeoutDecision, TolerantPolicy};
pub use replies::ReplyRouter;
pub use step::{NodeStep, Step};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Identity of this engine instance; recorded on every Operation it drives.
    pub host: String,
    /// Reply budget for NodeSteps that do not set their own.
    pub node_step_timeout: Duration,
    /// 0 = unbounded.
    pub max_parallel_node_steps: usize,
    pub resource_server_url: String,
}

impl From<&ServerRuntimeConfig> for EngineSettings {
    fn from(cfg: &ServerRuntimeConfig) -> Self {
        Self {
            host: cfg.host.clone(),
            node_step_timeout: cfg.node_step_timeout,
            max_parallel_node_steps: cfg.max_parallel_node_steps,
            resource_server_url: cfg.resource_server_url.clone(),
        }
    }
}

pub struct Engine {
    settings: EngineSettings,
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
    replies: ReplyRouter,
    /// Cancel switch per running Operation.
    running: DashMap<String, watch::Sender<bool>>,
    inbox: String,
    routers: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(settings: EngineSettings, bus: Arc<dyn Bus>, store: Arc<dyn Store>) -> Arc<Self> {
        let inbox = subjects::inbox(&format!("engine.{}", settings.host));
        Arc::new(Self {
            settings,
            bus,
            store,
            replies: ReplyRouter::default(),
            running: DashMap::new(),
            inbox,
            routers: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Subject agents reply to for synchronous tasks.
    pub fn inbox(&self) -> &str {
        &self.inbox
    }

    /// Subscribe to reply subjects. Must run before the first `submit`.
    pub async fn start(&self) -> Result<(), EngineError> {
        let direct = self
            .bus
            .subscribe(&self.inbox, None)
            .await
            .map_err(|e| EngineError::Bus(e.to_string()))?;
        let shared = self
            .bus
            .subscribe(subjects::REPLIES, None)
            .await
            .map_err(|e| EngineError::Bus(e.to_string()))?;

        let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers.push(tokio::spawn(self.replies.clone().serve(direct)));
        routers.push(tokio::spawn(self.replies.clone().serve(shared)));
        tracing::info!(host = %self.settings.host, inbox = %self.inbox, "engine started");
        Ok(())
    }

    /// Start driving `op` over `steps`. The handle resolves to the final
    /// Operation record.
    pub fn submit(
        self: &Arc<Self>,
        mut op: Operation,
        cluster: Cluster,
        steps: Vec<Step>,
    ) -> Result<JoinHandle<Operation>, EngineError> {
        if steps.is_empty() {
            return Err(EngineError::EmptyPlan);
        }
        if !op.host.is_empty() && op.host != self.settings.host {
            return Err(EngineError::ForeignHost {
                id: op.id,
                host: op.host,
            });
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        match self.running.entry(op.id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyRunning(op.id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel_tx);
            }
        }

        op.host = self.settings.host.clone();
        op.steps = steps.iter().map(|s| StepState::new(&s.name)).collect();
        op.touch();
        self.persist(&op);

        let this = self.clone();
        Ok(tokio::spawn(async move {
            let id = op.id.clone();
            let op = this.clone().drive(op, cluster, steps, cancel_rx).await;
            this.running.remove(&id);
            op
        }))
    }

    /// Stop dispatching for a running Operation. `false` when it is not
    /// running here.
    pub fn cancel(&self, operation_id: &str) -> bool {
        match self.running.get(operation_id) {
            Some(tx) => {
                tx.send_replace(true);
                tracing::info!(operation_id = short(operation_id), "cancel requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, operation_id: &str) -> bool {
        self.running.contains_key(operation_id)
    }

    /// Cancel every running Operation and stop routing replies.
    pub fn shutdown(&self) {
        for entry in self.running.iter() {
            entry.value().send_replace(true);
        }
        let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        for handle in routers.drain(..) {
            handle.abort();
        }
    }

    fn persist(&self, op: &Operation) {
        if let Err(e) = self.store.save_operation(op) {
            tracing::warn!(operation_id = short(&op.id), error = %e, "failed to persist operation");
        }
    }

    async fn drive(
        self: Arc<Self>,
        mut op: Operation,
        cluster: Cluster,
        steps: Vec<Step>,
        mut cancel: watch::Receiver<bool>,
    ) -> Operation {
        let cluster = Arc::new(cluster);
        op.status = op.operation_type.running_status();
        op.touch();
        self.persist(&op);
        tracing::info!(
            operation_id = short(&op.id),
            operation_type = ?op.operation_type,
            steps = steps.len(),
            "operation started"
        );

        match self.run_steps(&mut op, &cluster, &steps, &mut cancel).await {
            Ok(()) => {
                op.status = OperationStatus::Successful;
                op.message.clear();
                tracing::info!(operation_id = short(&op.id), "operation successful");
            }
            Err(e) => {
                op.status = OperationStatus::Error;
                op.message = e.to_string();
                collect_issues(&mut op);
                tracing::warn!(operation_id = short(&op.id), error = %e, "operation failed");
            }
        }
        op.touch();
        self.persist(&op);
        op
    }

    async fn run_steps(
        self: &Arc<Self>,
        op: &mut Operation,
        cluster: &Arc<Cluster>,
        steps: &[Step],
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        for (index, step) in steps.iter().enumerate() {
            if *cancel.borrow() {
                return Err(EngineError::Cancelled);
            }
            op.advance_to(index);
            op.steps[index].status = StepStatus::Running;
            self.persist(op);
            tracing::info!(operation_id = short(&op.id), step = %step.name, index, "step started");

            if !step.wait_before_run.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(step.wait_before_run) => {}
                    _ = cancelled(cancel) => return Err(EngineError::Cancelled),
                }
            }

            let node_steps = match &step.dynamic_node_steps {
                None => step.node_steps.clone(),
                Some(build) => match build(&op.pre_step_return_data, &**cluster, &*op) {
                    Ok(node_steps) => node_steps,
                    Err(reason) if step.ignore_dynamic_error => {
                        tracing::warn!(
                            operation_id = short(&op.id),
                            step = %step.name,
                            %reason,
                            "skipping step"
                        );
                        op.steps[index].status = StepStatus::Skipped;
                        self.persist(op);
                        continue;
                    }
                    Err(reason) => {
                        op.steps[index].status = StepStatus::Error;
                        return Err(EngineError::DynamicStep {
                            step: step.name.clone(),
                            reason,
                        });
                    }
                },
            };

            let policy = step
                .policy
                .clone()
                .unwrap_or_else(|| policy::default_for(op.operation_type));
            match self
                .run_step(op, index, cluster, step, node_steps, policy.as_ref(), cancel)
                .await
            {
                Ok(()) => {
                    op.steps[index].status = StepStatus::Successful;
                    op.touch();
                    self.persist(op);
                }
                Err(e) => {
                    op.steps[index].status = StepStatus::Error;
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

/// Resolves once cancel is requested. Never resolves if the switch is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Copy the failing Step's per-node outcomes into `issues`.
fn collect_issues(op: &mut Operation) {
    let Some(state) = op.steps.get(op.current_step) else {
        return;
    };
    let mut issues = std::collections::BTreeMap::new();
    for (node, msg) in &state.on_failed_nodes {
        issues.insert(node.clone(), msg.clone());
    }
    for node in &state.on_timeout_nodes {
        issues.insert(node.clone(), "timed out".to_string());
    }
    for node in &state.unreachable_nodes {
        issues.insert(node.clone(), "unreachable".to_string());
    }
    op.issues.extend(issues);
}

//! Dispatch of one Step: concurrent NodeSteps, policy hooks, retries.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use fleet_core::envelope::subjects;
use fleet_core::model::short;
use fleet_core::{
    AgentStatus, Cluster, Disposition, EngineError, Operation, QueueBody, ReturnData,
};

use super::policy::{StepDecision, StepPolicy, TimeoutDecision};
use super::step::{NodeStep, Step};
use super::{cancelled, Engine};
use crate::bus::BusMessage;

/// How one NodeStep ended, before classification.
#[derive(Debug)]
enum Outcome {
    Succeeded(ReturnData),
    Failed(String),
    TimedOut,
    Unreachable,
    NotDispatched,
}

/// What every NodeStep of a round sends along with its tasks.
struct RoundContext {
    operation_id: String,
    cluster: Arc<Cluster>,
    return_data: ReturnData,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn run_step(
        self: &Arc<Self>,
        op: &mut Operation,
        index: usize,
        cluster: &Arc<Cluster>,
        step: &Step,
        node_steps: Vec<NodeStep>,
        policy: &dyn StepPolicy,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let total = node_steps.len();
        let mut round = node_steps;
        loop {
            op.steps[index].attempts += 1;
            let results = self
                .dispatch_round(op, index, cluster, step, &round, policy, cancel)
                .await?;

            // Declaration order; later NodeSteps overwrite earlier keys.
            for data in results.into_iter().flatten() {
                op.pre_step_return_data.extend(data);
            }
            op.touch();
            self.persist(op);

            let state = &op.steps[index];
            match policy.on_complete(state, total, step.max_retries) {
                StepDecision::Proceed => return Ok(()),
                StepDecision::Retry => {
                    let retry: BTreeSet<String> = state.retryable_nodes();
                    round = round
                        .iter()
                        .filter(|ns| retry.contains(&ns.node_id))
                        .map(NodeStep::renewed)
                        .collect();
                    tracing::info!(
                        operation_id = short(&op.id),
                        step = %step.name,
                        attempt = state.attempts + 1,
                        nodes = round.len(),
                        "retrying step"
                    );
                    if round.is_empty() {
                        return Err(EngineError::PolicyAbort {
                            step: step.name.clone(),
                            reason: "nothing left to retry".into(),
                        });
                    }
                }
                StepDecision::Abort(reason) => {
                    return Err(EngineError::PolicyAbort {
                        step: step.name.clone(),
                        reason,
                    });
                }
            }
        }
    }

    /// Run every NodeStep in `round` until each one is classified. Returns the
    /// successful NodeSteps' data, indexed like `round`.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_round(
        self: &Arc<Self>,
        op: &mut Operation,
        index: usize,
        cluster: &Arc<Cluster>,
        step: &Step,
        round: &[NodeStep],
        policy: &dyn StepPolicy,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Vec<Option<ReturnData>>, EngineError> {
        let n = round.len();
        let mut results: Vec<Option<ReturnData>> = vec![None; n];
        if n == 0 {
            return Ok(results);
        }

        let ctx = Arc::new(RoundContext {
            operation_id: op.id.clone(),
            cluster: cluster.clone(),
            return_data: op.pre_step_return_data.clone(),
        });
        let limit = match self.settings.max_parallel_node_steps {
            0 => n,
            limit => limit,
        };
        let permits = Arc::new(Semaphore::new(limit));
        let dispatched: Arc<Vec<AtomicBool>> =
            Arc::new((0..n).map(|_| AtomicBool::new(false)).collect());
        let (halt_tx, halt_rx) = watch::channel(false);
        let (done_tx, mut done_rx) =
            mpsc::unbounded_channel::<(usize, Outcome, Option<OwnedSemaphorePermit>)>();
        let mut workers = JoinSet::new();

        for (i, ns) in round.iter().enumerate() {
            if step.skip_unreachable && self.is_unreachable(&ns.node_id) {
                let _ = done_tx.send((i, Outcome::Unreachable, None));
                continue;
            }
            let this = self.clone();
            let ns = ns.clone();
            let ctx = ctx.clone();
            let permits = permits.clone();
            let dispatched = dispatched.clone();
            let mut halt = halt_rx.clone();
            let done = done_tx.clone();
            workers.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = halt.wait_for(|h| *h) => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let outcome = match permit {
                    Some(_) if !*halt.borrow() => {
                        dispatched[i].store(true, Ordering::SeqCst);
                        this.execute_node_step(&ns, &ctx).await
                    }
                    _ => Outcome::NotDispatched,
                };
                // The permit travels with the outcome so the next NodeStep
                // starts only after this one has been classified.
                let _ = done.send((i, outcome, permit));
            });
        }
        drop(done_tx);

        let mut settled = vec![false; n];
        let mut remaining = n;
        let mut consecutive_timeouts = 0u32;
        let mut halted = false;

        while remaining > 0 {
            tokio::select! {
                received = done_rx.recv() => {
                    let Some((i, outcome, permit)) = received else { break };
                    remaining -= 1;
                    settled[i] = true;
                    let node_id = round[i].node_id.as_str();

                    let disposition = match outcome {
                        Outcome::Succeeded(data) => {
                            results[i] = Some(data);
                            Disposition::Succeeded
                        }
                        Outcome::Failed(msg) => Disposition::Failed(msg),
                        Outcome::TimedOut => Disposition::TimedOut,
                        Outcome::Unreachable => Disposition::Unreachable,
                        Outcome::NotDispatched => Disposition::Failed("not dispatched".into()),
                    };
                    log_disposition(&op.id, &step.name, &round[i], &disposition);
                    let timed_out = disposition == Disposition::TimedOut;
                    op.steps[index].classify(node_id, disposition);
                    op.touch();
                    self.persist(op);

                    if timed_out {
                        consecutive_timeouts += 1;
                        if policy.on_timeout(&op.steps[index], consecutive_timeouts)
                            == TimeoutDecision::Finalize
                        {
                            let _ = halt_tx.send(true);
                            workers.abort_all();
                            for (j, other) in round.iter().enumerate() {
                                if settled[j] {
                                    continue;
                                }
                                let disposition = if dispatched[j].load(Ordering::SeqCst) {
                                    Disposition::TimedOut
                                } else {
                                    Disposition::Failed("not dispatched".into())
                                };
                                op.steps[index].classify(&other.node_id, disposition);
                            }
                            self.persist(op);
                            tracing::warn!(
                                operation_id = short(&op.id),
                                step = %step.name,
                                consecutive_timeouts,
                                "finalized step after timeouts"
                            );
                            break;
                        }
                    } else {
                        consecutive_timeouts = 0;
                    }

                    if !halted && policy.on_node_settled(&op.steps[index], node_id) {
                        halted = true;
                        let _ = halt_tx.send(true);
                        tracing::warn!(
                            operation_id = short(&op.id),
                            step = %step.name,
                            node_id = %node_id,
                            "stopping dispatch for step"
                        );
                    }
                    drop(permit);
                }
                _ = cancelled(cancel) => {
                    let _ = halt_tx.send(true);
                    workers.abort_all();
                    for (j, other) in round.iter().enumerate() {
                        if !settled[j] {
                            op.steps[index]
                                .classify(&other.node_id, Disposition::Failed("cancelled".into()));
                        }
                    }
                    op.touch();
                    self.persist(op);
                    return Err(EngineError::Cancelled);
                }
            }
        }

        workers.abort_all();
        Ok(results)
    }

    fn is_unreachable(&self, node_id: &str) -> bool {
        self.store
            .node(node_id)
            .is_some_and(|n| n.agent_status == AgentStatus::Unreachable)
    }

    /// Send the NodeStep's tasks in order, each after the previous one's
    /// successful reply, within one deadline.
    async fn execute_node_step(&self, ns: &NodeStep, ctx: &RoundContext) -> Outcome {
        let mut pending = self.replies.register(&ns.id);
        let budget = ns
            .server_msg_timeout
            .unwrap_or(self.settings.node_step_timeout);
        let deadline = Instant::now() + budget;
        let mut data = ReturnData::new();

        for (t, task) in ns.tasks.iter().enumerate() {
            pending.discard_stale();
            let body = match QueueBody::new(
                ctx.operation_id.as_str(),
                ns.id.as_str(),
                (*ctx.cluster).clone(),
                task,
            ) {
                Ok(body) => body
                    .with_task_index(t)
                    .with_resource_server(self.settings.resource_server_url.as_str())
                    .with_return_data(ctx.return_data.clone()),
                Err(e) => return Outcome::Failed(e.to_string()),
            };
            let payload = match body.to_bytes() {
                Ok(p) => p,
                Err(e) => return Outcome::Failed(e.to_string()),
            };
            let msg = BusMessage::new(subjects::node(&ns.node_id), payload)
                .with_reply_to(self.inbox.as_str());
            if let Err(e) = self.bus.publish(msg).await {
                return Outcome::Failed(format!("dispatch failed: {e}"));
            }
            tracing::debug!(
                node_id = %ns.node_id,
                node_step_id = short(&ns.id),
                task = t,
                task_type = task.task_type(),
                "task dispatched"
            );

            let reply = loop {
                match tokio::time::timeout_at(deadline, pending.recv()).await {
                    Err(_) => return Outcome::TimedOut,
                    Ok(None) => return Outcome::Failed("reply channel closed".into()),
                    Ok(Some(reply)) if reply.task_index == t => break reply,
                    // Redelivery of an earlier task's reply.
                    Ok(Some(reply)) => tracing::debug!(
                        node_step_id = short(&ns.id),
                        expected = t,
                        got = reply.task_index,
                        "dropping reply for another task"
                    ),
                }
            };
            if !reply.is_success() {
                return Outcome::Failed(reply.message);
            }
            data.extend(reply.return_data);
        }
        Outcome::Succeeded(data)
    }
}

fn log_disposition(operation_id: &str, step: &str, ns: &NodeStep, disposition: &Disposition) {
    match disposition {
        Disposition::Succeeded => tracing::debug!(
            operation_id = short(operation_id),
            step,
            node_id = %ns.node_id,
            node_step_id = short(&ns.id),
            "node step succeeded"
        ),
        Disposition::Failed(msg) => tracing::warn!(
            operation_id = short(operation_id),
            step,
            node_id = %ns.node_id,
            node_step_id = short(&ns.id),
            error = %msg,
            "node step failed"
        ),
        Disposition::TimedOut => tracing::warn!(
            operation_id = short(operation_id),
            step,
            node_id = %ns.node_id,
            node_step_id = short(&ns.id),
            "node step timed out"
        ),
        Disposition::Unreachable => tracing::warn!(
            operation_id = short(operation_id),
            step,
            node_id = %ns.node_id,
            "node unreachable, not dispatched"
        ),
    }
}

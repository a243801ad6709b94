//! Node agent dispatcher.
//!
//! Listens on the agent's own subject and on its group subject, decodes each
//! envelope, routes the task to the capability provider and publishes exactly
//! one reply per envelope. Every message is handled on its own task.
//! Detached tasks reply from a background task on the well-known reply
//! subject; everything else replies on the request's `reply_to`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinSet;

use fleet_core::envelope::subjects;
use fleet_core::model::short;
use fleet_core::{Correlation, Execution, ProviderError, QueueBody, QueueReply, Task};

use crate::bus::{Bus, BusMessage};
use crate::provider::{self, CapabilityProvider, TaskContext};
use crate::runtime_cache::RuntimeCache;

/// What the handler did with one envelope.
#[derive(Debug)]
pub enum Disposition {
    /// Send this reply now.
    Reply(QueueReply),
    /// A background task owns the reply.
    Detached,
}

pub struct Dispatcher {
    node_id: String,
    group: String,
    bus: Arc<dyn Bus>,
    /// The resolved provider, or why there is none.
    provider: Result<Arc<dyn CapabilityProvider>, String>,
    cache: RuntimeCache,
    stop: broadcast::Sender<()>,
}

impl Dispatcher {
    pub fn new(
        node_id: impl Into<String>,
        group: impl Into<String>,
        bus: Arc<dyn Bus>,
        provider: Result<Arc<dyn CapabilityProvider>, ProviderError>,
        cache: RuntimeCache,
        stop: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: node_id.into(),
            group: group.into(),
            bus,
            provider: provider.map_err(|e| e.to_string()),
            cache,
            stop,
        })
    }

    /// Serve until the stop signal fires or the bus goes away. In-flight
    /// handlers get `grace` to finish before being aborted.
    pub async fn run(self: Arc<Self>, grace: Duration) -> anyhow::Result<()> {
        let mut stop = self.stop.subscribe();
        let mut direct = self
            .bus
            .subscribe(&subjects::node(&self.node_id), None)
            .await?;
        let mut shared = self
            .bus
            .subscribe(&subjects::group(&self.group), Some(&self.group))
            .await?;
        tracing::info!(node_id = %self.node_id, group = %self.group, "dispatcher listening");

        let mut inflight = JoinSet::new();
        let stopped = loop {
            let msg = tokio::select! {
                _ = stop.recv() => break true,
                msg = direct.next() => msg,
                msg = shared.next() => msg,
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "task handler panicked");
                    }
                    continue;
                }
            };
            let Some(msg) = msg else {
                break false;
            };
            let this = self.clone();
            inflight.spawn(async move { this.on_message(msg).await });
        };

        drop(direct);
        drop(shared);
        if !inflight.is_empty() {
            tracing::info!(count = inflight.len(), "waiting for in-flight tasks");
            let drained = tokio::time::timeout(grace, async {
                while inflight.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                tracing::warn!(count = inflight.len(), "grace period over, aborting tasks");
                inflight.abort_all();
            }
        }

        if stopped {
            tracing::info!("dispatcher stopped");
            Ok(())
        } else {
            anyhow::bail!("bus subscription closed")
        }
    }

    async fn on_message(self: Arc<Self>, msg: BusMessage) {
        if let Disposition::Reply(reply) = self.handle(&msg.payload).await {
            let subject = msg.reply_to.as_deref().unwrap_or(subjects::REPLIES);
            self.publish_reply(subject, &reply).await;
        }
    }

    /// Decode, route and execute one raw envelope.
    pub async fn handle(self: &Arc<Self>, raw: &[u8]) -> Disposition {
        let body = match QueueBody::from_bytes(raw) {
            Ok(body) => body,
            Err(e) => {
                let corr = Correlation::recover(raw, &self.node_id);
                tracing::warn!(operation_id = short(&corr.operation_id), error = %e, "undecodable envelope");
                return Disposition::Reply(QueueReply::error(&corr, e.to_string()));
            }
        };
        let corr = Correlation::of(&body, &self.node_id);

        let task = match body.decode_task() {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(
                    operation_id = short(&corr.operation_id),
                    node_step_id = short(&corr.node_step_id),
                    task_type = %body.task_type,
                    error = %e,
                    "task rejected"
                );
                return Disposition::Reply(QueueReply::error(&corr, e.to_string()));
            }
        };

        if let Err(reason) = &self.provider {
            return Disposition::Reply(QueueReply::error(&corr, reason.clone()));
        }

        tracing::debug!(
            operation_id = short(&corr.operation_id),
            node_step_id = short(&corr.node_step_id),
            task_type = task.task_type(),
            "task received"
        );

        match task.execution() {
            Execution::Sync => Disposition::Reply(self.execute(&body, &task, &corr).await),
            Execution::Detached => {
                let this = Arc::clone(self);
                let mut stop = self.stop.subscribe();
                tokio::spawn(async move {
                    let reply = tokio::select! {
                        reply = this.execute(&body, &task, &corr) => reply,
                        _ = stop.recv() => QueueReply::error(&corr, "agent shutting down"),
                    };
                    this.publish_reply(subjects::REPLIES, &reply).await;
                });
                Disposition::Detached
            }
        }
    }

    async fn execute(&self, body: &QueueBody, task: &Task, corr: &Correlation) -> QueueReply {
        let provider = match &self.provider {
            Ok(p) => p.clone(),
            Err(reason) => return QueueReply::error(corr, reason.clone()),
        };
        let Some(runtime) = self.cache.client_runtime_config(&self.node_id) else {
            return QueueReply::error(
                corr,
                format!("no runtime configuration for node {}", self.node_id),
            );
        };
        let ctx = TaskContext {
            node_id: self.node_id.clone(),
            cluster: Arc::new(body.clusters.clone()),
            resource_server_url: body.resource_server_url.clone(),
            step_return_data: body.step_return_data.clone(),
            runtime,
        };

        let started = Instant::now();
        let call = provider::invoke(provider.as_ref(), &ctx, task);
        let result = match task.meta().timeout() {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(ProviderError::CommandTimeout {
                    command: task.task_type().to_string(),
                    secs: limit.as_secs(),
                })
            }),
            None => call.await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(data) => {
                tracing::info!(
                    operation_id = short(&corr.operation_id),
                    node_step_id = short(&corr.node_step_id),
                    task_type = task.task_type(),
                    elapsed_ms,
                    "task succeeded"
                );
                QueueReply::successful(corr, data)
            }
            Err(e) => {
                tracing::warn!(
                    operation_id = short(&corr.operation_id),
                    node_step_id = short(&corr.node_step_id),
                    task_type = task.task_type(),
                    elapsed_ms,
                    error = %e,
                    "task failed"
                );
                QueueReply::error(corr, e.to_string())
            }
        }
    }

    async fn publish_reply(&self, subject: &str, reply: &QueueReply) {
        let payload = match reply.to_bytes() {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.bus.publish(BusMessage::new(subject, payload)).await {
            tracing::warn!(
                %subject,
                node_step_id = short(&reply.node_step_id),
                error = %e,
                "failed to publish reply"
            );
        }
    }
}

//! Routes agent replies to the NodeStep waiting for them, by `node_step_id`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use fleet_core::model::short;
use fleet_core::QueueReply;

use crate::bus::Subscription;

#[derive(Clone, Default)]
pub struct ReplyRouter {
    pending: Arc<DashMap<String, mpsc::UnboundedSender<QueueReply>>>,
}

/// Replies for one NodeStep. Dropping it stops routing to that id.
pub struct PendingReplies {
    node_step_id: String,
    rx: mpsc::UnboundedReceiver<QueueReply>,
    router: ReplyRouter,
}

impl ReplyRouter {
    pub fn register(&self, node_step_id: &str) -> PendingReplies {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(node_step_id.to_string(), tx);
        PendingReplies {
            node_step_id: node_step_id.to_string(),
            rx,
            router: self.clone(),
        }
    }

    /// Hand a reply to its waiter. `false` when nobody is waiting.
    pub fn route(&self, reply: QueueReply) -> bool {
        match self.pending.get(&reply.node_step_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    pub fn waiting(&self) -> usize {
        self.pending.len()
    }

    /// Feed every reply arriving on `sub` into the router.
    pub async fn serve(self, mut sub: Subscription) {
        while let Some(msg) = sub.next().await {
            let reply = match QueueReply::from_bytes(&msg.payload) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(subject = %msg.subject, error = %e, "malformed reply");
                    continue;
                }
            };
            let operation_id = reply.operation_id.clone();
            let node_step_id = reply.node_step_id.clone();
            if !self.route(reply) {
                tracing::debug!(
                    operation_id = short(&operation_id),
                    node_step_id = short(&node_step_id),
                    "discarding reply with no waiter"
                );
            }
        }
    }
}

impl PendingReplies {
    pub async fn recv(&mut self) -> Option<QueueReply> {
        self.rx.recv().await
    }

    /// Drop replies that arrived before the next task was sent, such as
    /// redeliveries of an earlier one.
    pub fn discard_stale(&mut self) {
        while let Ok(reply) = self.rx.try_recv() {
            tracing::debug!(node_step_id = short(&reply.node_step_id), "dropping stale reply");
        }
    }
}

impl Drop for PendingReplies {
    fn drop(&mut self) {
        self.router.pending.remove(&self.node_step_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::Correlation;

    fn reply(node_step_id: &str) -> QueueReply {
        QueueReply::successful(
            &Correlation {
                operation_id: "op".into(),
                node_id: "n1".into(),
                node_step_id: node_step_id.into(),
                task_index: 0,
            },
            Default::default(),
        )
    }

    #[tokio::test]
    async fn routes_by_node_step_id_and_drops_after_release() {
        let router = ReplyRouter::default();
        let mut pending = router.register("ns-1");

        assert!(router.route(reply("ns-1")));
        assert!(!router.route(reply("ns-2")));
        assert_eq!(pending.recv().await.unwrap().node_step_id, "ns-1");

        drop(pending);
        assert_eq!(router.waiting(), 0);
        assert!(!router.route(reply("ns-1")));
    }
}

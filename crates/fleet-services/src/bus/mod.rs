//! Message bus abstraction.
//!
//! Subjects are plain strings. A subscriber either receives every message on
//! its subject or, when it joins a queue group, shares the subject's traffic
//! with the other members of that group so each message reaches exactly one
//! of them. Request/reply is built on top: the requester publishes with a
//! `reply_to` inbox and waits on it.
//!
//! Implementations must be safe to share between tasks without extra locking.

mod local;
mod tcp;

pub use local::LocalBus;
pub use tcp::{serve_hub, TcpBus};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use fleet_core::envelope::subjects;
use fleet_core::model::new_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

impl BusMessage {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            reply_to: None,
            payload: payload.into(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus connection closed")]
    Closed,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("bus io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, msg: BusMessage) -> Result<(), BusError>;

    /// Subscribe to `subject`, optionally as a member of `queue_group`.
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, BusError>;
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<BusMessage>,
    _guard: Box<dyn Send + Sync>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<BusMessage>,
        guard: impl Send + Sync + 'static,
    ) -> Self {
        Self {
            rx,
            _guard: Box::new(guard),
        }
    }

    /// Next message, or `None` once the bus side has gone away.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Publish `payload` on `subject` and wait for a single reply.
pub async fn request(
    bus: &dyn Bus,
    subject: &str,
    payload: impl Into<Bytes>,
    timeout: Duration,
) -> Result<BusMessage, BusError> {
    let inbox = subjects::inbox(&new_id());
    let mut sub = bus.subscribe(&inbox, None).await?;
    bus.publish(BusMessage::new(subject, payload).with_reply_to(inbox))
        .await?;
    tokio::time::timeout(timeout, sub.next())
        .await
        .map_err(|_| BusError::Timeout(timeout))?
        .ok_or(BusError::Closed)
}

//! In-process bus. Also the routing core of the TCP hub.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{Bus, BusError, BusMessage, Subscription};

struct Subscriber {
    id: u64,
    group: Option<String>,
    tx: mpsc::UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct Inner {
    /// subject → subscribers
    subjects: DashMap<String, Vec<Subscriber>>,
    next_id: AtomicU64,
    /// Round-robin cursor for queue-group delivery.
    cursor: AtomicUsize,
}

/// Subject-routed bus living in one process.
#[derive(Clone, Default)]
pub struct LocalBus {
    inner: Arc<Inner>,
}

struct Unsubscribe {
    inner: Weak<Inner>,
    subject: String,
    id: u64,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut empty = false;
            if let Some(mut subs) = inner.subjects.get_mut(&self.subject) {
                subs.retain(|s| s.id != self.id);
                empty = subs.is_empty();
            }
            if empty {
                inner.subjects.remove_if(&self.subject, |_, subs| subs.is_empty());
            }
        }
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a subject.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.inner
            .subjects
            .get(subject)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn deliver(&self, msg: BusMessage) {
        let Some(mut subs) = self.inner.subjects.get_mut(&msg.subject) else {
            tracing::trace!(subject = %msg.subject, "no subscribers, message dropped");
            return;
        };
        subs.retain(|s| !s.tx.is_closed());

        let mut groups: BTreeMap<&str, Vec<&Subscriber>> = BTreeMap::new();
        for sub in subs.iter() {
            match &sub.group {
                None => {
                    let _ = sub.tx.send(msg.clone());
                }
                Some(group) => groups.entry(group.as_str()).or_default().push(sub),
            }
        }

        for members in groups.values() {
            let pick = self.inner.cursor.fetch_add(1, Ordering::Relaxed) % members.len();
            let _ = members[pick].tx.send(msg.clone());
        }
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, msg: BusMessage) -> Result<(), BusError> {
        self.deliver(msg);
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push(Subscriber {
                id,
                group: queue_group.map(str::to_string),
                tx,
            });
        let guard = Unsubscribe {
            inner: Arc::downgrade(&self.inner),
            subject: subject.to_string(),
            id,
        };
        Ok(Subscription::new(rx, guard))
    }
}

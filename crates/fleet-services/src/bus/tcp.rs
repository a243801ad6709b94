//! TCP bridge so agents on other hosts can reach the orchestrator's bus.
//!
//! The orchestrator runs a hub that owns a [`LocalBus`]; every agent holds
//! one [`TcpBus`] connection to it. Frames are newline-delimited JSON with
//! hex-encoded payloads.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{Bus, BusError, BusMessage, LocalBus, Subscription};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    Sub {
        sid: u64,
        subject: String,
        #[serde(default)]
        group: Option<String>,
    },
    Unsub {
        sid: u64,
    },
    Pub {
        subject: String,
        #[serde(default)]
        reply_to: Option<String>,
        payload: String,
    },
    Msg {
        sid: u64,
        subject: String,
        #[serde(default)]
        reply_to: Option<String>,
        payload: String,
    },
}

fn decode_payload(payload: &str) -> Option<Bytes> {
    hex::decode(payload).ok().map(Bytes::from)
}

async fn write_frames(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode bus frame");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            tracing::debug!(error = %e, "bus connection write failed");
            return;
        }
    }
}

// ── Hub ───────────────────────────────────────────────────────────────────────

/// Accept agent connections and bridge them into `bus` until shutdown.
pub async fn serve_hub(
    listener: TcpListener,
    bus: LocalBus,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "bus hub listening");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("bus hub shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(a) => a,
                    Err(e) => {
                        tracing::warn!(error = %e, "bus hub accept failed");
                        continue;
                    }
                };
                tokio::spawn(handle_connection(stream, peer, bus.clone()));
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, bus: LocalBus) {
    tracing::debug!(%peer, "bus client connected");
    let (reader, writer) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_frames(writer, out_rx));

    // sid → forwarder task; aborting the forwarder drops its subscription.
    let mut forwarders: HashMap<u64, JoinHandle<()>> = HashMap::new();
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "bus client read failed");
                break;
            }
        };
        let frame: Frame = match serde_json::from_str(&line) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed bus frame");
                continue;
            }
        };

        match frame {
            Frame::Sub {
                sid,
                subject,
                group,
            } => {
                let mut sub = match bus.subscribe(&subject, group.as_deref()).await {
                    Ok(sub) => sub,
                    Err(e) => {
                        tracing::warn!(%peer, error = %e, "subscribe failed");
                        continue;
                    }
                };
                let out = out_tx.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(msg) = sub.next().await {
                        let frame = Frame::Msg {
                            sid,
                            subject: msg.subject,
                            reply_to: msg.reply_to,
                            payload: hex::encode(&msg.payload),
                        };
                        if out.send(frame).is_err() {
                            return;
                        }
                    }
                });
                if let Some(old) = forwarders.insert(sid, forwarder) {
                    old.abort();
                }
            }
            Frame::Unsub { sid } => {
                if let Some(forwarder) = forwarders.remove(&sid) {
                    forwarder.abort();
                }
            }
            Frame::Pub {
                subject,
                reply_to,
                payload,
            } => {
                let Some(payload) = decode_payload(&payload) else {
                    tracing::warn!(%peer, %subject, "publish with invalid payload encoding");
                    continue;
                };
                let message = BusMessage {
                    subject: subject.clone(),
                    reply_to,
                    payload,
                };
                if let Err(e) = bus.publish(message).await {
                    tracing::warn!(%peer, %subject, error = %e, "failed to forward publish");
                }
            }
            Frame::Msg { .. } => {
                tracing::warn!(%peer, "client sent a hub-only frame");
            }
        }
    }

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
    drop(out_tx);
    let _ = writer_task.await;
    tracing::debug!(%peer, "bus client disconnected");
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Bus connection to a remote hub.
pub struct TcpBus {
    out: mpsc::UnboundedSender<Frame>,
    subs: Arc<DashMap<u64, mpsc::UnboundedSender<BusMessage>>>,
    next_sid: AtomicU64,
    reader: JoinHandle<()>,
}

struct RemoteUnsubscribe {
    sid: u64,
    out: mpsc::UnboundedSender<Frame>,
    subs: Arc<DashMap<u64, mpsc::UnboundedSender<BusMessage>>>,
}

impl Drop for RemoteUnsubscribe {
    fn drop(&mut self) {
        self.subs.remove(&self.sid);
        let _ = self.out.send(Frame::Unsub { sid: self.sid });
    }
}

impl TcpBus {
    pub async fn connect(addr: &str) -> Result<Self, BusError> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        let (out, out_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_frames(writer, out_rx));

        let subs: Arc<DashMap<u64, mpsc::UnboundedSender<BusMessage>>> = Arc::new(DashMap::new());
        let routes = subs.clone();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(Frame::Msg {
                    sid,
                    subject,
                    reply_to,
                    payload,
                }) = serde_json::from_str::<Frame>(&line)
                else {
                    tracing::warn!("unexpected frame from bus hub");
                    continue;
                };
                let Some(payload) = decode_payload(&payload) else {
                    continue;
                };
                if let Some(tx) = routes.get(&sid) {
                    let _ = tx.send(BusMessage {
                        subject,
                        reply_to,
                        payload,
                    });
                }
            }
            // Closing every subscription tells consumers the connection is gone.
            routes.clear();
            tracing::info!("bus hub connection closed");
        });

        tracing::info!(%addr, "connected to bus hub");
        Ok(Self {
            out,
            subs,
            next_sid: AtomicU64::new(1),
            reader,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.out.is_closed()
    }
}

impl Drop for TcpBus {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Bus for TcpBus {
    async fn publish(&self, msg: BusMessage) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.out
            .send(Frame::Pub {
                subject: msg.subject,
                reply_to: msg.reply_to,
                payload: hex::encode(&msg.payload),
            })
            .map_err(|_| BusError::Closed)
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.insert(sid, tx);
        self.out
            .send(Frame::Sub {
                sid,
                subject: subject.to_string(),
                group: queue_group.map(str::to_string),
            })
            .map_err(|_| BusError::Closed)?;
        let guard = RemoteUnsubscribe {
            sid,
            out: self.out.clone(),
            subs: self.subs.clone(),
        };
        Ok(Subscription::new(rx, guard))
    }
}

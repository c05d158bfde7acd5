//! # Publisher / Subscriber
//!
//! One-way broadcast. A node's [`Publisher`] pushes announcements to every
//! connected subscriber; each [`Subscriber`] belongs to exactly one remote
//! publisher and hands decoded [`Announcement`]s to a callback.
//!
//! Publishing never waits on a subscriber. Every subscriber has a bounded
//! queue; when it is full the message is dropped for that subscriber only.
//! Announcements are idempotent hints (a missed `new_peer_connection` is
//! recovered by the network map exchange), so losing one is harmless.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::messages::Announcement;
use super::transport::{self, log_handshake_failure, Authenticator, TransportError};
use crate::config::{NetworkConfig, SUBSCRIBER_QUEUE_DEPTH};
use crate::crypto::keys::Wallet;

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct Publisher {
    wallet: Arc<Wallet>,
    authenticator: Arc<dyn Authenticator>,
    subscribers: Arc<DashMap<u64, mpsc::Sender<Arc<Vec<u8>>>>>,
    next_subscriber_id: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Publisher {
    pub fn new(wallet: Arc<Wallet>, authenticator: Arc<dyn Authenticator>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            wallet,
            authenticator,
            subscribers: Arc::new(DashMap::new()),
            next_subscriber_id: Arc::new(AtomicU64::new(0)),
            shutdown,
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    pub async fn start(&self, bind_addr: &str) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(addr = %local, "publisher listening");

        let wallet = Arc::clone(&self.wallet);
        let authenticator = Arc::clone(&self.authenticator);
        let subscribers = Arc::clone(&self.subscribers);
        let next_id = Arc::clone(&self.next_subscriber_id);
        let mut shutdown = self.shutdown.subscribe();

        let task = tokio::spawn(async move {
            loop {
                let (stream, addr) = tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "publisher accept failed");
                            continue;
                        }
                    },
                };

                let wallet = Arc::clone(&wallet);
                let authenticator = Arc::clone(&authenticator);
                let subscribers = Arc::clone(&subscribers);
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let session =
                        match transport::accept(stream, &wallet, authenticator.as_ref()).await {
                            Ok(session) => session,
                            Err(err) => {
                                log_handshake_failure(addr, &err);
                                return;
                            }
                        };
                    let mut writer = session.writer;
                    let (tx, mut rx) = mpsc::channel::<Arc<Vec<u8>>>(SUBSCRIBER_QUEUE_DEPTH);
                    subscribers.insert(id, tx);
                    debug!(subscriber = %session.remote_vk, "subscriber attached");

                    loop {
                        // Queued frames go out before shutdown is honoured so
                        // a final `shutdown` announcement isn't lost.
                        let frame = tokio::select! {
                            biased;
                            frame = rx.recv() => frame,
                            _ = shutdown.changed() => break,
                        };
                        let Some(frame) = frame else { break };
                        if let Err(err) = writer.send(&frame).await {
                            debug!(subscriber = %session.remote_vk, error = %err, "subscriber gone");
                            break;
                        }
                    }
                    subscribers.remove(&id);
                });
            }
            debug!("publisher accept loop stopped");
        });
        *self.accept_task.lock() = Some(task);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_started(&self) -> bool {
        self.local_addr.lock().is_some() && !*self.shutdown.borrow()
    }

    /// Broadcast `{"topic": topic, "msg": payload}` to every subscriber.
    pub fn publish(&self, topic: &str, payload: Value) {
        if !self.is_started() {
            warn!(topic, "publisher not started, dropping message");
            return;
        }
        let frame = match serde_json::to_vec(&json!({ "topic": topic, "msg": payload })) {
            Ok(frame) => Arc::new(frame),
            Err(err) => {
                warn!(topic, error = %err, "could not encode publication");
                return;
            }
        };

        let mut closed = Vec::new();
        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&frame)) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(topic, subscriber = *entry.key(), "subscriber queue full, dropping");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }
        for id in closed {
            self.subscribers.remove(&id);
        }
        trace!(topic, subscribers = self.subscribers.len(), "published");
    }

    pub fn announce(&self, announcement: &Announcement) {
        self.publish(announcement.topic(), announcement.payload());
    }

    pub fn announce_new_peer_connection(&self, vk: &str, ip: &str) {
        self.announce(&Announcement::NewPeerConnection {
            vk: vk.to_string(),
            ip: ip.to_string(),
        });
    }

    pub fn announce_shutdown(&self) {
        self.announce(&Announcement::Shutdown);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.subscribers.clear();
    }
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Background consumer of one remote publisher. Reconnects with backoff
/// until stopped.
pub struct Subscriber {
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscriber {
    pub fn spawn<F>(
        address: String,
        wallet: Arc<Wallet>,
        publisher_vk: String,
        config: NetworkConfig,
        on_message: F,
    ) -> Self
    where
        F: Fn(Announcement) + Send + Sync + 'static,
    {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let session = tokio::select! {
                    _ = stop.changed() => return,
                    session = transport::connect(&address, &wallet, &publisher_vk) => session,
                };

                match session {
                    Ok(session) => {
                        attempt = 0;
                        debug!(publisher = %publisher_vk, %address, "subscribed");
                        let mut reader = session.reader;
                        loop {
                            let frame = tokio::select! {
                                _ = stop.changed() => return,
                                frame = reader.recv() => frame,
                            };
                            match frame {
                                Ok(frame) => match Announcement::decode(&frame) {
                                    Some(announcement) => on_message(announcement),
                                    None => debug!(publisher = %publisher_vk, "ignoring unknown publication"),
                                },
                                Err(err) => {
                                    debug!(publisher = %publisher_vk, error = %err, "subscription dropped");
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) => {
                        debug!(publisher = %publisher_vk, %address, error = %err, "subscribe failed");
                    }
                }

                let delay = config.reconnect_backoff(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });

        Self {
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.stop();
    }
}

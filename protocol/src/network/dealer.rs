//! Outbound request channel to one remote router.
//!
//! The connection is opened lazily on the first request and reopened after
//! any failure. Requests are tagged with a fresh `request_id`; a reader task
//! matches replies to waiting callers, so several requests can be in flight
//! on the same connection. Every waiter is tagged with the connection it was
//! sent on; a dying socket only wakes its own waiters.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

use super::messages::REQUEST_ID;
use super::transport;
use crate::config::{NetworkConfig, CONNECTION_QUEUE_DEPTH};
use crate::crypto::keys::Wallet;

/// Waiters by `request_id`, each tagged with its connection id.
type Pending = Arc<DashMap<String, (u64, oneshot::Sender<Value>)>>;

struct DealerConnection {
    id: u64,
    outbound: mpsc::Sender<Value>,
    alive: Arc<AtomicBool>,
}

pub struct Dealer {
    address: RwLock<String>,
    server_vk: String,
    wallet: Arc<Wallet>,
    config: NetworkConfig,
    connection: Mutex<Option<DealerConnection>>,
    pending: Pending,
    next_connection_id: AtomicU64,
}

impl Dealer {
    pub fn new(address: String, server_vk: String, wallet: Arc<Wallet>, config: NetworkConfig) -> Self {
        Self {
            address: RwLock::new(address),
            server_vk,
            wallet,
            config,
            connection: Mutex::new(None),
            pending: Arc::new(DashMap::new()),
            next_connection_id: AtomicU64::new(0),
        }
    }

    pub fn address(&self) -> String {
        self.address.read().clone()
    }

    /// Point at a new address. The current connection is dropped so the next
    /// request dials the new one.
    pub async fn set_address(&self, address: String) {
        *self.address.write() = address;
        self.reset().await;
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Send `msg` and wait for the matching reply. Each attempt gets
    /// `timeout`; `None` once every attempt has failed.
    pub async fn request(&self, msg: &Value, timeout: Duration, attempts: u32) -> Option<Value> {
        let action = msg.get("action").and_then(Value::as_str).unwrap_or("?").to_string();
        for attempt in 0..attempts.max(1) {
            if attempt > 0 {
                tokio::time::sleep(self.config.reconnect_backoff(attempt - 1)).await;
            }
            match self.attempt(msg, timeout).await {
                Some(reply) => return Some(reply),
                None => trace!(peer = %self.server_vk, %action, attempt, "request attempt failed"),
            }
        }
        debug!(peer = %self.server_vk, %action, attempts, "request gave up");
        None
    }

    async fn attempt(&self, msg: &Value, timeout: Duration) -> Option<Value> {
        let request_id = Uuid::new_v4().to_string();
        let mut tagged = msg.clone();
        tagged
            .as_object_mut()?
            .insert(REQUEST_ID.to_string(), Value::String(request_id.clone()));

        let (tx, rx) = oneshot::channel();
        let sent = tokio::time::timeout(timeout, self.send(&request_id, tagged, tx))
            .await
            .ok()
            .flatten();
        let Some(connection_id) = sent else {
            self.pending.remove(&request_id);
            self.reset().await;
            return None;
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Some(reply),
            Ok(Err(_)) => {
                // The reader of this request's socket exited.
                self.reset_connection(connection_id).await;
                None
            }
            Err(_) => {
                self.pending.remove(&request_id);
                None
            }
        }
    }

    /// Register the waiter on the live connection (opening one if needed) and
    /// queue the message. Returns the id of the connection used.
    async fn send(&self, request_id: &str, msg: Value, waiter: oneshot::Sender<Value>) -> Option<u64> {
        let mut guard = self.connection.lock().await;
        let usable = guard
            .as_ref()
            .map_or(false, |conn| conn.alive.load(Ordering::Acquire));
        if !usable {
            *guard = self.open().await;
        }
        let conn = guard.as_ref()?;
        self.pending.insert(request_id.to_string(), (conn.id, waiter));
        if conn.outbound.send(msg).await.is_err() {
            self.pending.remove(request_id);
            return None;
        }
        Some(conn.id)
    }

    async fn open(&self) -> Option<DealerConnection> {
        let address = self.address();
        let session = match transport::connect(&address, &self.wallet, &self.server_vk).await {
            Ok(session) => session,
            Err(err) => {
                debug!(peer = %self.server_vk, %address, error = %err, "dealer connect failed");
                return None;
            }
        };
        let mut reader = session.reader;
        let mut writer = session.writer;
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let alive = Arc::new(AtomicBool::new(true));
        let (outbound, mut rx) = mpsc::channel::<Value>(CONNECTION_QUEUE_DEPTH);

        let writer_alive = Arc::clone(&alive);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if writer.send_json(&msg).await.is_err() {
                    break;
                }
            }
            writer_alive.store(false, Ordering::Release);
        });

        let reader_alive = Arc::clone(&alive);
        let pending = Arc::clone(&self.pending);
        let server_vk = self.server_vk.clone();
        tokio::spawn(async move {
            while reader_alive.load(Ordering::Acquire) {
                let frame = match reader.recv().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        trace!(peer = %server_vk, error = %err, "dealer reader closed");
                        break;
                    }
                };
                let reply: Value = match serde_json::from_slice(&frame) {
                    Ok(reply) => reply,
                    Err(err) => {
                        debug!(peer = %server_vk, error = %err, "dropping malformed reply");
                        continue;
                    }
                };
                let id = reply.get(REQUEST_ID).and_then(Value::as_str).map(str::to_string);
                match id.and_then(|id| pending.remove(&id)) {
                    Some((_, (_, waiter))) => {
                        let _ = waiter.send(reply);
                    }
                    None => trace!(peer = %server_vk, "reply without a waiting request"),
                }
            }
            reader_alive.store(false, Ordering::Release);
            // Wake anyone still waiting on this socket, and only them.
            pending.retain(|_, (conn, _)| *conn != id);
        });

        debug!(peer = %self.server_vk, %address, connection = id, "dealer connected");
        Some(DealerConnection { id, outbound, alive })
    }

    /// Drop the current connection; the next request reconnects.
    pub async fn reset(&self) {
        if let Some(conn) = self.connection.lock().await.take() {
            conn.alive.store(false, Ordering::Release);
        }
    }

    /// Drop the connection only if it is still the one with `id`. A newer
    /// connection opened in the meantime is left alone.
    async fn reset_connection(&self, id: u64) {
        let mut guard = self.connection.lock().await;
        if guard.as_ref().map_or(false, |conn| conn.id == id) {
            if let Some(conn) = guard.take() {
                conn.alive.store(false, Ordering::Release);
            }
        }
    }
}

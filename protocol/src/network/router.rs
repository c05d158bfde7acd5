//! # Router
//!
//! Authenticated request/reply endpoint. Peers connect through the transport
//! handshake, send JSON requests, and get replies routed back to the exact
//! connection that asked.
//!
//! ## Dispatch
//!
//! Every request carries an `action`. The [`ServiceTable`] maps action names
//! to plain function pointers, built once at startup. No registration
//! side effects, no reflection: if a name isn't in the table, nobody answers.
//!
//! Requests the router can't use are dropped without a reply:
//!
//! - frames that aren't JSON objects (logged at `warn`),
//! - missing or unknown `action` (logged at `debug`).
//!
//! The caller experiences either one as a timeout.
//!
//! ## Identity routing
//!
//! Each accepted connection gets an [`Identity`]: the authenticated VK plus
//! a connection counter, so a peer that reconnects never receives replies
//! meant for its previous socket. Replies echo the request's `request_id`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::messages::REQUEST_ID;
use super::transport::{self, log_handshake_failure, Authenticator, SecureStream, TransportError};
use crate::config::CONNECTION_QUEUE_DEPTH;
use crate::crypto::keys::Wallet;

/// Who sent a request: authenticated VK plus per-connection counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub vk: String,
    pub connection_id: u64,
}

/// Per-request metadata handed to service handlers.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub identity: Identity,
    pub remote_addr: SocketAddr,
}

impl RequestContext {
    pub fn sender_vk(&self) -> &str {
        &self.identity.vk
    }
}

/// A service: state, request context, decoded request -> optional reply.
pub type Handler<S> = fn(&S, &RequestContext, &Value) -> Option<Value>;

// ---------------------------------------------------------------------------
// ServiceTable
// ---------------------------------------------------------------------------

pub struct ServiceTable<S> {
    handlers: HashMap<&'static str, Handler<S>>,
}

impl<S> Default for ServiceTable<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> ServiceTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, action: &'static str, handler: Handler<S>) -> Self {
        self.handlers.insert(action, handler);
        self
    }

    pub fn actions(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Route one decoded request. `None` means "send nothing back".
    pub fn dispatch(&self, state: &S, ctx: &RequestContext, msg: &Value) -> Option<Value> {
        let Some(obj) = msg.as_object() else {
            warn!(peer = %ctx.identity.vk, "dropping non-object request");
            return None;
        };
        let Some(action) = obj.get("action").and_then(Value::as_str) else {
            debug!(peer = %ctx.identity.vk, "dropping request without action");
            return None;
        };
        let Some(handler) = self.handlers.get(action) else {
            debug!(peer = %ctx.identity.vk, action, "ignoring unknown action");
            return None;
        };

        trace!(peer = %ctx.identity.vk, action, "dispatching");
        let mut reply = handler(state, ctx, msg)?;
        if let (Some(id), Some(map)) = (obj.get(REQUEST_ID), reply.as_object_mut()) {
            map.insert(REQUEST_ID.to_string(), id.clone());
        }
        Some(reply)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

struct RouterShared<S> {
    wallet: Arc<Wallet>,
    authenticator: Arc<dyn Authenticator>,
    services: ServiceTable<S>,
    connections: DashMap<Identity, mpsc::Sender<Value>>,
    next_connection_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl<S> RouterShared<S> {
    async fn send_to(&self, identity: &Identity, msg: Value) -> bool {
        let sender = match self.connections.get(identity) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        sender.send(msg).await.is_ok()
    }
}

pub struct Router<S> {
    shared: Arc<RouterShared<S>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Send + Sync + 'static> Router<S> {
    pub fn new(
        wallet: Arc<Wallet>,
        authenticator: Arc<dyn Authenticator>,
        services: ServiceTable<S>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(RouterShared {
                wallet,
                authenticator,
                services,
                connections: DashMap::new(),
                next_connection_id: AtomicU64::new(0),
                shutdown,
            }),
            local_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind and start serving. Returns the bound address (handy with port 0).
    pub async fn start(&self, bind_addr: &str, state: Arc<S>) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!(addr = %local, "router listening");

        let shared = Arc::clone(&self.shared);
        let mut shutdown = shared.shutdown.subscribe();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            tokio::spawn(serve_connection(
                                Arc::clone(&shared),
                                Arc::clone(&state),
                                stream,
                                addr,
                            ));
                        }
                        Err(err) => warn!(error = %err, "router accept failed"),
                    },
                }
            }
            debug!("router accept loop stopped");
        });
        *self.accept_task.lock() = Some(task);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Stop accepting and close every connection.
    pub fn stop(&self) {
        self.shared.shutdown.send_replace(true);
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.shared.connections.clear();
    }
}

async fn serve_connection<S: Send + Sync + 'static>(
    shared: Arc<RouterShared<S>>,
    state: Arc<S>,
    stream: TcpStream,
    addr: SocketAddr,
) {
    let session = match transport::accept(stream, &shared.wallet, shared.authenticator.as_ref()).await {
        Ok(session) => session,
        Err(err) => {
            log_handshake_failure(addr, &err);
            return;
        }
    };
    let SecureStream {
        mut reader,
        mut writer,
        remote_vk,
        remote_addr,
    } = session;

    let identity = Identity {
        vk: remote_vk,
        connection_id: shared.next_connection_id.fetch_add(1, Ordering::Relaxed),
    };
    let (tx, mut rx) = mpsc::channel::<Value>(CONNECTION_QUEUE_DEPTH);
    shared.connections.insert(identity.clone(), tx);
    debug!(peer = %identity.vk, conn = identity.connection_id, "router connection open");

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(err) = writer.send_json(&msg).await {
                debug!(error = %err, "router write failed");
                break;
            }
        }
    });

    let ctx = RequestContext {
        identity: identity.clone(),
        remote_addr,
    };
    let mut shutdown = shared.shutdown.subscribe();
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = reader.recv() => frame,
        };
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(peer = %identity.vk, error = %err, "router connection closed");
                break;
            }
        };
        let msg: Value = match serde_json::from_slice(&frame) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(peer = %identity.vk, error = %err, "dropping malformed request");
                continue;
            }
        };
        if let Some(reply) = shared.services.dispatch(&state, &ctx, &msg) {
            if !shared.send_to(&identity, reply).await {
                break;
            }
        }
    }

    // Dropping the last sender lets the writer drain and exit.
    shared.connections.remove(&identity);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::credentials::CredentialsProvider;
    use crate::network::transport::connect;
    use serde_json::json;
    use std::time::Duration;

    struct Echo;

    fn echo(_: &Echo, ctx: &RequestContext, msg: &Value) -> Option<Value> {
        Some(json!({"response": "echo", "from": ctx.sender_vk(), "body": msg["body"]}))
    }

    fn silent(_: &Echo, _: &RequestContext, _: &Value) -> Option<Value> {
        None
    }

    async fn start_router(server: Arc<Wallet>, client: &Wallet) -> (Router<Echo>, SocketAddr) {
        let creds = Arc::new(CredentialsProvider::new(false));
        creds.add_key(&client.verifying_key()).unwrap();
        let table = ServiceTable::new().with("echo", echo).with("silent", silent);
        let router = Router::new(server, creds, table);
        let addr = router.start("127.0.0.1:0", Arc::new(Echo)).await.unwrap();
        (router, addr)
    }

    #[test]
    fn dispatch_echoes_request_id() {
        let table = ServiceTable::new().with("echo", echo);
        let ctx = RequestContext {
            identity: Identity {
                vk: "abc".into(),
                connection_id: 0,
            },
            remote_addr: "127.0.0.1:1".parse().unwrap(),
        };
        let reply = table
            .dispatch(&Echo, &ctx, &json!({"action": "echo", "body": 1, "request_id": "r1"}))
            .unwrap();
        assert_eq!(reply["request_id"], "r1");
        assert_eq!(reply["from"], "abc");

        assert!(table.dispatch(&Echo, &ctx, &json!({"action": "nope"})).is_none());
        assert!(table.dispatch(&Echo, &ctx, &json!({"body": 1})).is_none());
        assert!(table.dispatch(&Echo, &ctx, &json!([1, 2, 3])).is_none());
        assert_eq!(table.actions(), vec!["echo"]);
    }

    #[tokio::test]
    async fn replies_reach_the_sender() {
        let server = Arc::new(Wallet::generate());
        let client = Wallet::generate();
        let (router, addr) = start_router(Arc::clone(&server), &client).await;

        let mut session = connect(&addr.to_string(), &client, &server.verifying_key())
            .await
            .unwrap();
        session
            .writer
            .send_json(&json!({"action": "echo", "body": "hi", "request_id": "42"}))
            .await
            .unwrap();
        let reply: Value = serde_json::from_slice(&session.reader.recv().await.unwrap()).unwrap();
        assert_eq!(reply["body"], "hi");
        assert_eq!(reply["request_id"], "42");
        assert_eq!(reply["from"], client.verifying_key());
        assert_eq!(router.connection_count(), 1);
        router.stop();
    }

    #[tokio::test]
    async fn malformed_and_unknown_requests_get_no_reply() {
        let server = Arc::new(Wallet::generate());
        let client = Wallet::generate();
        let (router, addr) = start_router(Arc::clone(&server), &client).await;

        let mut session = connect(&addr.to_string(), &client, &server.verifying_key())
            .await
            .unwrap();
        session.writer.send(b"{{{ not json").await.unwrap();
        session
            .writer
            .send_json(&json!({"action": "does_not_exist"}))
            .await
            .unwrap();
        session.writer.send_json(&json!({"action": "silent"})).await.unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(300), session.reader.recv()).await;
        assert!(nothing.is_err(), "router should stay silent");

        // The connection is still usable afterwards.
        session
            .writer
            .send_json(&json!({"action": "echo", "body": 1}))
            .await
            .unwrap();
        assert!(session.reader.recv().await.is_ok());
        router.stop();
    }

    #[tokio::test]
    async fn strangers_are_turned_away() {
        let server = Arc::new(Wallet::generate());
        let member = Wallet::generate();
        let stranger = Wallet::generate();
        let (router, addr) = start_router(Arc::clone(&server), &member).await;

        let result = connect(&addr.to_string(), &stranger, &server.verifying_key()).await;
        assert!(matches!(result, Err(TransportError::Rejected)));
        router.stop();
    }
}

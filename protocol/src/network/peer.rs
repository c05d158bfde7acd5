//! # Peer
//!
//! Our view of one remote node: a [`Dealer`] for requests to its router and,
//! once the `hello` handshake succeeds, a [`Subscriber`] on its publisher.
//!
//! ## Lifecycle
//!
//! ```text
//! start() ──► hello loop (backoff) ──► connected ──► heartbeat
//!                                          │             │
//!                                 subscribe to pub   ping every interval,
//!                                 PeerConnected cmd  Remove cmd after N strikes
//! ```
//!
//! The peer never edits the network's peer map itself. Anything that
//! changes membership (a gossip announcement, the remote shutting down,
//! heartbeat failure) goes out as a [`NetworkCommand`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::catchup::BlockSource;
use super::dealer::Dealer;
use super::messages::{
    block_query_fields, request, Announcement, LatestBlockInfo, NetworkCommand, ACTION_GET_BLOCK,
    ACTION_GET_LATEST_BLOCK, ACTION_GET_NETWORK_MAP, ACTION_GET_NEXT_BLOCK, ACTION_GET_PREV_BLOCK,
    ACTION_GOSSIP_NEW_BLOCK, ACTION_HELLO, ACTION_PING,
};
use super::publisher::Subscriber;
use crate::config::{split_address, NetworkConfig, SocketPorts};
use crate::crypto::keys::Wallet;
use crate::crypto::signatures::verify;
use crate::storage::{Block, BlockQuery};

pub struct Peer {
    server_vk: String,
    ip: RwLock<String>,
    socket_ports: RwLock<SocketPorts>,
    wallet: Arc<Wallet>,
    config: NetworkConfig,
    /// Our own router address, sent in `hello` so the remote can dial back.
    local_address: String,
    connected: AtomicBool,
    latest_block_info: RwLock<LatestBlockInfo>,
    strikes: AtomicU32,
    dealer: Dealer,
    subscriber: Mutex<Option<Subscriber>>,
    commands: mpsc::Sender<NetworkCommand>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("server_vk", &self.server_vk)
            .field("ip", &*self.ip.read())
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn ports_for(ip: &str) -> SocketPorts {
    split_address(ip)
        .map(|(_, port)| SocketPorts::from_base(port))
        .unwrap_or_default()
}

impl Peer {
    pub fn new(
        server_vk: String,
        ip: String,
        wallet: Arc<Wallet>,
        config: NetworkConfig,
        commands: mpsc::Sender<NetworkCommand>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let local_address = config.router_address();
        Self {
            dealer: Dealer::new(ip.clone(), server_vk.clone(), Arc::clone(&wallet), config.clone()),
            socket_ports: RwLock::new(ports_for(&ip)),
            ip: RwLock::new(ip),
            server_vk,
            wallet,
            config,
            local_address,
            connected: AtomicBool::new(false),
            latest_block_info: RwLock::new(LatestBlockInfo::default()),
            strikes: AtomicU32::new(0),
            subscriber: Mutex::new(None),
            commands,
            shutdown,
            task: Mutex::new(None),
        }
    }

    pub fn server_vk(&self) -> &str {
        &self.server_vk
    }

    pub fn ip(&self) -> String {
        self.ip.read().clone()
    }

    pub fn socket_ports(&self) -> SocketPorts {
        *self.socket_ports.read()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn latest_block_info(&self) -> LatestBlockInfo {
        self.latest_block_info.read().clone()
    }

    fn publisher_address(&self) -> String {
        let ip = self.ip();
        let host = split_address(&ip).map_or(ip.as_str(), |(host, _)| host);
        format!("{}:{}", host, self.socket_ports().publisher)
    }

    /// Move the peer to a new router address. Only meaningful before it
    /// has connected; the hello loop picks the new address up on its next
    /// attempt.
    pub async fn set_ip(&self, ip: String) {
        *self.socket_ports.write() = ports_for(&ip);
        *self.ip.write() = ip.clone();
        self.dealer.set_address(ip).await;
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Spawn the hello loop followed by the heartbeat.
    pub fn start(self: &Arc<Self>) {
        let peer = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop.changed() => {}
                _ = peer.run() => {}
            }
        });
        if let Some(old) = self.task.lock().replace(task) {
            old.abort();
        }
    }

    async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        while !self.handshake().await {
            tokio::time::sleep(self.config.reconnect_backoff(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
        self.on_connected();
        self.heartbeat().await;
    }

    /// One `hello` round: the remote must sign our random challenge.
    async fn handshake(&self) -> bool {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);

        let Some(reply) = self.hello(&challenge).await else {
            return false;
        };
        let signed = reply
            .get("challenge_response")
            .and_then(Value::as_str)
            .map_or(false, |sig| verify(&self.server_vk, challenge.as_bytes(), sig));
        if !signed {
            warn!(peer = %self.server_vk, "hello challenge not signed by peer key");
            return false;
        }
        if let Some(info) = LatestBlockInfo::from_response(&reply) {
            *self.latest_block_info.write() = info;
        }
        true
    }

    fn on_connected(&self) {
        self.connected.store(true, Ordering::Release);
        self.strikes.store(0, Ordering::Release);
        info!(peer = %self.server_vk, ip = %self.ip(), "peer connected");

        let commands = self.commands.clone();
        let publisher_vk = self.server_vk.clone();
        let subscriber = Subscriber::spawn(
            self.publisher_address(),
            Arc::clone(&self.wallet),
            self.server_vk.clone(),
            self.config.clone(),
            move |announcement| {
                let command = match announcement {
                    Announcement::NewPeerConnection { vk, ip } => NetworkCommand::Connect { vk, ip },
                    Announcement::Shutdown => {
                        info!(peer = %publisher_vk, "peer announced shutdown");
                        NetworkCommand::Remove {
                            vk: publisher_vk.clone(),
                        }
                    }
                };
                if let Err(err) = commands.try_send(command) {
                    debug!(peer = %publisher_vk, error = %err, "network command dropped");
                }
            },
        );
        if let Some(old) = self.subscriber.lock().replace(subscriber) {
            old.stop();
        }

        let announce = NetworkCommand::PeerConnected {
            vk: self.server_vk.clone(),
            ip: self.ip(),
        };
        if let Err(err) = self.commands.try_send(announce) {
            debug!(peer = %self.server_vk, error = %err, "network command dropped");
        }
    }

    async fn heartbeat(&self) {
        let period = self.config.ping_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if self.ping().await.is_some() {
                self.strikes.store(0, Ordering::Release);
                continue;
            }
            let strikes = self.strikes.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(peer = %self.server_vk, strikes, "ping missed");
            if strikes >= self.config.max_ping_strikes {
                warn!(peer = %self.server_vk, strikes, "peer unresponsive, dropping");
                self.connected.store(false, Ordering::Release);
                let _ = self
                    .commands
                    .send(NetworkCommand::Remove {
                        vk: self.server_vk.clone(),
                    })
                    .await;
                return;
            }
        }
    }

    /// Stop the background loop, the subscription and the dealer.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        self.connected.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if let Some(subscriber) = self.subscriber.lock().take() {
            subscriber.stop();
        }
        self.dealer.reset().await;
        debug!(peer = %self.server_vk, "peer stopped");
    }

    // -- Requests -----------------------------------------------------------

    async fn call(&self, msg: Value) -> Option<Value> {
        self.dealer
            .request(&msg, self.config.request_timeout(), self.config.request_attempts)
            .await
    }

    /// Single attempt; the heartbeat counts misses itself.
    pub async fn ping(&self) -> Option<Value> {
        self.dealer
            .request(&request(ACTION_PING, json!({})), self.config.request_timeout(), 1)
            .await
    }

    pub async fn hello(&self, challenge: &str) -> Option<Value> {
        self.call(request(
            ACTION_HELLO,
            json!({ "ip": self.local_address, "challenge": challenge }),
        ))
        .await
    }

    pub async fn get_latest_block_info(&self) -> Option<LatestBlockInfo> {
        let reply = self.call(request(ACTION_GET_LATEST_BLOCK, json!({}))).await?;
        let info = LatestBlockInfo::from_response(&reply)?;
        *self.latest_block_info.write() = info.clone();
        Some(info)
    }

    async fn fetch_block(&self, action: &str, query: &BlockQuery) -> Option<Block> {
        let reply = self.call(request(action, block_query_fields(query))).await?;
        let info = reply.get("block_info")?;
        if info.is_null() {
            return None;
        }
        match serde_json::from_value(info.clone()) {
            Ok(block) => Some(block),
            Err(err) => {
                warn!(peer = %self.server_vk, error = %err, "peer sent malformed block");
                None
            }
        }
    }

    pub async fn get_block(&self, query: &BlockQuery) -> Option<Block> {
        self.fetch_block(ACTION_GET_BLOCK, query).await
    }

    pub async fn get_next_block(&self, query: &BlockQuery) -> Option<Block> {
        self.fetch_block(ACTION_GET_NEXT_BLOCK, query).await
    }

    pub async fn get_previous_block(&self, query: &BlockQuery) -> Option<Block> {
        self.fetch_block(ACTION_GET_PREV_BLOCK, query).await
    }

    pub async fn get_network_map(&self) -> Option<HashMap<String, String>> {
        let reply = self.call(request(ACTION_GET_NETWORK_MAP, json!({}))).await?;
        serde_json::from_value(reply.get("network_map")?.clone()).ok()
    }

    /// Tell the peer about a new block. Returns the block number the peer
    /// thinks we skipped, if any.
    pub async fn gossip_new_block(&self, block_num: u64, previous_block_num: u64) -> Option<u64> {
        let reply = self
            .call(request(
                ACTION_GOSSIP_NEW_BLOCK,
                json!({ "block_num": block_num, "previous_block_num": previous_block_num }),
            ))
            .await?;
        reply.get("missing_block").and_then(Value::as_u64)
    }
}

#[async_trait]
impl BlockSource for Peer {
    fn vk(&self) -> &str {
        &self.server_vk
    }

    async fn get_latest_block(&self) -> Option<Block> {
        let info = self.get_latest_block_info().await?;
        self.get_block(&BlockQuery::Number(info.number)).await
    }

    async fn get_previous_block(&self, number: u64) -> Option<Block> {
        Peer::get_previous_block(self, &BlockQuery::Number(number)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::credentials::CredentialsProvider;
    use crate::network::router::{RequestContext, Router, ServiceTable};

    fn peer(ip: &str) -> Peer {
        let (tx, _rx) = mpsc::channel(4);
        Peer::new(
            Wallet::generate().verifying_key(),
            ip.to_string(),
            Arc::new(Wallet::generate()),
            NetworkConfig::local(19000),
            tx,
        )
    }

    #[tokio::test]
    async fn ports_follow_the_router_address() {
        let peer = peer("10.0.0.5:20000");
        assert_eq!(peer.socket_ports(), SocketPorts::from_base(20000));
        assert_eq!(peer.publisher_address(), "10.0.0.5:20080");

        peer.set_ip("10.0.0.6:21000".into()).await;
        assert_eq!(peer.ip(), "10.0.0.6:21000");
        assert_eq!(peer.publisher_address(), "10.0.0.6:21080");
    }

    /// A remote router whose hello signer and ping behaviour we control.
    struct Remote {
        signer: Wallet,
        answer_pings: AtomicBool,
    }

    fn remote_hello(remote: &Remote, _: &RequestContext, msg: &Value) -> Option<Value> {
        let challenge = msg.get("challenge")?.as_str()?;
        Some(json!({
            "response": ACTION_HELLO,
            "latest_block_number": 7,
            "latest_hlc_timestamp": "2026-01-01T00:00:07.000000000Z_0",
            "challenge_response": remote.signer.sign(challenge.as_bytes()),
        }))
    }

    fn remote_ping(remote: &Remote, _: &RequestContext, _: &Value) -> Option<Value> {
        remote
            .answer_pings
            .load(Ordering::Acquire)
            .then(|| json!({ "response": ACTION_PING }))
    }

    fn fast_config() -> NetworkConfig {
        NetworkConfig {
            request_timeout_ms: 100,
            request_attempts: 1,
            reconnect_backoff_base_ms: 20,
            reconnect_backoff_max_ms: 100,
            ping_interval_ms: 50,
            max_ping_strikes: 2,
            ..NetworkConfig::local(19000)
        }
    }

    /// Start a remote router. `sign_with_own_key` false makes it answer hello
    /// with some other key's signature.
    async fn spawn_remote(sign_with_own_key: bool) -> (Router<Remote>, Arc<Remote>, String, String) {
        let server = Arc::new(Wallet::generate());
        let signer = if sign_with_own_key {
            Wallet::from_hex(&server.secret_key_hex()).unwrap()
        } else {
            Wallet::generate()
        };
        let remote = Arc::new(Remote {
            signer,
            answer_pings: AtomicBool::new(true),
        });
        let router = Router::new(
            Arc::clone(&server),
            Arc::new(CredentialsProvider::new(true)),
            ServiceTable::new()
                .with(ACTION_HELLO, remote_hello)
                .with(ACTION_PING, remote_ping),
        );
        let addr = router.start("127.0.0.1:0", Arc::clone(&remote)).await.unwrap();
        (router, remote, server.verifying_key(), addr.to_string())
    }

    async fn wait_connected(peer: &Peer) {
        for _ in 0..100 {
            if peer.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("peer never connected");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missed_pings_remove_the_peer() {
        let (router, remote, server_vk, addr) = spawn_remote(true).await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = Arc::new(Peer::new(
            server_vk.clone(),
            addr,
            Arc::new(Wallet::generate()),
            fast_config(),
            tx,
        ));
        peer.start();
        wait_connected(&peer).await;
        assert_eq!(peer.latest_block_info().number, 7);

        remote.answer_pings.store(false, Ordering::Release);
        let removed = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(command) = rx.recv().await {
                if let NetworkCommand::Remove { vk } = command {
                    return vk;
                }
            }
            panic!("command channel closed");
        })
        .await
        .expect("peer was never removed");

        assert_eq!(removed, server_vk);
        assert!(!peer.is_connected());
        peer.stop().await;
        router.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn answered_pings_keep_the_peer() {
        let (router, _remote, server_vk, addr) = spawn_remote(true).await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = Arc::new(Peer::new(server_vk, addr, Arc::new(Wallet::generate()), fast_config(), tx));
        peer.start();
        wait_connected(&peer).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(peer.is_connected());
        while let Ok(command) = rx.try_recv() {
            assert!(!matches!(command, NetworkCommand::Remove { .. }));
        }
        peer.stop().await;
        router.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn hello_signed_by_another_key_is_rejected() {
        let (router, _remote, server_vk, addr) = spawn_remote(false).await;
        let (tx, mut rx) = mpsc::channel(16);
        let peer = Arc::new(Peer::new(server_vk, addr, Arc::new(Wallet::generate()), fast_config(), tx));
        peer.start();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!peer.is_connected());
        assert_eq!(peer.latest_block_info(), LatestBlockInfo::default());
        assert!(rx.try_recv().is_err(), "no command for an unverified peer");
        peer.stop().await;
        router.stop();
    }

    #[tokio::test]
    async fn fresh_peer_is_not_connected() {
        let peer = peer("127.0.0.1:1");
        assert!(!peer.is_connected());
        assert_eq!(peer.latest_block_info(), LatestBlockInfo::default());
    }
}

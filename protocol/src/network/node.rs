//! # Network
//!
//! Owns a node's router, publisher and peer map, and decides who gets in.
//!
//! ## Admission
//!
//! A VK becomes a peer when it is on the committee (the union of the member
//! lists stored under [`NetworkConfig::membership_keys`]) or when the
//! credentials provider is accepting everyone. Self-connections and
//! duplicates are refused. There is never more than one [`Peer`] per VK.
//!
//! ## Discovery
//!
//! ```text
//!   A ──hello──► B            B doesn't know A: B dials A back
//!   A: Peer(B) connected      A publishes new_peer_connection(B)
//!   C (subscribed to A)       C dials B
//! ```
//!
//! On top of the announcement, every freshly connected peer is asked for
//! its network map, which covers announcements sent before we subscribed.
//!
//! Peers, subscribers and router services never touch the peer map. They
//! submit [`NetworkCommand`]s which a single loop applies in order.

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::catchup::{BlockSource, CatchupNetwork};
use super::credentials::CredentialsProvider;
use super::gossip::select_gossip_group;
use super::messages::{LatestBlockInfo, NetworkCommand};
use super::peer::Peer;
use super::publisher::Publisher;
use super::router::Router;
use super::services::build_service_table;
use super::transport::TransportError;
use crate::config::{ConfigError, NetworkConfig, COMMAND_QUEUE_DEPTH};
use crate::crypto::keys::Wallet;
use crate::storage::{BlockStorage, StateDriver};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("refusing to connect to self")]
    SelfConnection,

    #[error("{0} is already a peer")]
    AlreadyPeer(String),

    #[error("{0} is not on the committee")]
    NotAuthorized(String),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("invalid network config: {0}")]
    Config(#[from] ConfigError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("network already started")]
    AlreadyStarted,
}

pub struct Network {
    wallet: Arc<Wallet>,
    config: NetworkConfig,
    credentials: Arc<CredentialsProvider>,
    storage: Arc<dyn BlockStorage>,
    driver: Arc<dyn StateDriver>,
    peers: RwLock<HashMap<String, Arc<Peer>>>,
    router: Router<Network>,
    publisher: Publisher,
    commands: mpsc::Sender<NetworkCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<NetworkCommand>>>,
    command_task: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    pub fn new(
        wallet: Arc<Wallet>,
        config: NetworkConfig,
        credentials: Arc<CredentialsProvider>,
        storage: Arc<dyn BlockStorage>,
        driver: Arc<dyn StateDriver>,
    ) -> Arc<Self> {
        let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        Arc::new(Self {
            router: Router::new(
                Arc::clone(&wallet),
                credentials.clone(),
                build_service_table(),
            ),
            publisher: Publisher::new(Arc::clone(&wallet), credentials.clone()),
            wallet,
            config,
            credentials,
            storage,
            driver,
            peers: RwLock::new(HashMap::new()),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            command_task: Mutex::new(None),
        })
    }

    // -- Accessors ----------------------------------------------------------

    pub fn wallet(&self) -> &Wallet {
        &self.wallet
    }

    pub fn vk(&self) -> String {
        self.wallet.verifying_key()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialsProvider> {
        &self.credentials
    }

    pub fn storage(&self) -> &Arc<dyn BlockStorage> {
        &self.storage
    }

    pub fn router(&self) -> &Router<Network> {
        &self.router
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    // -- Lifecycle ----------------------------------------------------------

    /// Bind the router and publisher and start applying commands.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        self.config.validate()?;
        let Some(mut rx) = self.command_rx.lock().take() else {
            return Err(NetworkError::AlreadyStarted);
        };

        if self.config.accept_all {
            self.credentials.open_messages();
        }
        self.refresh_approved_peers_in_cred_provider();

        let host = self.config.bind_host();
        let ports = self.config.socket_ports;
        self.router
            .start(&format!("{host}:{}", ports.router), Arc::clone(self))
            .await?;
        self.publisher
            .start(&format!("{host}:{}", ports.publisher))
            .await?;

        let weak: Weak<Network> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(network) = weak.upgrade() else { break };
                network.handle_command(command).await;
            }
            debug!("network command loop stopped");
        });
        *self.command_task.lock() = Some(task);

        info!(vk = %self.vk(), address = %self.config.router_address(), "network started");
        Ok(())
    }

    /// Say goodbye, drop every peer and close the sockets.
    pub async fn stop(&self) {
        self.publisher.announce_shutdown();
        // Give subscriber writers a moment to flush the announcement.
        tokio::task::yield_now().await;

        let peers: Vec<Arc<Peer>> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.stop().await;
        }
        if let Some(task) = self.command_task.lock().take() {
            task.abort();
        }
        self.router.stop();
        self.publisher.stop();
        info!(vk = %self.vk(), "network stopped");
    }

    /// Queue a command for the network loop. Never blocks.
    pub fn submit(&self, command: NetworkCommand) {
        if let Err(err) = self.commands.try_send(command) {
            warn!(error = %err, "network command queue full, dropping");
        }
    }

    async fn handle_command(self: &Arc<Self>, command: NetworkCommand) {
        match command {
            NetworkCommand::Connect { vk, ip } => {
                if vk == self.vk() || self.has_peer(&vk) {
                    return;
                }
                if let Err(err) = self.connect_peer(&ip, &vk).await {
                    debug!(peer = %vk, error = %err, "gossiped peer not connected");
                }
            }
            NetworkCommand::Remove { vk } => {
                self.remove_peer(&vk);
            }
            NetworkCommand::PeerConnected { vk, ip } => {
                self.publisher.announce_new_peer_connection(&vk, &ip);
                let Some(peer) = self.get_peer(&vk) else { return };
                let network = Arc::clone(self);
                tokio::spawn(async move {
                    let Some(map) = peer.get_network_map().await else { return };
                    let own_vk = network.vk();
                    for (vk, ip) in map {
                        if vk != own_vk && !network.has_peer(&vk) {
                            if let Err(err) = network.connect_peer(&ip, &vk).await {
                                debug!(peer = %vk, error = %err, "network map entry skipped");
                            }
                        }
                    }
                });
            }
        }
    }

    // -- Admission ----------------------------------------------------------

    /// Committee members: the union of every configured membership list.
    pub fn get_node_list(&self) -> Vec<String> {
        let mut members = BTreeSet::new();
        for key in &self.config.membership_keys {
            match self.driver.get(key) {
                Ok(Some(Value::Array(list))) => {
                    members.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
                }
                Ok(Some(other)) => warn!(key, value = %other, "membership list is not an array"),
                Ok(None) => {}
                Err(err) => warn!(key, error = %err, "could not read membership list"),
            }
        }
        members.into_iter().collect()
    }

    pub fn peer_is_voted_in(&self, vk: &str) -> bool {
        self.get_node_list().iter().any(|member| member == vk)
    }

    /// Admit `vk` at router address `ip` and start talking to it.
    pub async fn connect_peer(&self, ip: &str, vk: &str) -> Result<Arc<Peer>, AdmissionError> {
        if vk == self.vk() {
            warn!(ip, "refusing to connect to self");
            return Err(AdmissionError::SelfConnection);
        }
        if !self.credentials.is_open() && !self.peer_is_voted_in(vk) {
            warn!(peer = %vk, ip, "refusing peer that is not on the committee");
            return Err(AdmissionError::NotAuthorized(vk.to_string()));
        }

        let existing = self.peers.read().get(vk).cloned();
        if let Some(peer) = existing {
            if !peer.is_connected() && peer.ip() != ip {
                debug!(peer = %vk, old = %peer.ip(), new = ip, "updating unconnected peer address");
                peer.set_ip(ip.to_string()).await;
            }
            return Err(AdmissionError::AlreadyPeer(vk.to_string()));
        }

        let peer = Arc::new(Peer::new(
            vk.to_string(),
            ip.to_string(),
            Arc::clone(&self.wallet),
            self.config.clone(),
            self.commands.clone(),
        ));
        {
            let mut peers = self.peers.write();
            if peers.contains_key(vk) {
                return Err(AdmissionError::AlreadyPeer(vk.to_string()));
            }
            peers.insert(vk.to_string(), Arc::clone(&peer));
        }
        info!(peer = %vk, ip, "connecting to peer");
        peer.start();
        Ok(peer)
    }

    /// Reload the committee into the credentials provider. Accept-all is
    /// for bootstrapping only: it is switched off as soon as the committee
    /// names someone other than us.
    pub fn refresh_approved_peers_in_cred_provider(&self) {
        let members = self.get_node_list();
        let me = self.vk();
        let committee_exists = members.iter().any(|member| *member != me);
        self.credentials.set_approved(&members);
        if committee_exists && self.credentials.is_open() {
            info!(members = members.len(), "committee in place, leaving accept-all mode");
            self.credentials.secure_messages();
        }
    }

    /// Revoke the VK's credentials, then drop the peer.
    pub fn revoke_access_and_remove_peer(&self, vk: &str) {
        self.credentials.remove_key(vk);
        self.remove_peer(vk);
    }

    /// Forget the peer now; its sockets are closed in the background.
    pub fn remove_peer(&self, vk: &str) -> bool {
        let Some(peer) = self.peers.write().remove(vk) else {
            return false;
        };
        info!(peer = %vk, "removing peer");
        tokio::spawn(async move { peer.stop().await });
        true
    }

    // -- Peer queries -------------------------------------------------------

    pub fn has_peer(&self, vk: &str) -> bool {
        self.peers.read().contains_key(vk)
    }

    pub fn get_peer(&self, vk: &str) -> Option<Arc<Peer>> {
        self.peers.read().get(vk).cloned()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn get_all_connected_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_connected())
            .cloned()
            .collect()
    }

    pub fn num_of_peers_connected(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|peer| peer.is_connected())
            .count()
    }

    pub fn get_gossip_group(&self) -> Vec<Arc<Peer>> {
        select_gossip_group(&self.get_all_connected_peers())
    }

    /// Ping peers in random order; `true` as soon as one answers. With no
    /// peers there is nothing to be disconnected from.
    pub async fn check_connectivity(&self) -> bool {
        let mut peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        if peers.is_empty() {
            return true;
        }
        peers.shuffle(&mut rand::thread_rng());
        for peer in peers {
            if peer.ping().await.is_some() {
                return true;
            }
        }
        false
    }

    pub fn get_latest_block_info(&self) -> LatestBlockInfo {
        match self.storage.get_latest_block() {
            Ok(Some(block)) => LatestBlockInfo {
                number: block.number,
                hlc_timestamp: block.hlc_timestamp,
            },
            Ok(None) => LatestBlockInfo::default(),
            Err(err) => {
                warn!(error = %err, "could not read latest block");
                LatestBlockInfo::default()
            }
        }
    }

    /// `vk -> router address` for ourselves and every peer we may talk to.
    pub fn get_network_map(&self) -> HashMap<String, String> {
        let members = self.get_node_list();
        let open = self.credentials.is_open();
        let mut map: HashMap<String, String> = self
            .peers
            .read()
            .values()
            .filter(|peer| open || members.iter().any(|m| m == peer.server_vk()))
            .map(|peer| (peer.server_vk().to_string(), peer.ip()))
            .collect();
        map.insert(self.vk(), self.config.router_address());
        map
    }

    /// Tell the gossip group about a new block. Returns the block numbers
    /// peers say we skipped.
    pub async fn gossip_new_block(&self, block_num: u64, previous_block_num: u64) -> Vec<u64> {
        let group = self.get_gossip_group();
        debug!(block = block_num, peers = group.len(), "gossiping new block");
        let replies = join_all(
            group
                .iter()
                .map(|peer| peer.gossip_new_block(block_num, previous_block_num)),
        )
        .await;
        let mut missing: Vec<u64> = replies.into_iter().flatten().collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }
}

impl CatchupNetwork for Network {
    fn catchup_peers(&self) -> Vec<Arc<dyn BlockSource>> {
        self.get_all_connected_peers()
            .into_iter()
            .map(|peer| peer as Arc<dyn BlockSource>)
            .collect()
    }

    fn refresh_approved_peers(&self) {
        self.refresh_approved_peers_in_cred_provider();
    }
}

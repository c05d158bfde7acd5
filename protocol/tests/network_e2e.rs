//! End-to-end tests for the peer mesh over real loopback sockets.
//!
//! Every node binds its own router and publisher, authenticates through the
//! full handshake and discovers the others the way a deployed node would.
//! Tests use disjoint port ranges so they can run in parallel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tessera_protocol::config::{NetworkConfig, MASTERNODES_MEMBERS_KEY};
use tessera_protocol::crypto::keys::Wallet;
use tessera_protocol::network::{BlockSource, CredentialsProvider, Network};
use tessera_protocol::storage::{
    Block, BlockQuery, BlockStorage, BlockStore, ContractDriver, StateDriver,
};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn fast_config(router_port: u16) -> NetworkConfig {
    NetworkConfig {
        request_timeout_ms: 500,
        request_attempts: 2,
        reconnect_backoff_base_ms: 50,
        reconnect_backoff_max_ms: 400,
        ping_interval_ms: 1_000,
        max_ping_strikes: 3,
        ..NetworkConfig::local(router_port)
    }
}

/// A started network whose committee is exactly `members`.
async fn spawn_node(wallet: Wallet, router_port: u16, members: &[String]) -> Arc<Network> {
    let storage = BlockStore::open_temporary().expect("temp store");
    storage
        .store_block(&Block::genesis("2026-01-01T00:00:00.000000000Z_0", vec![]))
        .expect("genesis");
    let driver = ContractDriver::open_temporary().expect("temp driver");
    driver
        .set(MASTERNODES_MEMBERS_KEY, &json!(members))
        .expect("members");

    let network = Network::new(
        Arc::new(wallet),
        fast_config(router_port),
        Arc::new(CredentialsProvider::new(false)),
        Arc::new(storage),
        Arc::new(driver),
    );
    network.start().await.expect("network start");
    network
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..150 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

fn committee(n: usize) -> (Vec<Wallet>, Vec<String>) {
    let wallets: Vec<Wallet> = (0..n).map(|_| Wallet::generate()).collect();
    let vks = wallets.iter().map(Wallet::verifying_key).collect();
    (wallets, vks)
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_networks_connect_both_ways() {
    let (mut wallets, vks) = committee(2);
    let b = spawn_node(wallets.pop().unwrap(), 31_001, &vks).await;
    let a = spawn_node(wallets.pop().unwrap(), 31_000, &vks).await;

    a.connect_peer("127.0.0.1:31001", &b.vk()).await.expect("admitted");

    wait_until("both sides connected", || {
        a.num_of_peers_connected() == 1 && b.num_of_peers_connected() == 1
    })
    .await;
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);
    assert!(a.check_connectivity().await);

    a.stop().await;
    b.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn star_topology_becomes_full_mesh() {
    let (mut wallets, vks) = committee(3);
    let c = spawn_node(wallets.pop().unwrap(), 31_202, &vks).await;
    let b = spawn_node(wallets.pop().unwrap(), 31_201, &vks).await;
    let a = spawn_node(wallets.pop().unwrap(), 31_200, &vks).await;

    a.connect_peer("127.0.0.1:31201", &b.vk()).await.expect("b admitted");
    a.connect_peer("127.0.0.1:31202", &c.vk()).await.expect("c admitted");

    wait_until("full mesh", || {
        [&a, &b, &c].iter().all(|n| n.num_of_peers_connected() == 2)
    })
    .await;

    // Everyone knows everyone under the right address.
    let map = b.get_network_map();
    assert_eq!(map.get(&c.vk()).map(String::as_str), Some("127.0.0.1:31202"));
    assert_eq!(map.len(), 3);

    for node in [a, b, c] {
        node.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_announcement_removes_peer() {
    let (mut wallets, vks) = committee(2);
    let b = spawn_node(wallets.pop().unwrap(), 31_401, &vks).await;
    let a = spawn_node(wallets.pop().unwrap(), 31_400, &vks).await;

    a.connect_peer("127.0.0.1:31401", &b.vk()).await.expect("admitted");
    wait_until("connected with subscriptions", || {
        a.num_of_peers_connected() == 1
            && b.num_of_peers_connected() == 1
            && b.publisher().subscriber_count() == 1
    })
    .await;

    b.stop().await;
    wait_until("a forgets b", || a.peer_count() == 0).await;

    a.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn outsiders_cannot_get_in() {
    let (mut wallets, vks) = committee(1);
    let outsider_wallet = Wallet::generate();
    let outsider_vk = outsider_wallet.verifying_key();

    // A only trusts itself; the outsider trusts A.
    let a = spawn_node(wallets.pop().unwrap(), 31_600, &vks).await;
    let mut outsider_committee = vks.clone();
    outsider_committee.push(outsider_vk.clone());
    let outsider = spawn_node(outsider_wallet, 31_601, &outsider_committee).await;

    outsider
        .connect_peer("127.0.0.1:31600", &a.vk())
        .await
        .expect("outsider admits a locally");

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(outsider.num_of_peers_connected(), 0);
    assert_eq!(a.peer_count(), 0);
    assert!(!a.credentials().is_approved(&outsider_vk));

    // A refuses to dial the outsider too.
    assert!(a.connect_peer("127.0.0.1:31601", &outsider_vk).await.is_err());

    a.stop().await;
    outsider.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn peers_serve_blocks_and_gossip() {
    let (mut wallets, vks) = committee(2);
    let b = spawn_node(wallets.pop().unwrap(), 31_801, &vks).await;
    let a = spawn_node(wallets.pop().unwrap(), 31_800, &vks).await;

    // B is two blocks ahead.
    let genesis = b
        .storage()
        .get_block(&BlockQuery::Number(0))
        .unwrap()
        .expect("genesis");
    let one = Block::new(&genesis, "2026-01-01T00:00:01.000000000Z_0", None, vec![]);
    let two = Block::new(&one, "2026-01-01T00:00:02.000000000Z_0", None, vec![]);
    b.storage().store_block(&one).unwrap();
    b.storage().store_block(&two).unwrap();

    let peer = a.connect_peer("127.0.0.1:31801", &b.vk()).await.expect("admitted");
    wait_until("connected", || peer.is_connected()).await;

    assert_eq!(peer.latest_block_info().number, 2);
    let info = peer.get_latest_block_info().await.expect("latest");
    assert_eq!(info.hlc_timestamp, "2026-01-01T00:00:02.000000000Z_0");

    let latest = BlockSource::get_latest_block(peer.as_ref()).await.expect("block");
    assert_eq!(latest.hash, two.hash);
    let previous = BlockSource::get_previous_block(peer.as_ref(), 2).await.expect("block");
    assert_eq!(previous.hash, one.hash);

    // A announces block 3 built on 0; B holds 1 in between.
    let missing = a.gossip_new_block(3, 0).await;
    assert_eq!(missing, vec![1]);

    a.stop().await;
    b.stop().await;
}

//! Router services: one plain function per action, collected into a
//! [`ServiceTable`] at startup.

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::messages::{
    parse_block_query, NetworkCommand, ACTION_GET_BLOCK, ACTION_GET_LATEST_BLOCK,
    ACTION_GET_NETWORK_MAP, ACTION_GET_NEXT_BLOCK, ACTION_GET_PREV_BLOCK, ACTION_GOSSIP_NEW_BLOCK,
    ACTION_HELLO, ACTION_PING,
};
use super::node::Network;
use super::router::{RequestContext, ServiceTable};
use crate::storage::{Block, BlockQuery, DbResult};

pub fn build_service_table() -> ServiceTable<Network> {
    ServiceTable::new()
        .with(ACTION_PING, ping)
        .with(ACTION_HELLO, hello)
        .with(ACTION_GET_LATEST_BLOCK, get_latest_block)
        .with(ACTION_GET_BLOCK, get_block)
        .with(ACTION_GET_NEXT_BLOCK, get_next_block)
        .with(ACTION_GET_PREV_BLOCK, get_prev_block)
        .with(ACTION_GET_NETWORK_MAP, get_network_map)
        .with(ACTION_GOSSIP_NEW_BLOCK, gossip_new_block)
}

fn ping(_: &Network, _: &RequestContext, _: &Value) -> Option<Value> {
    Some(json!({ "response": ACTION_PING }))
}

fn latest_fields(network: &Network, response: &str) -> Value {
    let info = network.get_latest_block_info();
    json!({
        "response": response,
        "latest_block_number": info.number,
        "latest_hlc_timestamp": info.hlc_timestamp,
    })
}

/// Sign the caller's challenge and, if they are new to us, dial them back.
fn hello(network: &Network, ctx: &RequestContext, msg: &Value) -> Option<Value> {
    let Some(challenge) = msg.get("challenge").and_then(Value::as_str) else {
        debug!(peer = %ctx.sender_vk(), "hello without challenge");
        return None;
    };

    if let Some(ip) = msg.get("ip").and_then(Value::as_str) {
        if !network.has_peer(ctx.sender_vk()) {
            network.submit(NetworkCommand::Connect {
                vk: ctx.sender_vk().to_string(),
                ip: ip.to_string(),
            });
        }
    }

    let mut reply = latest_fields(network, ACTION_HELLO);
    reply["challenge_response"] = Value::String(network.wallet().sign(challenge.as_bytes()));
    Some(reply)
}

fn get_latest_block(network: &Network, _: &RequestContext, _: &Value) -> Option<Value> {
    Some(latest_fields(network, ACTION_GET_LATEST_BLOCK))
}

fn block_reply(
    network: &Network,
    ctx: &RequestContext,
    msg: &Value,
    action: &str,
    lookup: fn(&Network, &BlockQuery) -> DbResult<Option<Block>>,
) -> Option<Value> {
    let Some(query) = parse_block_query(msg) else {
        debug!(peer = %ctx.sender_vk(), action, "block request without block_num or hlc_timestamp");
        return Some(json!({ "response": action, "block_info": Value::Null }));
    };
    let block = match lookup(network, &query) {
        Ok(block) => block,
        Err(err) => {
            warn!(action, error = %err, "block lookup failed");
            None
        }
    };
    let block_info = block
        .map(|b| b.without_genesis_state())
        .and_then(|b| serde_json::to_value(b).ok())
        .unwrap_or(Value::Null);
    Some(json!({ "response": action, "block_info": block_info }))
}

fn get_block(network: &Network, ctx: &RequestContext, msg: &Value) -> Option<Value> {
    block_reply(network, ctx, msg, ACTION_GET_BLOCK, |n, q| n.storage().get_block(q))
}

fn get_next_block(network: &Network, ctx: &RequestContext, msg: &Value) -> Option<Value> {
    block_reply(network, ctx, msg, ACTION_GET_NEXT_BLOCK, |n, q| {
        n.storage().get_next_block(q)
    })
}

fn get_prev_block(network: &Network, ctx: &RequestContext, msg: &Value) -> Option<Value> {
    block_reply(network, ctx, msg, ACTION_GET_PREV_BLOCK, |n, q| {
        n.storage().get_previous_block(q)
    })
}

fn get_network_map(network: &Network, _: &RequestContext, _: &Value) -> Option<Value> {
    Some(json!({
        "response": ACTION_GET_NETWORK_MAP,
        "network_map": network.get_network_map(),
    }))
}

/// The sender produced `block_num` on top of `previous_block_num`. If we
/// hold a block between the two, they skipped it; say which.
fn gossip_new_block(network: &Network, ctx: &RequestContext, msg: &Value) -> Option<Value> {
    let (Some(block_num), Some(previous)) = (
        msg.get("block_num").and_then(Value::as_u64),
        msg.get("previous_block_num").and_then(Value::as_u64),
    ) else {
        debug!(peer = %ctx.sender_vk(), "malformed gossip_new_block");
        return None;
    };

    let missing = match network.storage().get_next_block(&BlockQuery::Number(previous)) {
        Ok(Some(next)) if next.number < block_num => Some(next.number),
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "gossip lookup failed");
            None
        }
    };
    debug!(peer = %ctx.sender_vk(), block_num, previous, ?missing, "block gossip");
    Some(json!({ "response": ACTION_GOSSIP_NEW_BLOCK, "missing_block": missing }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::crypto::keys::Wallet;
    use crate::crypto::signatures::verify;
    use crate::network::credentials::CredentialsProvider;
    use crate::network::router::Identity;
    use crate::storage::{BlockStorage, BlockStore, ContractDriver, StateChange};
    use std::sync::Arc;

    fn fixture() -> (Arc<Network>, Arc<BlockStore>) {
        let storage = Arc::new(BlockStore::open_temporary().unwrap());
        let network = Network::new(
            Arc::new(Wallet::generate()),
            NetworkConfig::local(19000),
            Arc::new(CredentialsProvider::new(false)),
            storage.clone(),
            Arc::new(ContractDriver::open_temporary().unwrap()),
        );
        (network, storage)
    }

    fn ctx(vk: &str) -> RequestContext {
        RequestContext {
            identity: Identity {
                vk: vk.to_string(),
                connection_id: 1,
            },
            remote_addr: "127.0.0.1:5000".parse().unwrap(),
        }
    }

    fn store_chain(storage: &BlockStore, numbers: &[u64]) {
        let mut parent = Block::genesis(
            "2026-01-01T00:00:00.000000000Z_0",
            vec![StateChange::new("masternodes.S:members", json!(["x"]))],
        );
        storage.store_block(&parent).unwrap();
        for n in 1..=*numbers.iter().max().unwrap_or(&0) {
            let block = Block::new(&parent, format!("2026-01-01T00:00:{n:02}.000000000Z_0"), None, vec![]);
            if numbers.contains(&n) {
                storage.store_block(&block).unwrap();
            }
            parent = block;
        }
    }

    #[tokio::test]
    async fn table_serves_every_action() {
        let table = build_service_table();
        assert_eq!(
            table.actions(),
            vec![
                "get_block",
                "get_latest_block",
                "get_network_map",
                "get_next_block",
                "get_prev_block",
                "gossip_new_block",
                "hello",
                "ping",
            ]
        );
        let (network, _) = fixture();
        let reply = table
            .dispatch(&network, &ctx("a"), &json!({"action": "ping", "request_id": "1"}))
            .unwrap();
        assert_eq!(reply, json!({"response": "ping", "request_id": "1"}));
    }

    #[tokio::test]
    async fn hello_signs_the_challenge() {
        let (network, storage) = fixture();
        store_chain(&storage, &[1, 2]);

        let reply = hello(&network, &ctx("a"), &json!({"challenge": "c0ffee"})).unwrap();
        assert_eq!(reply["response"], "hello");
        assert_eq!(reply["latest_block_number"], 2);
        let sig = reply["challenge_response"].as_str().unwrap();
        assert!(verify(&network.vk(), b"c0ffee", sig));

        assert!(hello(&network, &ctx("a"), &json!({})).is_none());
    }

    #[tokio::test]
    async fn genesis_state_is_never_served() {
        let (network, storage) = fixture();
        store_chain(&storage, &[1]);

        let reply = get_block(&network, &ctx("a"), &json!({"block_num": 0})).unwrap();
        assert_eq!(reply["block_info"]["number"], 0);
        assert!(reply["block_info"].get("genesis").is_none());

        let reply = get_prev_block(&network, &ctx("a"), &json!({"block_num": 1})).unwrap();
        assert_eq!(reply["block_info"]["number"], 0);
        assert!(reply["block_info"].get("genesis").is_none());

        let reply = get_next_block(&network, &ctx("a"), &json!({"block_num": 1})).unwrap();
        assert!(reply["block_info"].is_null());
    }

    #[tokio::test]
    async fn gossip_reports_skipped_block() {
        let (network, storage) = fixture();
        store_chain(&storage, &[1, 2, 3]);

        // Sender went 1 -> 4; we hold 2.
        let reply = gossip_new_block(
            &network,
            &ctx("a"),
            &json!({"block_num": 4, "previous_block_num": 1}),
        )
        .unwrap();
        assert_eq!(reply["missing_block"], 2);

        let reply = gossip_new_block(
            &network,
            &ctx("a"),
            &json!({"block_num": 4, "previous_block_num": 3}),
        )
        .unwrap();
        assert!(reply["missing_block"].is_null());

        assert!(gossip_new_block(&network, &ctx("a"), &json!({"block_num": 4})).is_none());
    }
}

//! Message shapes shared by the router services, the dealer and the
//! publisher. Everything on the wire is a JSON object; these helpers keep the
//! field names in one place.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::storage::BlockQuery;

// Router actions.
pub const ACTION_PING: &str = "ping";
pub const ACTION_HELLO: &str = "hello";
pub const ACTION_GET_LATEST_BLOCK: &str = "get_latest_block";
pub const ACTION_GET_BLOCK: &str = "get_block";
pub const ACTION_GET_NEXT_BLOCK: &str = "get_next_block";
pub const ACTION_GET_PREV_BLOCK: &str = "get_prev_block";
pub const ACTION_GET_NETWORK_MAP: &str = "get_network_map";
pub const ACTION_GOSSIP_NEW_BLOCK: &str = "gossip_new_block";

// Publisher topics.
pub const TOPIC_NEW_PEER_CONNECTION: &str = "new_peer_connection";
pub const TOPIC_SHUTDOWN: &str = "shutdown";

/// Correlation field the dealer stamps on requests and the router echoes.
pub const REQUEST_ID: &str = "request_id";

/// Build a request: `{"action": action, ...fields}`.
pub fn request(action: &str, fields: Value) -> Value {
    let mut map = match fields {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    map.insert("action".into(), Value::String(action.into()));
    Value::Object(map)
}

/// Request fields for a block lookup.
pub fn block_query_fields(query: &BlockQuery) -> Value {
    match query {
        BlockQuery::Number(number) => json!({ "block_num": number }),
        BlockQuery::Hlc(hlc) => json!({ "hlc_timestamp": hlc }),
    }
}

/// Parse the lookup a caller asked for. `block_num` wins if both are present.
pub fn parse_block_query(msg: &Value) -> Option<BlockQuery> {
    if let Some(number) = msg.get("block_num").and_then(Value::as_u64) {
        return Some(BlockQuery::Number(number));
    }
    msg.get("hlc_timestamp")
        .and_then(Value::as_str)
        .map(|hlc| BlockQuery::Hlc(hlc.to_string()))
}

/// Last-reported chain head of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestBlockInfo {
    pub number: u64,
    pub hlc_timestamp: String,
}

impl LatestBlockInfo {
    /// Pull `latest_block_number`/`latest_hlc_timestamp` out of a reply.
    pub fn from_response(msg: &Value) -> Option<Self> {
        Some(Self {
            number: msg.get("latest_block_number")?.as_u64()?,
            hlc_timestamp: msg
                .get("latest_hlc_timestamp")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Things a publisher broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Announcement {
    NewPeerConnection { vk: String, ip: String },
    Shutdown,
}

impl Announcement {
    pub fn topic(&self) -> &'static str {
        match self {
            Announcement::NewPeerConnection { .. } => TOPIC_NEW_PEER_CONNECTION,
            Announcement::Shutdown => TOPIC_SHUTDOWN,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Announcement::NewPeerConnection { vk, ip } => json!({ "vk": vk, "ip": ip }),
            Announcement::Shutdown => json!({}),
        }
    }

    /// Parse a published frame `{"topic": .., "msg": ..}`.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(frame).ok()?;
        let msg = value.get("msg")?;
        match value.get("topic")?.as_str()? {
            TOPIC_NEW_PEER_CONNECTION => Some(Announcement::NewPeerConnection {
                vk: msg.get("vk")?.as_str()?.to_string(),
                ip: msg.get("ip")?.as_str()?.to_string(),
            }),
            TOPIC_SHUTDOWN => Some(Announcement::Shutdown),
            _ => None,
        }
    }
}

/// Work for the network's command loop. Peers, router services and
/// subscribers never mutate the peer map directly; they ask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCommand {
    /// Admit and connect to a node we just heard about.
    Connect { vk: String, ip: String },
    /// Tear down a peer (shutdown announcement, ping strikes).
    Remove { vk: String },
    /// A peer finished its hello; tell our subscribers about it.
    PeerConnected { vk: String, ip: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_merges_action() {
        let req = request(ACTION_HELLO, json!({"ip": "127.0.0.1:19000", "challenge": "abc"}));
        assert_eq!(req["action"], "hello");
        assert_eq!(req["challenge"], "abc");
        assert_eq!(request(ACTION_PING, Value::Null)["action"], "ping");
    }

    #[test]
    fn block_query_fields_round_trip() {
        for query in [BlockQuery::Number(7), BlockQuery::Hlc("x_0".into())] {
            let fields = block_query_fields(&query);
            assert_eq!(parse_block_query(&fields), Some(query));
        }
        assert_eq!(parse_block_query(&json!({})), None);
        assert_eq!(parse_block_query(&json!({"block_num": "seven"})), None);
    }

    #[test]
    fn announcements_decode() {
        let frame = serde_json::to_vec(&json!({
            "topic": TOPIC_NEW_PEER_CONNECTION,
            "msg": {"vk": "ab", "ip": "10.0.0.1:19000"},
        }))
        .unwrap();
        assert_eq!(
            Announcement::decode(&frame),
            Some(Announcement::NewPeerConnection {
                vk: "ab".into(),
                ip: "10.0.0.1:19000".into()
            })
        );

        let frame = serde_json::to_vec(&json!({"topic": "shutdown", "msg": {}})).unwrap();
        assert_eq!(Announcement::decode(&frame), Some(Announcement::Shutdown));

        let frame = serde_json::to_vec(&json!({"topic": "weather", "msg": {}})).unwrap();
        assert_eq!(Announcement::decode(&frame), None);
        assert_eq!(Announcement::decode(b"not json"), None);
    }

    #[test]
    fn latest_info_requires_a_number() {
        let ok = json!({"latest_block_number": 3, "latest_hlc_timestamp": "t_0"});
        assert_eq!(
            LatestBlockInfo::from_response(&ok),
            Some(LatestBlockInfo {
                number: 3,
                hlc_timestamp: "t_0".into()
            })
        );
        assert_eq!(LatestBlockInfo::from_response(&json!({})), None);
    }
}

//! # Block Structure
//!
//! A block here is one processed transaction plus the state it changed,
//! chained to its parent by hash.
//!
//! ## Block Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  number: u64                                     │
//! │  hash: hex BLAKE3 of the hashed body             │
//! │  previous: hash of block number - 1              │
//! │  hlc_timestamp: "…Z_counter"                     │
//! │  processed: Option<ProcessedTransaction>         │
//! │  ├── transaction.payload (sender, nonce, …)      │
//! │  └── state: [{key, value}]                       │
//! │  rewards: [{key, value}]                         │
//! │  origin: Option<{signer, signature}>             │
//! │  genesis: Option<[{key, value}]>   (block 0 only)│
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Hash Computation
//!
//! The hash covers `number`, `previous`, `hlc_timestamp`, `processed` and
//! `rewards`, serialized as JSON. `serde_json` maps are sorted, so the
//! encoding is canonical. `origin` signs the hash and cannot be part of it.
//! `genesis` is excluded so that the genesis allocation can be stripped
//! before a block goes on the wire without changing its identity.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypto::hash::{blake3_hex, is_hash_hex, ZERO_HASH};
use crate::crypto::keys::Wallet;
use crate::crypto::signatures::verify;

// ---------------------------------------------------------------------------
// Payload Types
// ---------------------------------------------------------------------------

/// A single `key = value` write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub key: String,
    pub value: Value,
}

impl StateChange {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// What the sender asked for. Contract semantics live elsewhere; the
/// network layer only cares about `sender`, `processor` and `nonce`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    pub sender: String,
    pub processor: String,
    pub nonce: u64,
    pub contract: String,
    pub function: String,
    #[serde(default)]
    pub kwargs: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub payload: TransactionPayload,
    #[serde(default)]
    pub signature: String,
}

/// A transaction after execution: the state it wrote and how it went.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTransaction {
    pub transaction: Transaction,
    #[serde(default)]
    pub state: Vec<StateChange>,
    #[serde(default)]
    pub status: i32,
    #[serde(default)]
    pub stamps_used: u64,
}

/// Who produced the block, and their signature over its hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOrigin {
    pub signer: String,
    pub signature: String,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub previous: String,
    pub hlc_timestamp: String,
    #[serde(default)]
    pub processed: Option<ProcessedTransaction>,
    #[serde(default)]
    pub rewards: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<BlockOrigin>,
    /// Initial state allocation. Only ever present on the locally stored
    /// genesis block; stripped before transmission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genesis: Option<Vec<StateChange>>,
}

/// The slice of a block that the hash commits to.
#[derive(Serialize)]
struct HashedBody<'a> {
    number: u64,
    previous: &'a str,
    hlc_timestamp: &'a str,
    processed: &'a Option<ProcessedTransaction>,
    rewards: &'a [StateChange],
}

impl Block {
    /// Block 0: no parent, no transaction, just the initial state.
    pub fn genesis(hlc_timestamp: impl Into<String>, state: Vec<StateChange>) -> Self {
        let mut block = Block {
            number: 0,
            hash: String::new(),
            previous: ZERO_HASH.to_string(),
            hlc_timestamp: hlc_timestamp.into(),
            processed: None,
            rewards: Vec::new(),
            origin: None,
            genesis: Some(state),
        };
        block.hash = block.compute_hash();
        block
    }

    /// The block that follows `parent`.
    pub fn new(
        parent: &Block,
        hlc_timestamp: impl Into<String>,
        processed: Option<ProcessedTransaction>,
        rewards: Vec<StateChange>,
    ) -> Self {
        let mut block = Block {
            number: parent.number + 1,
            hash: String::new(),
            previous: parent.hash.clone(),
            hlc_timestamp: hlc_timestamp.into(),
            processed,
            rewards,
            origin: None,
            genesis: None,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn compute_hash(&self) -> String {
        let body = HashedBody {
            number: self.number,
            previous: &self.previous,
            hlc_timestamp: &self.hlc_timestamp,
            processed: &self.processed,
            rewards: &self.rewards,
        };
        // Serializing plain structs, strings and `Value`s cannot fail.
        let encoded = serde_json::to_vec(&body).unwrap_or_default();
        blake3_hex(&encoded)
    }

    /// Attach the producer's signature over the hash.
    pub fn sign(&mut self, wallet: &Wallet) {
        self.origin = Some(BlockOrigin {
            signer: wallet.verifying_key(),
            signature: wallet.sign(self.hash.as_bytes()),
        });
    }

    /// Structural integrity: well-formed hash that matches the body, and a
    /// valid producer signature when one is attached.
    pub fn verify(&self) -> bool {
        if !is_hash_hex(&self.hash) || !is_hash_hex(&self.previous) {
            return false;
        }
        if self.hash != self.compute_hash() {
            return false;
        }
        match &self.origin {
            Some(origin) => verify(&origin.signer, self.hash.as_bytes(), &origin.signature),
            None => true,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.number == 0
    }

    /// Copy of this block suitable for sending to a peer.
    pub fn without_genesis_state(&self) -> Block {
        Block {
            genesis: None,
            ..self.clone()
        }
    }

    /// Every write this block makes, state changes first, then rewards.
    pub fn state_changes(&self) -> impl Iterator<Item = &StateChange> {
        self.genesis
            .iter()
            .flatten()
            .chain(self.processed.iter().flat_map(|p| p.state.iter()))
            .chain(self.rewards.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn processed(sender: &str, nonce: u64) -> ProcessedTransaction {
        ProcessedTransaction {
            transaction: Transaction {
                payload: TransactionPayload {
                    sender: sender.into(),
                    processor: "proc".into(),
                    nonce,
                    contract: "currency".into(),
                    function: "transfer".into(),
                    kwargs: json!({"amount": 5, "to": "bob"}),
                },
                signature: String::new(),
            },
            state: vec![StateChange::new("currency.balances:bob", json!(5))],
            status: 0,
            stamps_used: 1,
        }
    }

    #[test]
    fn genesis_has_zero_previous_and_verifies() {
        let g = Block::genesis("1970-01-01T00:00:00.000000000Z_0", vec![]);
        assert!(g.is_genesis());
        assert_eq!(g.previous, ZERO_HASH);
        assert!(g.verify());
    }

    #[test]
    fn child_links_to_parent() {
        let g = Block::genesis("1970-01-01T00:00:00.000000000Z_0", vec![]);
        let b1 = Block::new(&g, "1970-01-01T00:00:01.000000000Z_0", Some(processed("alice", 0)), vec![]);
        assert_eq!(b1.number, 1);
        assert_eq!(b1.previous, g.hash);
        assert!(b1.verify());
    }

    #[test]
    fn genesis_state_does_not_affect_hash() {
        let g = Block::genesis(
            "1970-01-01T00:00:00.000000000Z_0",
            vec![StateChange::new("masternodes.S:members", json!(["a", "b"]))],
        );
        let stripped = g.without_genesis_state();
        assert!(stripped.genesis.is_none());
        assert_eq!(stripped.hash, g.hash);
        assert!(stripped.verify());

        let wire = serde_json::to_value(&stripped).unwrap();
        assert!(wire.get("genesis").is_none());
    }

    #[test]
    fn tampering_breaks_verification() {
        let g = Block::genesis("1970-01-01T00:00:00.000000000Z_0", vec![]);
        let mut b1 = Block::new(&g, "1970-01-01T00:00:01.000000000Z_0", Some(processed("alice", 0)), vec![]);
        b1.rewards.push(StateChange::new("currency.balances:mallory", json!(1_000_000)));
        assert!(!b1.verify());
    }

    #[test]
    fn signature_is_checked() {
        let wallet = Wallet::generate();
        let g = Block::genesis("1970-01-01T00:00:00.000000000Z_0", vec![]);
        let mut b1 = Block::new(&g, "1970-01-01T00:00:01.000000000Z_0", None, vec![]);
        b1.sign(&wallet);
        assert!(b1.verify());

        let impostor = Wallet::generate();
        b1.origin.as_mut().unwrap().signer = impostor.verifying_key();
        assert!(!b1.verify());
    }

    #[test]
    fn state_changes_include_rewards() {
        let g = Block::genesis("1970-01-01T00:00:00.000000000Z_0", vec![]);
        let b1 = Block::new(
            &g,
            "1970-01-01T00:00:01.000000000Z_0",
            Some(processed("alice", 0)),
            vec![StateChange::new("currency.balances:proc", json!(1))],
        );
        let keys: Vec<_> = b1.state_changes().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["currency.balances:bob", "currency.balances:proc"]);
    }
}

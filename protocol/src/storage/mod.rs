//! # Storage Module
//!
//! The persistence collaborators the network layer leans on: finalized blocks,
//! contract state, and per-sender nonces.
//!
//! ## Architecture
//!
//! ```text
//! block.rs  — Block structure, hashing, genesis
//! hlc.rs    — Hybrid logical clock timestamps
//! db.rs     — sled-backed BlockStore (+ ChainDb, which opens everything)
//! state.rs  — ContractDriver (versioned state) and NonceStore
//! ```
//!
//! The network layer only sees the traits below. Catchup and the router
//! services are written against `BlockStorage`, `StateDriver` and
//! `NonceStorage`, which keeps them testable against anything that can hold
//! a few blocks.
//!
//! ## Design Decisions
//!
//! 1. **sled everywhere.** One embedded database, one tree per concern.
//!    Block numbers are big-endian keys so iteration order is chain order.
//!
//! 2. **Synchronous traits.** sled calls are short and never touch the
//!    network; router handlers are synchronous too.
//!
//! 3. **Safe-set is a storage guarantee.** The highest block number written
//!    for a key wins no matter what order writers arrive in. That check lives
//!    in an atomic read-modify-write, not in the caller.

pub mod block;
pub mod db;
pub mod hlc;
pub mod state;

use serde_json::Value;

pub use block::{
    Block, BlockOrigin, ProcessedTransaction, StateChange, Transaction, TransactionPayload,
};
pub use db::{BlockStore, ChainDb, DbError, DbResult};
pub use hlc::HlcTimestamp;
pub use state::{ContractDriver, NonceStore};

/// How a caller names a block: by number or by HLC timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockQuery {
    Number(u64),
    Hlc(String),
}

/// Finalized block persistence.
pub trait BlockStorage: Send + Sync {
    fn get_block(&self, query: &BlockQuery) -> DbResult<Option<Block>>;

    /// First block strictly after the queried position.
    fn get_next_block(&self, query: &BlockQuery) -> DbResult<Option<Block>>;

    /// Last block strictly before the queried position.
    fn get_previous_block(&self, query: &BlockQuery) -> DbResult<Option<Block>>;

    fn is_genesis_block(&self, block: &Block) -> bool {
        block.is_genesis()
    }

    fn store_block(&self, block: &Block) -> DbResult<()>;

    /// Height of the chain head; 0 when nothing is stored.
    fn get_latest_block_number(&self) -> DbResult<u64>;

    fn get_latest_block(&self) -> DbResult<Option<Block>>;
}

/// Contract state.
pub trait StateDriver: Send + Sync {
    fn get(&self, key: &str) -> DbResult<Option<Value>>;

    /// Unconditional write.
    fn set(&self, key: &str, value: &Value) -> DbResult<()>;

    /// Write tagged with `block_num`. Refuses (returns `false`) when the key
    /// already holds a value from a later block.
    fn safe_set(&self, key: &str, value: &Value, block_num: u64) -> DbResult<bool>;

    /// Read `contract.variable[:arg1[:arg2...]]`.
    fn get_var(&self, contract: &str, variable: &str, arguments: &[&str]) -> DbResult<Option<Value>> {
        self.get(&state_key(contract, variable, arguments))
    }
}

/// Nonce bookkeeping per `(sender, processor)`.
pub trait NonceStorage: Send + Sync {
    fn get_nonce(&self, sender: &str, processor: &str) -> DbResult<Option<u64>>;

    /// Raise the stored nonce to `value`. Never lowers it.
    fn safe_set_nonce(&self, sender: &str, processor: &str, value: u64) -> DbResult<bool>;
}

/// Build the flat state key for a contract variable.
pub fn state_key(contract: &str, variable: &str, arguments: &[&str]) -> String {
    let mut key = format!("{contract}.{variable}");
    for arg in arguments {
        key.push(':');
        key.push_str(arg);
    }
    key
}

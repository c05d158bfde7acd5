//! # BlockStore — Persistent Block Storage
//!
//! The finalized-block half of the node's sled database.
//!
//! ## Tree Layout
//!
//! | Tree        | Key                          | Value                |
//! |-------------|------------------------------|----------------------|
//! | `blocks`    | `number` (8B BE)             | `json(Block)`        |
//! | `block_hlc` | `HlcTimestamp::index_key()`  | `number` (8B BE)     |
//! | `state`     | state key (UTF-8)            | `bincode(Versioned)` |
//! | `nonces`    | `sender:processor` (UTF-8)   | `nonce` (8B BE)      |
//!
//! Block numbers are stored big-endian so sled's lexicographic ordering is
//! numeric ordering: `last()` is the chain head and `get_lt`/`get_gt` are
//! previous/next.
//!
//! Blocks are stored as JSON rather than bincode because they carry
//! arbitrary `serde_json::Value` state, which bincode can't round-trip.
//!
//! ## Atomicity
//!
//! A block and its HLC index entry are written in one sled transaction.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use tracing::{debug, warn};

use super::block::Block;
use super::hlc::HlcTimestamp;
use super::state::{ContractDriver, NonceStore};
use super::{BlockQuery, BlockStorage};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt record in tree {tree}: {detail}")]
    Corrupt { tree: &'static str, detail: String },
}

pub type DbResult<T> = Result<T, DbError>;

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for DbError {
    fn from(err: bincode::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// ChainDb
// ---------------------------------------------------------------------------

/// One sled database, every store the node needs.
#[derive(Debug, Clone)]
pub struct ChainDb {
    db: Db,
    pub blocks: BlockStore,
    pub state: ContractDriver,
    pub nonces: NonceStore,
}

impl ChainDb {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory database removed on drop. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            blocks: BlockStore::from_db(&db)?,
            state: ContractDriver::from_db(&db)?,
            nonces: NonceStore::from_db(&db)?,
            db,
        })
    }

    /// Flush dirty pages to disk. sled flushes periodically on its own;
    /// call this before a clean shutdown.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BlockStore
// ---------------------------------------------------------------------------

/// sled-backed [`BlockStorage`]. Cheap to clone; clones share the trees.
#[derive(Debug, Clone)]
pub struct BlockStore {
    blocks: Tree,
    block_hlc: Tree,
}

impl BlockStore {
    pub fn from_db(db: &Db) -> DbResult<Self> {
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            block_hlc: db.open_tree("block_hlc")?,
        })
    }

    /// Standalone in-memory store.
    pub fn open_temporary() -> DbResult<Self> {
        Self::from_db(&sled::Config::new().temporary(true).open()?)
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    fn decode_block(bytes: &[u8]) -> DbResult<Block> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn decode_number(bytes: &[u8], tree: &'static str) -> DbResult<u64> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| DbError::Corrupt {
            tree,
            detail: format!("expected 8-byte block number, got {} bytes", bytes.len()),
        })?;
        Ok(u64::from_be_bytes(arr))
    }

    fn block_by_number(&self, number: u64) -> DbResult<Option<Block>> {
        self.blocks
            .get(number.to_be_bytes())?
            .map(|bytes| Self::decode_block(&bytes))
            .transpose()
    }

    /// Resolve an HLC query to its index key. Unparseable timestamps simply
    /// match nothing.
    fn hlc_key(hlc: &str) -> Option<[u8; 12]> {
        hlc.parse::<HlcTimestamp>().ok().map(|ts| ts.index_key())
    }

    fn block_from_hlc_entry(&self, entry: Option<(sled::IVec, sled::IVec)>) -> DbResult<Option<Block>> {
        match entry {
            Some((_, number)) => {
                let number = Self::decode_number(&number, "block_hlc")?;
                self.block_by_number(number)
            }
            None => Ok(None),
        }
    }
}

impl BlockStorage for BlockStore {
    fn get_block(&self, query: &BlockQuery) -> DbResult<Option<Block>> {
        match query {
            BlockQuery::Number(number) => self.block_by_number(*number),
            BlockQuery::Hlc(hlc) => match Self::hlc_key(hlc) {
                Some(key) => match self.block_hlc.get(key)? {
                    Some(number) => {
                        self.block_by_number(Self::decode_number(&number, "block_hlc")?)
                    }
                    None => Ok(None),
                },
                None => Ok(None),
            },
        }
    }

    fn get_next_block(&self, query: &BlockQuery) -> DbResult<Option<Block>> {
        match query {
            BlockQuery::Number(number) => self
                .blocks
                .get_gt(number.to_be_bytes())?
                .map(|(_, bytes)| Self::decode_block(&bytes))
                .transpose(),
            BlockQuery::Hlc(hlc) => match Self::hlc_key(hlc) {
                Some(key) => self.block_from_hlc_entry(self.block_hlc.get_gt(key)?),
                None => Ok(None),
            },
        }
    }

    fn get_previous_block(&self, query: &BlockQuery) -> DbResult<Option<Block>> {
        match query {
            BlockQuery::Number(number) => self
                .blocks
                .get_lt(number.to_be_bytes())?
                .map(|(_, bytes)| Self::decode_block(&bytes))
                .transpose(),
            BlockQuery::Hlc(hlc) => match Self::hlc_key(hlc) {
                Some(key) => self.block_from_hlc_entry(self.block_hlc.get_lt(key)?),
                None => Ok(None),
            },
        }
    }

    fn store_block(&self, block: &Block) -> DbResult<()> {
        let number_key = block.number.to_be_bytes();
        let encoded = serde_json::to_vec(block)?;
        let hlc_key = Self::hlc_key(&block.hlc_timestamp);
        if hlc_key.is_none() {
            warn!(
                block = block.number,
                hlc = %block.hlc_timestamp,
                "block has an unparseable HLC timestamp; not indexing it"
            );
        }

        (&self.blocks, &self.block_hlc)
            .transaction(|(blocks, block_hlc)| {
                blocks.insert(&number_key[..], encoded.as_slice())?;
                if let Some(key) = &hlc_key {
                    block_hlc.insert(&key[..], &number_key[..])?;
                }
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|err| match err {
                TransactionError::Storage(err) => DbError::Sled(err),
                TransactionError::Abort(()) => DbError::Serialization("block write aborted".into()),
            })?;

        debug!(block = block.number, hash = %block.hash, "block stored");
        Ok(())
    }

    fn get_latest_block_number(&self) -> DbResult<u64> {
        match self.blocks.last()? {
            Some((key, _)) => Self::decode_number(&key, "blocks"),
            None => Ok(0),
        }
    }

    fn get_latest_block(&self) -> DbResult<Option<Block>> {
        self.blocks
            .last()?
            .map(|(_, bytes)| Self::decode_block(&bytes))
            .transpose()
    }
}

//! # Contract State & Nonces
//!
//! [`ContractDriver`] is the key/value state that blocks write into, with
//! one twist: every value remembers which block wrote it. Catchup walks the
//! chain backwards, so it writes block 10's state before block 9's. A naive
//! `set` would leave the key holding block 9's (older) value. `safe_set`
//! refuses that write.
//!
//! The comparison and the write happen inside sled's `update_and_fetch`,
//! a compare-and-swap loop, so two concurrent writers can't interleave a
//! stale read with a fresh write.
//!
//! [`NonceStore`] applies the same idea to `(sender, processor)` nonces:
//! they only ever go up.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sled::{Db, Tree};

use super::db::{DbError, DbResult};
use super::{NonceStorage, StateDriver};

/// On-disk state record. `value` is JSON text because bincode cannot
/// encode `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VersionedValue {
    block_num: u64,
    value: String,
}

impl VersionedValue {
    fn decode(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// ContractDriver
// ---------------------------------------------------------------------------

/// sled-backed [`StateDriver`].
#[derive(Debug, Clone)]
pub struct ContractDriver {
    state: Tree,
}

impl ContractDriver {
    pub fn from_db(db: &Db) -> DbResult<Self> {
        Ok(Self {
            state: db.open_tree("state")?,
        })
    }

    pub fn open_temporary() -> DbResult<Self> {
        Self::from_db(&sled::Config::new().temporary(true).open()?)
    }
}

impl StateDriver for ContractDriver {
    fn get(&self, key: &str) -> DbResult<Option<Value>> {
        let Some(bytes) = self.state.get(key.as_bytes())? else {
            return Ok(None);
        };
        let record = VersionedValue::decode(&bytes).ok_or_else(|| DbError::Corrupt {
            tree: "state",
            detail: format!("undecodable record for key {key}"),
        })?;
        Ok(Some(serde_json::from_str(&record.value)?))
    }

    fn set(&self, key: &str, value: &Value) -> DbResult<()> {
        let record = VersionedValue {
            block_num: 0,
            value: serde_json::to_string(value)?,
        };
        self.state
            .insert(key.as_bytes(), bincode::serialize(&record)?)?;
        Ok(())
    }

    fn safe_set(&self, key: &str, value: &Value, block_num: u64) -> DbResult<bool> {
        let encoded = bincode::serialize(&VersionedValue {
            block_num,
            value: serde_json::to_string(value)?,
        })?;

        let mut applied = false;
        self.state.update_and_fetch(key.as_bytes(), |current| {
            // May run more than once under contention; decide afresh each time.
            match current {
                Some(bytes)
                    if VersionedValue::decode(bytes)
                        .map_or(false, |existing| existing.block_num > block_num) =>
                {
                    applied = false;
                    Some(bytes.to_vec())
                }
                _ => {
                    applied = true;
                    Some(encoded.clone())
                }
            }
        })?;
        Ok(applied)
    }
}

// ---------------------------------------------------------------------------
// NonceStore
// ---------------------------------------------------------------------------

/// sled-backed [`NonceStorage`].
#[derive(Debug, Clone)]
pub struct NonceStore {
    nonces: Tree,
}

impl NonceStore {
    pub fn from_db(db: &Db) -> DbResult<Self> {
        Ok(Self {
            nonces: db.open_tree("nonces")?,
        })
    }

    pub fn open_temporary() -> DbResult<Self> {
        Self::from_db(&sled::Config::new().temporary(true).open()?)
    }

    fn key(sender: &str, processor: &str) -> String {
        format!("{sender}:{processor}")
    }

    fn decode(bytes: &[u8]) -> Option<u64> {
        <[u8; 8]>::try_from(bytes).ok().map(u64::from_be_bytes)
    }
}

impl NonceStorage for NonceStore {
    fn get_nonce(&self, sender: &str, processor: &str) -> DbResult<Option<u64>> {
        Ok(self
            .nonces
            .get(Self::key(sender, processor))?
            .and_then(|bytes| Self::decode(&bytes)))
    }

    fn safe_set_nonce(&self, sender: &str, processor: &str, value: u64) -> DbResult<bool> {
        let mut applied = false;
        self.nonces
            .update_and_fetch(Self::key(sender, processor), |current| {
                match current.and_then(Self::decode) {
                    Some(existing) if existing >= value => {
                        applied = false;
                        Some(existing.to_be_bytes().to_vec())
                    }
                    _ => {
                        applied = true;
                        Some(value.to_be_bytes().to_vec())
                    }
                }
            })?;
        Ok(applied)
    }
}

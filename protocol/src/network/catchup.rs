//! # Catchup
//!
//! Brings a node's chain up to the network's head without trusting any
//! single peer.
//!
//! ## Algorithm
//!
//! 1. Ask every catchup peer for its latest block. Tally answers by hash and
//!    take the first hash backed by a majority (`ceil(51% of N)`, N being the
//!    number of peers asked). Peers that time out or send a block that fails
//!    verification are dropped for the rest of the run.
//! 2. If that block is not above our height, we are done.
//! 3. Otherwise walk backwards from it: source "the block before the
//!    current one" the same way and check that its hash is what the current
//!    block says its parent is. The walk stops at our pre-catchup height
//!    (whose hash must match what we already have) or at genesis.
//! 4. Commit the walked blocks oldest-first. A walk that fails anywhere
//!    commits nothing, so the stored chain never has holes.
//!
//! `safe_set` still guards every state write, so a block applied out of
//! order can never overwrite a newer block's value.
//!
//! ## Not waiting on stragglers
//!
//! Each round fans out one future per peer through `FuturesUnordered` and
//! returns the moment a majority agrees. A peer that never answers costs
//! nothing once the others have spoken.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::CATCHUP_MAJORITY_PERCENT;
use crate::storage::{Block, BlockQuery, BlockStorage, DbError, NonceStorage, StateDriver};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Anything that can hand us blocks. Implemented by [`super::peer::Peer`].
#[async_trait]
pub trait BlockSource: Send + Sync {
    fn vk(&self) -> &str;

    async fn get_latest_block(&self) -> Option<Block>;

    /// The block immediately before `number`.
    async fn get_previous_block(&self, number: u64) -> Option<Block>;
}

/// What catchup needs from the network.
pub trait CatchupNetwork: Send + Sync {
    /// Connected peers to query.
    fn catchup_peers(&self) -> Vec<Arc<dyn BlockSource>>;

    /// Recompute the approved committee (blocks may have changed it).
    fn refresh_approved_peers(&self);
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchType {
    Latest,
    /// The block before the given number.
    Previous(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatchupOutcome {
    NoPeers,
    AlreadyCaughtUp { local: u64, network: u64 },
    CaughtUp { from: u64, to: u64, blocks_applied: usize },
}

#[derive(Debug, Error)]
pub enum CatchupError {
    #[error("no majority among {asked} peers for {fetch:?}")]
    NoConsensus { fetch: FetchType, asked: usize },

    #[error("block {number} does not link: expected hash {expected}, found {found}")]
    ChainLinkage {
        number: u64,
        expected: String,
        found: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Supporters needed out of `n` peers: `ceil(n * 51 / 100)`.
pub fn majority_threshold(n: usize) -> usize {
    (n * CATCHUP_MAJORITY_PERCENT + 99) / 100
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct CatchupHandler {
    network: Arc<dyn CatchupNetwork>,
    storage: Arc<dyn BlockStorage>,
    driver: Arc<dyn StateDriver>,
    nonces: Arc<dyn NonceStorage>,
    request_timeout: Duration,
    allow_list: Option<HashSet<String>>,
    catchup_peers: Vec<Arc<dyn BlockSource>>,
    safe_block_num: u64,
}

impl CatchupHandler {
    pub fn new(
        network: Arc<dyn CatchupNetwork>,
        storage: Arc<dyn BlockStorage>,
        driver: Arc<dyn StateDriver>,
        nonces: Arc<dyn NonceStorage>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            network,
            storage,
            driver,
            nonces,
            request_timeout,
            allow_list: None,
            catchup_peers: Vec::new(),
            safe_block_num: 0,
        }
    }

    /// Only trust these VKs during catchup.
    pub fn with_allow_list<I: IntoIterator<Item = String>>(mut self, vks: I) -> Self {
        self.allow_list = Some(vks.into_iter().collect());
        self
    }

    pub fn catchup_peer_count(&self) -> usize {
        self.catchup_peers.len()
    }

    /// Run one catchup pass. The committee is refreshed afterwards whatever
    /// the result.
    pub async fn run(&mut self) -> Result<CatchupOutcome, CatchupError> {
        let result = self.catchup().await;
        self.network.refresh_approved_peers();
        match &result {
            Ok(outcome) => debug!(?outcome, "catchup finished"),
            Err(err @ CatchupError::ChainLinkage { .. }) => error!(error = %err, "catchup aborted"),
            Err(err) => warn!(error = %err, "catchup failed"),
        }
        result
    }

    async fn catchup(&mut self) -> Result<CatchupOutcome, CatchupError> {
        self.catchup_peers = self
            .network
            .catchup_peers()
            .into_iter()
            .filter(|peer| {
                self.allow_list
                    .as_ref()
                    .map_or(true, |allowed| allowed.contains(peer.vk()))
            })
            .collect();
        if self.catchup_peers.is_empty() {
            info!("no peers to catch up from");
            return Ok(CatchupOutcome::NoPeers);
        }

        self.safe_block_num = self.storage.get_latest_block_number()?;
        let have_local = self.storage.get_latest_block()?.is_some();

        let target = self.source_block_from_peers(FetchType::Latest).await?;
        if have_local && target.number <= self.safe_block_num {
            info!(
                local = self.safe_block_num,
                network = target.number,
                "already caught up"
            );
            return Ok(CatchupOutcome::AlreadyCaughtUp {
                local: self.safe_block_num,
                network: target.number,
            });
        }

        info!(
            from = self.safe_block_num,
            to = target.number,
            peers = self.catchup_peers.len(),
            "catching up"
        );
        // Walk down until the chain meets local history (or genesis), then
        // commit oldest-first. Nothing is written unless the whole walk links.
        let mut staged = vec![target.clone()];
        let mut current = target.clone();

        while !current.is_genesis() {
            let previous = self
                .source_block_from_peers(FetchType::Previous(current.number))
                .await?;
            if previous.hash != current.previous {
                return Err(CatchupError::ChainLinkage {
                    number: previous.number,
                    expected: current.previous.clone(),
                    found: previous.hash,
                });
            }

            if have_local && previous.number <= self.safe_block_num {
                match self.storage.get_block(&BlockQuery::Number(previous.number))? {
                    Some(local) if local.hash == previous.hash => break,
                    Some(local) => {
                        return Err(CatchupError::ChainLinkage {
                            number: previous.number,
                            expected: previous.hash,
                            found: local.hash,
                        })
                    }
                    None => {}
                }
            }

            staged.push(previous.clone());
            current = previous;
        }

        let mut applied = 0;
        for block in staged.iter().rev() {
            applied += usize::from(self.process_block(block)?);
        }

        Ok(CatchupOutcome::CaughtUp {
            from: self.safe_block_num,
            to: target.number,
            blocks_applied: applied,
        })
    }

    /// Ask every catchup peer, return the first block a majority agrees on.
    pub async fn source_block_from_peers(&mut self, fetch: FetchType) -> Result<Block, CatchupError> {
        let asked = self.catchup_peers.len();
        let needed = majority_threshold(asked);
        if asked == 0 {
            return Err(CatchupError::NoConsensus { fetch, asked });
        }

        let timeout = self.request_timeout;
        let mut pending: FuturesUnordered<_> = self
            .catchup_peers
            .iter()
            .cloned()
            .map(|peer| async move {
                let answer = match fetch {
                    FetchType::Latest => tokio::time::timeout(timeout, peer.get_latest_block()).await,
                    FetchType::Previous(n) => {
                        tokio::time::timeout(timeout, peer.get_previous_block(n)).await
                    }
                };
                (peer, answer.ok().flatten())
            })
            .collect();

        let mut tally: HashMap<String, (usize, Block)> = HashMap::new();
        let mut dropped: Vec<String> = Vec::new();
        let mut winner = None;

        while let Some((peer, answer)) = pending.next().await {
            let block = match answer {
                Some(block) if valid_answer(&block, fetch) => block,
                Some(block) => {
                    warn!(peer = %peer.vk(), block = block.number, "peer sent an invalid block");
                    dropped.push(peer.vk().to_string());
                    continue;
                }
                None => {
                    debug!(peer = %peer.vk(), ?fetch, "peer did not answer");
                    dropped.push(peer.vk().to_string());
                    continue;
                }
            };

            let entry = tally
                .entry(block.hash.clone())
                .or_insert_with(|| (0, block));
            entry.0 += 1;
            if entry.0 >= needed {
                winner = Some(entry.1.clone());
                break;
            }
        }

        if !dropped.is_empty() {
            self.catchup_peers
                .retain(|peer| !dropped.iter().any(|vk| vk == peer.vk()));
        }

        match winner {
            Some(block) => {
                debug!(block = block.number, hash = %block.hash, ?fetch, "majority reached");
                Ok(block)
            }
            None => Err(CatchupError::NoConsensus { fetch, asked }),
        }
    }

    /// Apply one block's writes and store it. Returns `false` if the block
    /// was already stored.
    pub fn process_block(&self, block: &Block) -> Result<bool, CatchupError> {
        if self
            .storage
            .get_block(&BlockQuery::Number(block.number))?
            .is_some()
        {
            debug!(block = block.number, "block already stored, skipping");
            return Ok(false);
        }

        for change in block.state_changes() {
            self.driver.safe_set(&change.key, &change.value, block.number)?;
        }
        if let Some(processed) = &block.processed {
            let payload = &processed.transaction.payload;
            self.nonces.safe_set_nonce(
                &payload.sender,
                &payload.processor,
                payload.nonce.saturating_add(1),
            )?;
        }
        self.storage.store_block(block)?;
        debug!(block = block.number, hash = %block.hash, "block applied");
        Ok(true)
    }
}

fn valid_answer(block: &Block, fetch: FetchType) -> bool {
    if !block.verify() {
        return false;
    }
    match fetch {
        FetchType::Latest => true,
        FetchType::Previous(n) => block.number < n,
    }
}

// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Tessera Protocol — Core Library
//!
//! Everything a Tessera node needs to join a permissioned network, find the
//! rest of the committee, and get its chain up to date.
//!
//! ## Architecture
//!
//! - **crypto** — Ed25519 identity with derived X25519 keys, BLAKE3,
//!   AES-256-GCM session ciphers, ephemeral key agreement.
//! - **storage** — Blocks, versioned contract state and nonces over sled,
//!   behind small traits the network layer is written against.
//! - **network** — Authenticated transport, router/publisher, peers,
//!   gossip discovery, majority catch-up, node lifecycle.
//! - **config** — Protocol constants and per-node network configuration.
//!
//! ## Design Philosophy
//!
//! 1. The committee is the source of truth. Admission, discovery and
//!    catch-up all defer to the member lists in contract state.
//! 2. Trust a majority, never a single peer.
//! 3. No global state. Wallet, storage and credentials are handed to
//!    constructors and owned by the network that uses them.

pub mod config;
pub mod crypto;
pub mod network;
pub mod storage;

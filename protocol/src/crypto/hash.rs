//! # Hashing Utilities
//!
//! BLAKE3, and only BLAKE3. Block hashes are hex-encoded BLAKE3 digests of
//! the block's canonical JSON body. Session keys come out of BLAKE3's
//! `derive_key` mode (see [`super::pfs`]).

use crate::config::HASH_OUTPUT_LENGTH;

/// Hash of "nothing": the `previous` field of a genesis block.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// BLAKE3 digest of `data`.
pub fn blake3_hash(data: &[u8]) -> [u8; HASH_OUTPUT_LENGTH] {
    *blake3::hash(data).as_bytes()
}

/// Hex-encoded BLAKE3 digest of `data`.
pub fn blake3_hex(data: &[u8]) -> String {
    hex::encode(blake3_hash(data))
}

/// Is `s` shaped like one of our hashes (64 lowercase hex chars)?
pub fn is_hash_hex(s: &str) -> bool {
    s.len() == HASH_OUTPUT_LENGTH * 2
        && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

//! # Cryptographic Primitives for Tessera
//!
//! Everything security-related in the node flows through here:
//!
//! - **Ed25519** for node identity and challenge signatures.
//! - **X25519** for the transport handshake, derived from the same seed.
//! - **AES-256-GCM** for transport frames.
//! - **BLAKE3** for block hashes and session-key derivation.
//!
//! ## Key material
//!
//! A node has exactly one secret: the 32-byte Ed25519 seed. The X25519 pair
//! used by the handshake is derived from it, so the VK hex string is the
//! only identity peers ever need to know.

pub mod encryption;
pub mod hash;
pub mod keys;
pub mod pfs;
pub mod signatures;

pub use encryption::{CipherState, EncryptionError};
pub use hash::{blake3_hash, blake3_hex, ZERO_HASH};
pub use keys::{curve_vk_from_vk, KeyError, Wallet};
pub use signatures::verify;

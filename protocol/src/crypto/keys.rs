//! # Wallet
//!
//! Ed25519 identity plus the X25519 transport keypair derived from it.
//!
//! Every node has exactly one of these. The Ed25519 verifying key (hex) is
//! the node's name everywhere: in the peer map, the committee list, the
//! credentials provider. The X25519 half authenticates and encrypts the
//! transport.
//!
//! ## Curve key derivation
//!
//! The transport secret is the clamped lower half of `SHA-512(seed)`, which
//! is exactly the scalar Ed25519 signs with. That makes the transport public
//! key the Montgomery form of the Ed25519 public key, so anyone holding a
//! peer's VK can compute the peer's curve key without asking. No second key
//! to distribute, no second key to get out of sync.
//!
//! ## Security considerations
//!
//! - Key bytes are never logged. `Debug` prints the verifying key only.
//! - `Wallet` is not `Serialize`. Exporting a secret should be deliberate.

use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signer, SigningKey, SECRET_KEY_LENGTH};
use rand::rngs::OsRng;
use sha2::{Digest, Sha512};
use std::fmt;
use thiserror::Error;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};

/// Errors that can occur during key operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not hex")]
    InvalidSecretKey,

    #[error("invalid verifying key: not a valid Ed25519 point")]
    InvalidVerifyingKey,
}

/// A node identity: Ed25519 signing key plus derived X25519 transport keys.
pub struct Wallet {
    signing_key: SigningKey,
    curve_sk: [u8; 32],
    curve_vk: [u8; 32],
}

impl Wallet {
    /// Generate a fresh wallet from the OS RNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic wallet from a 32-byte seed. Tests love this one.
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    /// Load a wallet from a hex-encoded 32-byte seed.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let curve_sk = curve_secret_from_seed(&signing_key.to_bytes());
        let curve_vk = x25519(curve_sk, X25519_BASEPOINT_BYTES);
        Self {
            signing_key,
            curve_sk,
            curve_vk,
        }
    }

    /// Hex-encoded Ed25519 verifying key: the node's public identity.
    pub fn verifying_key(&self) -> String {
        hex::encode(self.verifying_key_bytes())
    }

    /// Raw Ed25519 verifying key bytes.
    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// X25519 public key used by the transport.
    pub fn curve_vk(&self) -> [u8; 32] {
        self.curve_vk
    }

    /// X25519 secret scalar used by the transport. Handle with care.
    pub fn curve_sk(&self) -> [u8; 32] {
        self.curve_sk
    }

    /// Sign `message`, returning the hex-encoded 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.signing_key.sign(message).to_bytes())
    }

    /// Hex-encoded seed, for writing key files. Don't log it.
    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for Wallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Wallet(vk={})", self.verifying_key())
    }
}

/// Clamped lower half of SHA-512(seed): the Ed25519 signing scalar.
fn curve_secret_from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> [u8; 32] {
    let digest = Sha512::digest(seed);
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    scalar[0] &= 248;
    scalar[31] &= 127;
    scalar[31] |= 64;
    scalar
}

/// Compute a peer's X25519 transport key from its raw Ed25519 verifying key.
pub fn curve_vk_from_vk_bytes(vk: &[u8; 32]) -> Result<[u8; 32], KeyError> {
    CompressedEdwardsY(*vk)
        .decompress()
        .map(|point| point.to_montgomery().to_bytes())
        .ok_or(KeyError::InvalidVerifyingKey)
}

/// Compute a peer's X25519 transport key from its hex verifying key.
pub fn curve_vk_from_vk(vk_hex: &str) -> Result<[u8; 32], KeyError> {
    curve_vk_from_vk_bytes(&decode_vk(vk_hex)?)
}

/// Decode a hex verifying key into raw bytes.
pub fn decode_vk(vk_hex: &str) -> Result<[u8; 32], KeyError> {
    let bytes = hex::decode(vk_hex).map_err(|_| KeyError::InvalidVerifyingKey)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| KeyError::InvalidVerifyingKey)
}

//! # AES-256-GCM Channel Encryption
//!
//! Authenticated encryption for transport frames.
//!
//! ## Nonce management
//!
//! GCM is notoriously unforgiving about nonce reuse: two messages under the
//! same key and nonce leak the XOR of the plaintexts and let an attacker
//! forge tags. Game over.
//!
//! Transport sessions get fresh keys from every handshake and use one key per
//! direction, so a per-direction message counter is a safe nonce: 4 zero
//! bytes followed by the little-endian u64 counter. Both ends advance the
//! counter in lockstep, so the nonce never goes over the wire, and a replayed,
//! dropped or reordered frame fails authentication.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use thiserror::Error;

use crate::config::{AES_KEY_LENGTH, AES_NONCE_LENGTH};

/// Errors that can occur during encryption/decryption.
///
/// Deliberately vague: "wrong key" versus "tampered frame" is none of an
/// attacker's business.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptFailed,

    #[error("decryption failed -- wrong key, tampered or out-of-order frame")]
    DecryptFailed,

    #[error("nonce counter exhausted, session must be re-keyed")]
    NonceExhausted,
}

/// One direction of an encrypted channel: a key plus its message counter.
pub struct CipherState {
    cipher: Aes256Gcm,
    counter: u64,
}

impl CipherState {
    pub fn new(key: &[u8; AES_KEY_LENGTH]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            counter: 0,
        }
    }

    /// Encrypt the next outbound frame.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EncryptionError::EncryptFailed)
    }

    /// Decrypt the next inbound frame.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let nonce = self.next_nonce()?;
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| EncryptionError::DecryptFailed)
    }

    fn next_nonce(&mut self) -> Result<[u8; AES_NONCE_LENGTH], EncryptionError> {
        let nonce = counter_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or(EncryptionError::NonceExhausted)?;
        Ok(nonce)
    }
}

fn counter_nonce(counter: u64) -> [u8; AES_NONCE_LENGTH] {
    let mut nonce = [0u8; AES_NONCE_LENGTH];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

//! # Perfect Forward Secrecy (PFS)
//!
//! Key schedule for the transport handshake.
//!
//! Each side contributes a static X25519 key (derived from its wallet) and a
//! fresh ephemeral X25519 key. Three Diffie-Hellman results are mixed:
//!
//! ```text
//! ee = DH(e_client, e_server)   fresh randomness for forward secrecy
//! es = DH(e_client, S_server)   only the real server can compute this
//! se = DH(S_client, e_server)   only the real client can compute this
//! ```
//!
//! The concatenation, together with the transcript of all four public keys,
//! is fed through BLAKE3's `derive_key` mode with a separate context string
//! per direction. Compromising a static key later does not expose past
//! sessions: `ee` died with the ephemeral secrets.
//!
//! Raw DH output is never used as a key directly. It has algebraic
//! structure; the KDF turns it into something AES-GCM can trust.

use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use x25519_dalek::{x25519, X25519_BASEPOINT_BYTES};

use crate::config::AES_KEY_LENGTH;

const CLIENT_TO_SERVER_CONTEXT: &str = "tessera transport 2026-01 client->server session key";
const SERVER_TO_CLIENT_CONTEXT: &str = "tessera transport 2026-01 server->client session key";

/// Errors in the key exchange.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PfsError {
    /// The peer sent a low-order point; the DH output is all zeros.
    #[error("key exchange failed: peer supplied a degenerate public key")]
    DegeneratePublicKey,
}

/// Which end of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

/// A one-shot X25519 keypair. Dropped as soon as the session keys exist.
pub struct EphemeralKeypair {
    secret: [u8; 32],
    public: [u8; 32],
}

impl EphemeralKeypair {
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        let public = x25519(secret, X25519_BASEPOINT_BYTES);
        Self { secret, public }
    }

    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> Result<[u8; 32], PfsError> {
        diffie_hellman(&self.secret, their_public)
    }
}

/// X25519 with a contributory-behaviour check.
pub fn diffie_hellman(secret: &[u8; 32], their_public: &[u8; 32]) -> Result<[u8; 32], PfsError> {
    let shared = x25519(*secret, *their_public);
    if shared == [0u8; 32] {
        return Err(PfsError::DegeneratePublicKey);
    }
    Ok(shared)
}

/// Directional keys for one transport session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKeys {
    pub send: [u8; AES_KEY_LENGTH],
    pub recv: [u8; AES_KEY_LENGTH],
}

/// Public keys exchanged during the handshake, in wire order.
pub struct Transcript {
    pub client_static: [u8; 32],
    pub client_ephemeral: [u8; 32],
    pub server_static: [u8; 32],
    pub server_ephemeral: [u8; 32],
}

impl Transcript {
    fn to_bytes(&self) -> [u8; 128] {
        let mut out = [0u8; 128];
        out[..32].copy_from_slice(&self.client_static);
        out[32..64].copy_from_slice(&self.client_ephemeral);
        out[64..96].copy_from_slice(&self.server_static);
        out[96..].copy_from_slice(&self.server_ephemeral);
        out
    }
}

/// Mix the three DH results and the transcript into directional keys.
///
/// Both sides must pass `ee`, `es`, `se` in the same order; the role only
/// decides which derived key is for sending.
pub fn derive_session_keys(
    role: HandshakeRole,
    ee: &[u8; 32],
    es: &[u8; 32],
    se: &[u8; 32],
    transcript: &Transcript,
) -> SessionKeys {
    let mut material = Vec::with_capacity(32 * 3 + 128);
    material.extend_from_slice(ee);
    material.extend_from_slice(es);
    material.extend_from_slice(se);
    material.extend_from_slice(&transcript.to_bytes());

    let c2s = blake3::derive_key(CLIENT_TO_SERVER_CONTEXT, &material);
    let s2c = blake3::derive_key(SERVER_TO_CLIENT_CONTEXT, &material);

    match role {
        HandshakeRole::Initiator => SessionKeys {
            send: c2s,
            recv: s2c,
        },
        HandshakeRole::Responder => SessionKeys {
            send: s2c,
            recv: c2s,
        },
    }
}

//! # Signature Verification
//!
//! Hex-in, bool-out verification of Ed25519 signatures. Peers send VKs and
//! signatures as hex strings inside JSON, so that is the shape we verify.
//!
//! Verification returns `bool` rather than `Result`: every caller only wants
//! to know whether to trust the message, and a malformed key is simply an
//! untrusted one.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::keys::decode_vk;

/// Verify a hex signature over `message` against a hex verifying key.
pub fn verify(vk_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    let Ok(vk_bytes) = decode_vk(vk_hex) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    verify_bytes(&vk_bytes, message, &sig_bytes)
}

/// Verify raw signature bytes against raw verifying key bytes.
pub fn verify_bytes(vk: &[u8; 32], message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(vk) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Wallet;

    #[test]
    fn wrong_key_fails() {
        let signer = Wallet::generate();
        let other = Wallet::generate();
        let sig = signer.sign(b"hello");
        assert!(!verify(&other.verifying_key(), b"hello", &sig));
    }

    #[test]
    fn garbage_inputs_fail_quietly() {
        let wallet = Wallet::generate();
        let sig = wallet.sign(b"hello");
        assert!(!verify("zz", b"hello", &sig));
        assert!(!verify(&wallet.verifying_key(), b"hello", "zz"));
        assert!(!verify(&wallet.verifying_key(), b"hello", &sig[..64]));
    }

    #[test]
    fn raw_bytes_path_matches_hex_path() {
        let wallet = Wallet::generate();
        let sig = hex::decode(wallet.sign(b"m")).unwrap();
        assert!(verify_bytes(&wallet.verifying_key_bytes(), b"m", &sig));
    }
}

//! # Credentials Provider
//!
//! The wire-level admission gate. Every inbound router and publisher
//! connection is checked here during the handshake, before any application
//! message is read.
//!
//! Approved identities are stored as `vk -> curve_vk`. The transport only
//! sees curve keys, so lookups run against the values. The map is replaced
//! wholesale on refresh (`set_approved`) so the handshake never observes a
//! half-updated committee.
//!
//! `accept_all` exists for exactly one situation: the first node of a brand
//! new network, which has nobody to vouch for anyone. Turn it off once a
//! committee exists.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use super::transport::Authenticator;
use crate::crypto::keys::{curve_vk_from_vk, KeyError};

#[derive(Debug, Default)]
pub struct CredentialsProvider {
    approved_keys: RwLock<HashMap<String, [u8; 32]>>,
    accept_all: AtomicBool,
}

impl CredentialsProvider {
    pub fn new(accept_all: bool) -> Self {
        Self {
            approved_keys: RwLock::new(HashMap::new()),
            accept_all: AtomicBool::new(accept_all),
        }
    }

    /// Is a connection presenting this curve key allowed in?
    pub fn callback(&self, domain: &str, key: &[u8; 32]) -> bool {
        if self.accept_all.load(Ordering::Acquire) {
            return true;
        }
        let allowed = self.approved_keys.read().values().any(|k| k == key);
        if !allowed {
            debug!(domain, curve_key = %hex::encode(key), "curve key not approved");
        }
        allowed
    }

    /// Approve `vk`. Adding an already-approved key is a no-op.
    pub fn add_key(&self, vk: &str) -> Result<(), KeyError> {
        let curve = curve_vk_from_vk(vk)?;
        self.approved_keys.write().insert(vk.to_string(), curve);
        Ok(())
    }

    /// Revoke `vk`. Removing an absent key is a no-op.
    pub fn remove_key(&self, vk: &str) {
        self.approved_keys.write().remove(vk);
    }

    /// Replace the whole approved set in one swap. Keys that aren't valid
    /// Ed25519 points are skipped with a warning.
    pub fn set_approved<I, S>(&self, vks: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut next = HashMap::new();
        for vk in vks {
            let vk = vk.as_ref();
            match curve_vk_from_vk(vk) {
                Ok(curve) => {
                    next.insert(vk.to_string(), curve);
                }
                Err(err) => warn!(vk, error = %err, "skipping invalid committee key"),
            }
        }
        let count = next.len();
        *self.approved_keys.write() = next;
        info!(approved = count, "credentials refreshed");
    }

    pub fn is_approved(&self, vk: &str) -> bool {
        self.approved_keys.read().contains_key(vk)
    }

    pub fn approved_vks(&self) -> Vec<String> {
        let mut vks: Vec<String> = self.approved_keys.read().keys().cloned().collect();
        vks.sort();
        vks
    }

    /// Accept every connection (bootstrap mode).
    pub fn open_messages(&self) {
        self.accept_all.store(true, Ordering::Release);
        info!("credentials provider is accepting all connections");
    }

    /// Back to committee-only admission.
    pub fn secure_messages(&self) {
        self.accept_all.store(false, Ordering::Release);
        info!("credentials provider is accepting committee members only");
    }

    pub fn is_open(&self) -> bool {
        self.accept_all.load(Ordering::Acquire)
    }
}

impl Authenticator for CredentialsProvider {
    fn authorize(&self, domain: &str, curve_key: &[u8; 32]) -> bool {
        self.callback(domain, curve_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::Wallet;

    #[test]
    fn approved_key_passes_callback() {
        let creds = CredentialsProvider::new(false);
        let member = Wallet::generate();
        let stranger = Wallet::generate();

        creds.add_key(&member.verifying_key()).unwrap();
        assert!(creds.callback("*", &member.curve_vk()));
        assert!(!creds.callback("*", &stranger.curve_vk()));
    }

    #[test]
    fn add_and_remove_are_idempotent() {
        let creds = CredentialsProvider::new(false);
        let member = Wallet::generate();
        let vk = member.verifying_key();

        creds.add_key(&vk).unwrap();
        creds.add_key(&vk).unwrap();
        assert_eq!(creds.approved_vks().len(), 1);

        creds.remove_key(&vk);
        creds.remove_key(&vk);
        assert!(!creds.is_approved(&vk));
        assert!(!creds.callback("*", &member.curve_vk()));
    }

    #[test]
    fn accept_all_toggles() {
        let creds = CredentialsProvider::new(false);
        let stranger = Wallet::generate();
        assert!(!creds.callback("*", &stranger.curve_vk()));

        creds.open_messages();
        assert!(creds.is_open());
        assert!(creds.callback("*", &stranger.curve_vk()));

        creds.secure_messages();
        assert!(!creds.callback("*", &stranger.curve_vk()));
    }

    #[test]
    fn set_approved_replaces_everything() {
        let creds = CredentialsProvider::new(false);
        let old = Wallet::generate();
        let new_a = Wallet::generate();
        let new_b = Wallet::generate();
        creds.add_key(&old.verifying_key()).unwrap();

        creds.set_approved([
            new_a.verifying_key(),
            new_b.verifying_key(),
            "not-a-key".to_string(),
        ]);

        assert!(!creds.is_approved(&old.verifying_key()));
        assert!(creds.is_approved(&new_a.verifying_key()));
        assert!(creds.is_approved(&new_b.verifying_key()));
        assert_eq!(creds.approved_vks().len(), 2);
    }

    #[test]
    fn invalid_vk_is_an_error() {
        let creds = CredentialsProvider::new(false);
        assert!(creds.add_key("zz").is_err());
    }
}

//! Key and session persistence
//!
//! [`SessionStore`] is the only state that must survive a restart: the local
//! identity, registration id, pre-key pools, per-peer sessions and the
//! trusted-identity map. Two implementations ship with the crate:
//!
//! - [`MemoryStore`]: everything behind a `tokio::sync::RwLock`, for tests
//! - [`SqliteStore`]: sqlx-backed, secrets sealed with a pickle key

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{derive_pickle_key, generate_pickle_key, PickleKey, SqliteStore};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKeyRecord};
use crate::crypto::ratchet::SessionState;
use crate::error::SessionResult;

/// Which way a message is flowing when trust is checked
///
/// The default policy is symmetric; the distinction is kept so a stricter
/// policy can treat outgoing messages differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sending,
    Receiving,
}

/// Last identity key observed for a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedIdentity {
    pub address: PeerAddress,
    #[serde(with = "crate::util::serde_b64")]
    pub identity_key: Vec<u8>,
    /// False after a key change until the key is explicitly re-trusted
    pub verified: bool,
}

impl TrustedIdentity {
    pub fn fingerprint(&self) -> String {
        crate::crypto::keys::fingerprint(&self.identity_key)
    }
}

/// Trust check shared by the store implementations
pub(crate) fn trust_decision(existing: Option<&TrustedIdentity>, identity_key: &[u8]) -> bool {
    match existing {
        None => true,
        Some(known) => known.verified && known.identity_key == identity_key,
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    // ---- local identity ----

    /// Our identity key pair; `NotProvisioned` until one is saved
    async fn get_identity(&self) -> SessionResult<IdentityKeyPair>;

    /// Our registration id; `NotProvisioned` until one is saved
    async fn get_registration_id(&self) -> SessionResult<u32>;

    /// Persist the local identity. Fails `AlreadyProvisioned` if one exists.
    async fn save_local_identity(&self, identity: &IdentityKeyPair, registration_id: u32) -> SessionResult<()>;

    // ---- one-time pre-keys ----

    async fn save_pre_key(&self, key_id: u32, key_pair: &Curve25519KeyPair) -> SessionResult<()>;

    /// Fails `PreKeyNotFound` if absent or already consumed
    async fn load_pre_key(&self, key_id: u32) -> SessionResult<Curve25519KeyPair>;

    async fn delete_pre_key(&self, key_id: u32) -> SessionResult<()>;

    /// Load and delete in one step; only one caller can ever win a given id
    async fn take_pre_key(&self, key_id: u32) -> SessionResult<Curve25519KeyPair>;

    /// Public halves of every unconsumed pre-key, lowest id first
    async fn one_time_pre_keys(&self) -> SessionResult<Vec<OneTimePreKey>>;

    async fn count_pre_keys(&self) -> SessionResult<usize>;

    /// One past the highest pre-key id ever saved, consumed ids included
    async fn next_pre_key_id(&self) -> SessionResult<u32>;

    // ---- signed pre-keys ----

    /// Persist a signed pre-key and make it current
    async fn save_signed_pre_key(&self, record: &SignedPreKeyRecord) -> SessionResult<()>;

    /// Fails `SignedPreKeyNotFound` if unknown or purged
    async fn load_signed_pre_key(&self, key_id: u32) -> SessionResult<SignedPreKeyRecord>;

    async fn current_signed_pre_key(&self) -> SessionResult<Option<SignedPreKeyRecord>>;

    /// Drop a signed pre-key together with the base keys accepted under it
    async fn remove_signed_pre_key(&self, key_id: u32) -> SessionResult<()>;

    // ---- peer identities ----

    /// Record the identity key seen for a peer
    ///
    /// Returns true when the key is new for this peer: first sighting, or a
    /// change from the recorded key. A first sighting is trusted; a change is
    /// stored unverified and blocks the peer until [`Self::trust_identity`].
    async fn save_identity(&self, address: &PeerAddress, identity_key: &[u8]) -> SessionResult<bool>;

    /// True if nothing is recorded for the peer, or the recorded key matches
    /// and is verified
    async fn is_trusted(&self, address: &PeerAddress, identity_key: &[u8], direction: Direction) -> SessionResult<bool>;

    /// Mark a key as verified for the peer, replacing any recorded key
    async fn trust_identity(&self, address: &PeerAddress, identity_key: &[u8]) -> SessionResult<()>;

    async fn get_trusted_identity(&self, address: &PeerAddress) -> SessionResult<Option<TrustedIdentity>>;

    // ---- sessions ----

    async fn load_session(&self, address: &PeerAddress) -> SessionResult<Option<SessionState>>;

    async fn save_session(&self, address: &PeerAddress, state: &SessionState) -> SessionResult<()>;

    /// Returns whether a session existed
    async fn delete_session(&self, address: &PeerAddress) -> SessionResult<bool>;

    async fn list_sessions(&self) -> SessionResult<Vec<PeerAddress>>;

    /// Consume the referenced one-time pre-key, record the session's base key
    /// under its signed pre-key, and save the responder's new session as a
    /// single unit
    ///
    /// Fails `PreKeyNotFound` if the one-time key is already gone and
    /// `FirstMessageReplayed` if the base key was accepted before. Either way
    /// nothing is written.
    async fn commit_first_message(
        &self,
        address: &PeerAddress,
        signed_pre_key_id: u32,
        one_time_pre_key_id: Option<u32>,
        state: &SessionState,
    ) -> SessionResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trust_decision() {
        let address = PeerAddress::new("bob", 1);
        let known = TrustedIdentity {
            address: address.clone(),
            identity_key: vec![1; 32],
            verified: true,
        };
        assert!(trust_decision(None, &[9; 32]));
        assert!(trust_decision(Some(&known), &[1; 32]));
        assert!(!trust_decision(Some(&known), &[2; 32]));

        let changed = TrustedIdentity { verified: false, ..known };
        assert!(!trust_decision(Some(&changed), &[1; 32]));
    }
}

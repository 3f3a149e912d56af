//! In-memory store

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{trust_decision, Direction, SessionStore, TrustedIdentity};
use crate::address::PeerAddress;
use crate::crypto::keys::{Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKeyRecord};
use crate::crypto::ratchet::SessionState;
use crate::error::{SessionError, SessionResult};

#[derive(Default)]
struct Inner {
    identity: Option<(IdentityKeyPair, u32)>,
    pre_keys: BTreeMap<u32, Curve25519KeyPair>,
    next_pre_key_id: u32,
    signed_pre_keys: BTreeMap<u32, SignedPreKeyRecord>,
    current_signed_pre_key: Option<u32>,
    /// Base keys of accepted first messages, per signed pre-key
    base_keys: HashMap<u32, HashSet<Vec<u8>>>,
    identities: HashMap<PeerAddress, TrustedIdentity>,
    sessions: HashMap<PeerAddress, SessionState>,
}

/// Store that lives and dies with the process
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_identity(&self) -> SessionResult<IdentityKeyPair> {
        let inner = self.inner.read().await;
        inner
            .identity
            .as_ref()
            .map(|(identity, _)| identity.clone())
            .ok_or(SessionError::NotProvisioned)
    }

    async fn get_registration_id(&self) -> SessionResult<u32> {
        let inner = self.inner.read().await;
        inner
            .identity
            .as_ref()
            .map(|(_, registration_id)| *registration_id)
            .ok_or(SessionError::NotProvisioned)
    }

    async fn save_local_identity(&self, identity: &IdentityKeyPair, registration_id: u32) -> SessionResult<()> {
        let mut inner = self.inner.write().await;
        if inner.identity.is_some() {
            return Err(SessionError::AlreadyProvisioned);
        }
        inner.identity = Some((identity.clone(), registration_id));
        Ok(())
    }

    async fn save_pre_key(&self, key_id: u32, key_pair: &Curve25519KeyPair) -> SessionResult<()> {
        let mut inner = self.inner.write().await;
        inner.pre_keys.insert(key_id, key_pair.clone());
        inner.next_pre_key_id = inner.next_pre_key_id.max(key_id.saturating_add(1));
        Ok(())
    }

    async fn load_pre_key(&self, key_id: u32) -> SessionResult<Curve25519KeyPair> {
        let inner = self.inner.read().await;
        inner
            .pre_keys
            .get(&key_id)
            .cloned()
            .ok_or(SessionError::PreKeyNotFound(key_id))
    }

    async fn delete_pre_key(&self, key_id: u32) -> SessionResult<()> {
        self.inner.write().await.pre_keys.remove(&key_id);
        Ok(())
    }

    async fn take_pre_key(&self, key_id: u32) -> SessionResult<Curve25519KeyPair> {
        self.inner
            .write()
            .await
            .pre_keys
            .remove(&key_id)
            .ok_or(SessionError::PreKeyNotFound(key_id))
    }

    async fn one_time_pre_keys(&self) -> SessionResult<Vec<OneTimePreKey>> {
        let inner = self.inner.read().await;
        Ok(inner
            .pre_keys
            .iter()
            .map(|(id, key_pair)| OneTimePreKey::new(*id, key_pair))
            .collect())
    }

    async fn count_pre_keys(&self) -> SessionResult<usize> {
        Ok(self.inner.read().await.pre_keys.len())
    }

    async fn next_pre_key_id(&self) -> SessionResult<u32> {
        Ok(self.inner.read().await.next_pre_key_id.max(1))
    }

    async fn save_signed_pre_key(&self, record: &SignedPreKeyRecord) -> SessionResult<()> {
        let mut inner = self.inner.write().await;
        inner.signed_pre_keys.insert(record.key_id, record.clone());
        inner.current_signed_pre_key = Some(record.key_id);
        Ok(())
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> SessionResult<SignedPreKeyRecord> {
        let inner = self.inner.read().await;
        inner
            .signed_pre_keys
            .get(&key_id)
            .cloned()
            .ok_or(SessionError::SignedPreKeyNotFound(key_id))
    }

    async fn current_signed_pre_key(&self) -> SessionResult<Option<SignedPreKeyRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .current_signed_pre_key
            .and_then(|id| inner.signed_pre_keys.get(&id).cloned()))
    }

    async fn remove_signed_pre_key(&self, key_id: u32) -> SessionResult<()> {
        let mut inner = self.inner.write().await;
        inner.signed_pre_keys.remove(&key_id);
        inner.base_keys.remove(&key_id);
        if inner.current_signed_pre_key == Some(key_id) {
            inner.current_signed_pre_key = None;
        }
        Ok(())
    }

    async fn save_identity(&self, address: &PeerAddress, identity_key: &[u8]) -> SessionResult<bool> {
        let mut inner = self.inner.write().await;
        match inner.identities.get_mut(address) {
            Some(known) if known.identity_key == identity_key => Ok(false),
            Some(known) => {
                known.identity_key = identity_key.to_vec();
                known.verified = false;
                Ok(true)
            }
            None => {
                inner.identities.insert(
                    address.clone(),
                    TrustedIdentity {
                        address: address.clone(),
                        identity_key: identity_key.to_vec(),
                        verified: true,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn is_trusted(&self, address: &PeerAddress, identity_key: &[u8], _direction: Direction) -> SessionResult<bool> {
        let inner = self.inner.read().await;
        Ok(trust_decision(inner.identities.get(address), identity_key))
    }

    async fn trust_identity(&self, address: &PeerAddress, identity_key: &[u8]) -> SessionResult<()> {
        let mut inner = self.inner.write().await;
        inner.identities.insert(
            address.clone(),
            TrustedIdentity {
                address: address.clone(),
                identity_key: identity_key.to_vec(),
                verified: true,
            },
        );
        Ok(())
    }

    async fn get_trusted_identity(&self, address: &PeerAddress) -> SessionResult<Option<TrustedIdentity>> {
        Ok(self.inner.read().await.identities.get(address).cloned())
    }

    async fn load_session(&self, address: &PeerAddress) -> SessionResult<Option<SessionState>> {
        Ok(self.inner.read().await.sessions.get(address).cloned())
    }

    async fn save_session(&self, address: &PeerAddress, state: &SessionState) -> SessionResult<()> {
        self.inner
            .write()
            .await
            .sessions
            .insert(address.clone(), state.clone());
        Ok(())
    }

    async fn delete_session(&self, address: &PeerAddress) -> SessionResult<bool> {
        Ok(self.inner.write().await.sessions.remove(address).is_some())
    }

    async fn list_sessions(&self) -> SessionResult<Vec<PeerAddress>> {
        let mut peers: Vec<_> = self.inner.read().await.sessions.keys().cloned().collect();
        peers.sort();
        Ok(peers)
    }

    async fn commit_first_message(
        &self,
        address: &PeerAddress,
        signed_pre_key_id: u32,
        one_time_pre_key_id: Option<u32>,
        state: &SessionState,
    ) -> SessionResult<()> {
        let mut inner = self.inner.write().await;
        if let Some(key_id) = one_time_pre_key_id {
            if !inner.pre_keys.contains_key(&key_id) {
                return Err(SessionError::PreKeyNotFound(key_id));
            }
        }
        if inner
            .base_keys
            .get(&signed_pre_key_id)
            .is_some_and(|seen| seen.contains(state.base_key()))
        {
            return Err(SessionError::FirstMessageReplayed { signed_pre_key_id });
        }

        if let Some(key_id) = one_time_pre_key_id {
            inner.pre_keys.remove(&key_id);
        }
        inner
            .base_keys
            .entry(signed_pre_key_id)
            .or_default()
            .insert(state.base_key().to_vec());
        inner.sessions.insert(address.clone(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_provisioning() {
        let store = MemoryStore::new();
        assert!(matches!(store.get_identity().await, Err(SessionError::NotProvisioned)));
        assert!(matches!(store.get_registration_id().await, Err(SessionError::NotProvisioned)));

        let identity = IdentityKeyPair::generate();
        store.save_local_identity(&identity, 77).await.unwrap();
        assert_eq!(store.get_registration_id().await.unwrap(), 77);
        assert_eq!(store.get_identity().await.unwrap().public, identity.public);

        let again = IdentityKeyPair::generate();
        assert!(matches!(
            store.save_local_identity(&again, 78).await,
            Err(SessionError::AlreadyProvisioned)
        ));
    }

    #[tokio::test]
    async fn test_take_pre_key_once() {
        let store = MemoryStore::new();
        store.save_pre_key(4, &Curve25519KeyPair::generate()).await.unwrap();

        assert!(store.take_pre_key(4).await.is_ok());
        assert!(matches!(store.take_pre_key(4).await, Err(SessionError::PreKeyNotFound(4))));
        assert!(matches!(store.load_pre_key(4).await, Err(SessionError::PreKeyNotFound(4))));
        // Consumed ids are never handed out again
        assert_eq!(store.next_pre_key_id().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_identity_change_requires_trust() {
        let store = MemoryStore::new();
        let bob = PeerAddress::new("bob", 1);

        assert!(store.is_trusted(&bob, &[1; 32], Direction::Sending).await.unwrap());
        assert!(store.save_identity(&bob, &[1; 32]).await.unwrap());
        assert!(!store.save_identity(&bob, &[1; 32]).await.unwrap());
        assert!(store.is_trusted(&bob, &[1; 32], Direction::Receiving).await.unwrap());

        assert!(store.save_identity(&bob, &[2; 32]).await.unwrap());
        assert!(!store.is_trusted(&bob, &[2; 32], Direction::Receiving).await.unwrap());
        assert!(!store.is_trusted(&bob, &[1; 32], Direction::Receiving).await.unwrap());

        store.trust_identity(&bob, &[2; 32]).await.unwrap();
        assert!(store.is_trusted(&bob, &[2; 32], Direction::Sending).await.unwrap());
    }

    #[tokio::test]
    async fn test_signed_pre_key_current() {
        let store = MemoryStore::new();
        let identity = IdentityKeyPair::generate();
        store.save_signed_pre_key(&SignedPreKeyRecord::generate(1, &identity)).await.unwrap();
        store.save_signed_pre_key(&SignedPreKeyRecord::generate(2, &identity)).await.unwrap();

        assert_eq!(store.current_signed_pre_key().await.unwrap().unwrap().key_id, 2);
        assert!(store.load_signed_pre_key(1).await.is_ok());

        store.remove_signed_pre_key(1).await.unwrap();
        assert!(matches!(
            store.load_signed_pre_key(1).await,
            Err(SessionError::SignedPreKeyNotFound(1))
        ));
    }
}

//! Per-identity client
//!
//! [`SecureClient`] ties together the store, the key directory and the
//! protocol components for one local device. Operations on the same peer are
//! serialized; different peers proceed concurrently.
//!
//! ```rust,ignore
//! let client = SecureClient::new(store, directory, PeerAddress::new("alice", 1), config);
//! client.bootstrap().await?;
//!
//! let envelope = client.encrypt_for(&bob, b"hello").await?;
//! let message = client.receive(&reply).await?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::address::PeerAddress;
use crate::codec::MessageCodec;
use crate::config::Config;
use crate::crypto::ratchet::SessionStats;
use crate::directory::KeyDirectory;
use crate::envelope::{EncryptedEnvelope, InboundMessage};
use crate::error::{SessionError, SessionResult};
use crate::identity::{IdentityManager, LocalIdentity, PreKeyStatus};
use crate::negotiator::SessionNegotiator;
use crate::store::{SessionStore, TrustedIdentity};
use crate::transport::{Transport, TransportError};

type PeerLock = Arc<tokio::sync::Mutex<()>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct SecureClient {
    store: Arc<dyn SessionStore>,
    directory: Arc<dyn KeyDirectory>,
    identity: IdentityManager,
    negotiator: Arc<SessionNegotiator>,
    codec: MessageCodec,
    config: Config,
    /// Only peers with an operation in flight keep an entry
    peer_locks: Mutex<HashMap<PeerAddress, PeerLock>>,
    /// Trust failures per peer during negotiation
    quarantine: Mutex<HashMap<PeerAddress, u32>>,
}

impl SecureClient {
    pub fn new(
        store: Arc<dyn SessionStore>,
        directory: Arc<dyn KeyDirectory>,
        address: PeerAddress,
        config: Config,
    ) -> Self {
        let negotiator = Arc::new(SessionNegotiator::new(Arc::clone(&store), config.session.clone()));
        let codec = MessageCodec::new(
            Arc::clone(&store),
            Arc::clone(&negotiator),
            address.clone(),
            config.session.clone(),
        );
        let identity = IdentityManager::new(Arc::clone(&store), address, config.pre_keys.clone());

        Self {
            store,
            directory,
            identity,
            negotiator,
            codec,
            config,
            peer_locks: Mutex::new(HashMap::new()),
            quarantine: Mutex::new(HashMap::new()),
        }
    }

    pub fn address(&self) -> &PeerAddress {
        self.identity.address()
    }

    pub fn identity(&self) -> &IdentityManager {
        &self.identity
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Provision keys on first run and publish them
    ///
    /// An already provisioned device only refreshes its published material.
    pub async fn bootstrap(&self) -> SessionResult<LocalIdentity> {
        if self.identity.is_provisioned().await? {
            tracing::info!(address = %self.address(), "Identity already provisioned");
            self.publish().await?;
        } else {
            let keys = self.identity.bootstrap().await?;
            self.directory.publish(&keys).await?;
            tracing::info!(
                address = %self.address(),
                one_time_pre_keys = keys.one_time_pre_keys.len(),
                "Published initial key material"
            );
        }
        self.identity.local_identity().await
    }

    /// Rotate the signed pre-key if it is due, then upload current key material
    pub async fn publish(&self) -> SessionResult<()> {
        self.identity.rotate_if_needed().await?;
        let keys = self.identity.published_keys().await?;
        self.directory.publish(&keys).await
    }

    /// Top up the one-time pre-key pool and republish when it ran low
    ///
    /// Returns how many keys were added.
    pub async fn replenish(&self) -> SessionResult<usize> {
        let added = self.identity.replenish().await?;
        if !added.is_empty() {
            self.publish().await?;
        }
        Ok(added.len())
    }

    pub async fn status(&self) -> SessionResult<PreKeyStatus> {
        self.identity.status().await
    }

    pub async fn local_identity(&self) -> SessionResult<LocalIdentity> {
        self.identity.local_identity().await
    }

    pub async fn fingerprint(&self) -> SessionResult<String> {
        Ok(self.identity.local_identity().await?.fingerprint)
    }

    pub async fn has_session(&self, address: &PeerAddress) -> SessionResult<bool> {
        Ok(self.store.load_session(address).await?.is_some())
    }

    pub async fn session_stats(&self, address: &PeerAddress) -> SessionResult<Option<SessionStats>> {
        Ok(self.store.load_session(address).await?.map(|state| state.stats(address)))
    }

    pub async fn sessions(&self) -> SessionResult<Vec<PeerAddress>> {
        self.store.list_sessions().await
    }

    fn peer_lock(&self, address: &PeerAddress) -> PeerLock {
        let mut locks = lock(&self.peer_locks);
        // An entry nobody else holds has no waiters and can be recreated later
        locks.retain(|_, peer_lock| Arc::strong_count(peer_lock) > 1);
        Arc::clone(locks.entry(address.clone()).or_default())
    }

    fn check_quarantine(&self, address: &PeerAddress) -> SessionResult<()> {
        let failures = lock(&self.quarantine).get(address).copied().unwrap_or(0);
        if failures >= self.config.quarantine_threshold {
            return Err(SessionError::PeerQuarantined {
                peer_id: address.to_string(),
                failures,
            });
        }
        Ok(())
    }

    fn record_negotiation<T>(&self, address: &PeerAddress, outcome: &SessionResult<T>) {
        match outcome {
            Ok(_) => {
                lock(&self.quarantine).remove(address);
            }
            Err(e) if e.is_trust_failure() => {
                let mut quarantine = lock(&self.quarantine);
                let failures = quarantine.entry(address.clone()).or_insert(0);
                *failures += 1;
                if *failures >= self.config.quarantine_threshold {
                    tracing::error!(peer = %address, failures = *failures, "Peer quarantined");
                } else {
                    tracing::warn!(peer = %address, failures = *failures, error = %e, "Negotiation trust failure");
                }
            }
            Err(_) => {}
        }
    }

    /// Trust failures recorded against a peer
    pub fn quarantine_failures(&self, address: &PeerAddress) -> u32 {
        lock(&self.quarantine).get(address).copied().unwrap_or(0)
    }

    pub fn is_quarantined(&self, address: &PeerAddress) -> bool {
        self.quarantine_failures(address) >= self.config.quarantine_threshold
    }

    pub fn clear_quarantine(&self, address: &PeerAddress) {
        if lock(&self.quarantine).remove(address).is_some() {
            tracing::info!(peer = %address, "Quarantine cleared");
        }
    }

    /// Fetch a bundle and start a session unless one already exists
    async fn ensure_session(&self, address: &PeerAddress) -> SessionResult<()> {
        if self.store.load_session(address).await?.is_some() {
            return Ok(());
        }
        self.check_quarantine(address)?;

        let bundle = self.directory.fetch(address).await?;
        let outcome = self.negotiator.start_session(address, &bundle).await;
        self.record_negotiation(address, &outcome);
        outcome
    }

    /// Encrypt for a peer, negotiating a session from the directory on first contact
    pub async fn encrypt_for(&self, address: &PeerAddress, plaintext: &[u8]) -> SessionResult<EncryptedEnvelope> {
        let peer_lock = self.peer_lock(address);
        let _guard = peer_lock.lock().await;

        self.ensure_session(address).await?;
        self.codec.encrypt(address, plaintext).await
    }

    /// Decrypt an envelope from whichever peer sent it
    pub async fn receive(&self, envelope: &EncryptedEnvelope) -> SessionResult<InboundMessage> {
        let sender = envelope.sender();
        let peer_lock = self.peer_lock(&sender);
        let _guard = peer_lock.lock().await;

        let negotiating = match &envelope.pre_key {
            Some(header) => self
                .store
                .load_session(&sender)
                .await?
                .map_or(true, |state| state.base_key() != header.ephemeral_key.as_slice()),
            None => false,
        };

        let plaintext = if negotiating {
            self.check_quarantine(&sender)?;
            let outcome = self.codec.decrypt(&sender, envelope).await;
            self.record_negotiation(&sender, &outcome);
            outcome?
        } else {
            self.codec.decrypt(&sender, envelope).await?
        };

        Ok(InboundMessage::new(sender, plaintext))
    }

    /// Encrypt and hand the envelope to `transport`
    ///
    /// Connectivity is checked first so a dead link does not advance the
    /// sending chain.
    pub async fn send(
        &self,
        transport: &Transport,
        address: &PeerAddress,
        plaintext: &[u8],
    ) -> SessionResult<EncryptedEnvelope> {
        if !transport.is_connected() {
            return Err(TransportError::NotConnected.into());
        }

        let envelope = self.encrypt_for(address, plaintext).await?;
        transport.send(address, envelope.clone()).await?;
        Ok(envelope)
    }

    /// Mark a peer identity key as verified and lift any quarantine
    pub async fn trust_identity(&self, address: &PeerAddress, identity_key: &[u8]) -> SessionResult<()> {
        self.store.trust_identity(address, identity_key).await?;
        lock(&self.quarantine).remove(address);
        tracing::info!(
            peer = %address,
            fingerprint = %crate::crypto::keys::fingerprint(identity_key),
            "Identity trusted"
        );
        Ok(())
    }

    pub async fn trusted_identity(&self, address: &PeerAddress) -> SessionResult<Option<TrustedIdentity>> {
        self.store.get_trusted_identity(address).await
    }

    /// Drop the session with a peer; the next send negotiates a new one
    pub async fn reset_session(&self, address: &PeerAddress) -> SessionResult<bool> {
        let peer_lock = self.peer_lock(address);
        let _guard = peer_lock.lock().await;

        let removed = self.store.delete_session(address).await?;
        if removed {
            tracing::info!(peer = %address, "Session reset");
        }
        Ok(removed)
    }
}

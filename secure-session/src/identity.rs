//! Identity and pre-key management
//!
//! Manages the local key material behind a [`SessionStore`]:
//!
//! - **Identity**: created once by [`IdentityManager::provision`], never rotated
//! - **Signed pre-keys**: rotated periodically (~7 days), signed by the identity key;
//!   older ones stay loadable until purged so late first messages still decrypt
//! - **One-time pre-keys**: single-use keys for forward secrecy, replenished as needed

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::config::PreKeyConfig;
use crate::crypto::keys::{
    generate_registration_id, Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey,
    SignedPreKeyRecord,
};
use crate::crypto::x3dh::PreKeyBundle;
use crate::directory::PublishedKeys;
use crate::error::{SessionError, SessionResult};
use crate::store::SessionStore;

/// Public view of the local identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    #[serde(with = "crate::util::serde_b64")]
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub fingerprint: String,
}

/// Status of pre-key availability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyStatus {
    /// Number of one-time pre-keys available
    pub one_time_pre_key_count: usize,
    /// Whether replenishment is needed
    pub needs_replenishment: bool,
    /// Whether signed pre-key rotation is needed
    pub needs_rotation: bool,
    /// Id of the current signed pre-key
    pub signed_pre_key_id: Option<u32>,
    /// Age of the current signed pre-key in seconds
    pub signed_pre_key_age_seconds: i64,
    /// Identity key fingerprint
    pub fingerprint: String,
}

/// Manages local key generation and lifecycle
pub struct IdentityManager {
    store: Arc<dyn SessionStore>,
    address: PeerAddress,
    config: PreKeyConfig,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn SessionStore>, address: PeerAddress, config: PreKeyConfig) -> Self {
        Self { store, address, config }
    }

    /// Address this installation publishes under
    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Create the identity key pair and registration id
    ///
    /// Fails `AlreadyProvisioned` rather than replacing an existing identity.
    pub async fn provision(&self) -> SessionResult<LocalIdentity> {
        let identity = IdentityKeyPair::generate();
        let registration_id = generate_registration_id();

        self.store.save_local_identity(&identity, registration_id).await?;

        tracing::info!(
            address = %self.address,
            fingerprint = %identity.fingerprint(),
            registration_id,
            "Provisioned local identity"
        );

        Ok(LocalIdentity {
            identity_key: identity.public_key_bytes(),
            registration_id,
            fingerprint: identity.fingerprint(),
        })
    }

    pub async fn is_provisioned(&self) -> SessionResult<bool> {
        match self.store.get_identity().await {
            Ok(_) => Ok(true),
            Err(SessionError::NotProvisioned) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn local_identity(&self) -> SessionResult<LocalIdentity> {
        let identity = self.store.get_identity().await?;
        let registration_id = self.store.get_registration_id().await?;
        Ok(LocalIdentity {
            identity_key: identity.public_key_bytes(),
            registration_id,
            fingerprint: identity.fingerprint(),
        })
    }

    /// Generate and persist `count` one-time pre-keys with ids from `start_id`
    ///
    /// Ids below the store's high-water mark were already issued (and maybe
    /// consumed), so a range starting there fails `InvalidInput`. Returns the
    /// public halves for publication.
    pub async fn generate_pre_keys(&self, start_id: u32, count: u32) -> SessionResult<Vec<OneTimePreKey>> {
        if start_id == 0 {
            return Err(SessionError::InvalidInput("pre-key ids start at 1".to_string()));
        }
        let next_id = self.store.next_pre_key_id().await?;
        if start_id < next_id {
            return Err(SessionError::InvalidInput(format!(
                "pre-key id {} already issued, next free id is {}",
                start_id, next_id
            )));
        }
        if count == 0 {
            return Ok(Vec::new());
        }
        let last_id = start_id
            .checked_add(count - 1)
            .ok_or_else(|| SessionError::InvalidInput("pre-key id range overflows".to_string()))?;

        let mut published = Vec::with_capacity(count as usize);
        for key_id in start_id..=last_id {
            let key_pair = Curve25519KeyPair::generate();
            self.store.save_pre_key(key_id, &key_pair).await?;
            published.push(OneTimePreKey::new(key_id, &key_pair));
        }

        tracing::info!(start_id, last_id, count, "Generated one-time pre-keys");
        Ok(published)
    }

    /// Generate a new signed pre-key and make it current
    ///
    /// Fails `InvalidInput` if `key_id` names a signed pre-key that still exists.
    pub async fn rotate_signed_pre_key(&self, key_id: u32) -> SessionResult<SignedPreKey> {
        let identity = self.store.get_identity().await?;
        match self.store.load_signed_pre_key(key_id).await {
            Ok(_) => {
                return Err(SessionError::InvalidInput(format!(
                    "signed pre-key {} already exists",
                    key_id
                )))
            }
            Err(SessionError::SignedPreKeyNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        let record = SignedPreKeyRecord::generate(key_id, &identity);
        self.store.save_signed_pre_key(&record).await?;

        tracing::info!(key_id, "Rotated signed pre-key");
        Ok(record.public())
    }

    /// Rotate when the current signed pre-key is older than the configured age
    pub async fn rotate_if_needed(&self) -> SessionResult<Option<SignedPreKey>> {
        match self.store.current_signed_pre_key().await? {
            Some(current) if !current.is_expired(self.config.signed_pre_key_max_age_days) => Ok(None),
            current => {
                let next_id = current.map(|c| c.key_id.wrapping_add(1).max(1)).unwrap_or(1);
                Ok(Some(self.rotate_signed_pre_key(next_id).await?))
            }
        }
    }

    /// Retire an old signed pre-key; the current one cannot be purged
    pub async fn purge_signed_pre_key(&self, key_id: u32) -> SessionResult<()> {
        if let Some(current) = self.store.current_signed_pre_key().await? {
            if current.key_id == key_id {
                return Err(SessionError::InvalidInput(format!(
                    "signed pre-key {} is current",
                    key_id
                )));
            }
        }
        self.store.load_signed_pre_key(key_id).await?;
        self.store.remove_signed_pre_key(key_id).await?;

        tracing::info!(key_id, "Purged signed pre-key");
        Ok(())
    }

    /// Bundle snapshot with the lowest unconsumed one-time pre-key, if any
    pub async fn export_public_bundle(&self) -> SessionResult<PreKeyBundle> {
        let keys = self.published_keys().await?;
        let one_time_pre_key = keys.one_time_pre_keys.first().cloned();
        if one_time_pre_key.is_none() {
            tracing::warn!("One-time pre-keys exhausted, bundle carries signed pre-key only");
        }
        Ok(keys.bundle(one_time_pre_key))
    }

    /// Identity, current signed pre-key and every unconsumed one-time pre-key
    pub async fn published_keys(&self) -> SessionResult<PublishedKeys> {
        let identity = self.store.get_identity().await?;
        let registration_id = self.store.get_registration_id().await?;
        let signed = self
            .store
            .current_signed_pre_key()
            .await?
            .ok_or(SessionError::NotProvisioned)?;

        Ok(PublishedKeys {
            user_id: self.address.name.clone(),
            device_id: self.address.device_id,
            identity_key: identity.public_key_bytes(),
            registration_id,
            signed_pre_key: signed.public(),
            one_time_pre_keys: self.store.one_time_pre_keys().await?,
        })
    }

    /// Provision, create signed pre-key 1 and the initial one-time pre-key batch
    pub async fn bootstrap(&self) -> SessionResult<PublishedKeys> {
        self.provision().await?;
        self.rotate_signed_pre_key(1).await?;
        self.generate_pre_keys(1, self.config.initial_batch_size).await?;
        self.published_keys().await
    }

    pub async fn status(&self) -> SessionResult<PreKeyStatus> {
        let identity = self.store.get_identity().await?;
        let count = self.store.count_pre_keys().await?;
        let current = self.store.current_signed_pre_key().await?;
        let now = chrono::Utc::now().timestamp();

        Ok(PreKeyStatus {
            one_time_pre_key_count: count,
            needs_replenishment: count < self.config.min_pre_key_count as usize,
            needs_rotation: current
                .as_ref()
                .map(|c| c.is_expired(self.config.signed_pre_key_max_age_days))
                .unwrap_or(true),
            signed_pre_key_id: current.as_ref().map(|c| c.key_id),
            signed_pre_key_age_seconds: current.map(|c| now - c.created_at).unwrap_or(0),
            fingerprint: identity.fingerprint(),
        })
    }

    /// Append a batch of one-time pre-keys when the pool runs low
    ///
    /// Returns the new keys for upload; empty when no replenishment was due.
    pub async fn replenish(&self) -> SessionResult<Vec<OneTimePreKey>> {
        let count = self.store.count_pre_keys().await?;
        if count >= self.config.min_pre_key_count as usize {
            return Ok(Vec::new());
        }

        let start_id = self.store.next_pre_key_id().await?;
        tracing::info!(remaining = count, start_id, "Replenishing one-time pre-keys");
        self.generate_pre_keys(start_id, self.config.replenishment_batch_size).await
    }
}

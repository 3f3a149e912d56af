//! Session establishment
//!
//! The initiator consumes a peer's [`PreKeyBundle`]; the responder consumes the
//! initiator's first envelope. Both sides end with the same X3DH secret and
//! mirrored chain state.

use std::sync::Arc;

use crate::address::PeerAddress;
use crate::config::SessionConfig;
use crate::crypto::ratchet::SessionState;
use crate::crypto::x3dh::{x3dh_initiate, x3dh_respond_to_header, PreKeyBundle};
use crate::envelope::EncryptedEnvelope;
use crate::error::{SessionError, SessionResult};
use crate::store::{Direction, SessionStore};

pub struct SessionNegotiator {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionNegotiator {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    /// Refuse keys that differ from the pinned identity, recording the change
    async fn check_trust(&self, address: &PeerAddress, identity_key: &[u8], direction: Direction) -> SessionResult<()> {
        if self.store.is_trusted(address, identity_key, direction).await? {
            return Ok(());
        }

        self.store.save_identity(address, identity_key).await?;
        tracing::warn!(
            peer = %address,
            fingerprint = %crate::crypto::keys::fingerprint(identity_key),
            ?direction,
            "Identity key changed, re-verification required"
        );
        Err(SessionError::IdentityChanged {
            peer_id: address.to_string(),
        })
    }

    /// Create an initiator session from a fetched bundle
    ///
    /// The bundle signature is verified before any secret is derived. The
    /// bundle's one-time pre-key belongs to the peer and is not touched here.
    pub async fn start_session(&self, address: &PeerAddress, bundle: &PreKeyBundle) -> SessionResult<()> {
        bundle.validate()?;
        if bundle.device_id != address.device_id {
            return Err(SessionError::MalformedBundle(format!(
                "bundle is for device {}, expected {}",
                bundle.device_id, address.device_id
            )));
        }

        if let Err(e) = bundle.verify() {
            tracing::warn!(peer = %address, error = %e, "Rejected pre-key bundle");
            return Err(e);
        }

        self.check_trust(address, &bundle.identity_key, Direction::Sending).await?;

        let identity = self.store.get_identity().await?;
        let registration_id = self.store.get_registration_id().await?;

        let agreement = x3dh_initiate(&identity, bundle)?;
        let state = SessionState::initiator(
            &identity,
            registration_id,
            bundle.identity_key.clone(),
            bundle.registration_id,
            &agreement,
        )?;

        if self.store.save_identity(address, &bundle.identity_key).await? {
            tracing::info!(peer = %address, "Trusting identity on first use");
        }
        self.store.save_session(address, &state).await?;

        tracing::info!(
            peer = %address,
            signed_pre_key_id = agreement.signed_pre_key_id,
            one_time_pre_key_id = ?agreement.used_one_time_pre_key,
            "Session started as initiator"
        );
        Ok(())
    }

    /// Create a responder session from a first-contact envelope and decrypt it
    ///
    /// The referenced one-time pre-key is deleted in the same store write that
    /// saves the session. A key that is already gone fails `PreKeyNotFound`;
    /// a base key accepted before fails `FirstMessageReplayed`.
    pub async fn process_first_message(
        &self,
        address: &PeerAddress,
        envelope: &EncryptedEnvelope,
    ) -> SessionResult<Vec<u8>> {
        envelope.validate()?;
        let header = envelope
            .pre_key
            .as_ref()
            .ok_or_else(|| SessionError::MalformedEnvelope("missing pre-key header".to_string()))?;
        if envelope.sender() != *address {
            return Err(SessionError::MalformedEnvelope(format!(
                "envelope from {} routed to {}",
                envelope.sender(),
                address
            )));
        }

        self.check_trust(address, &header.identity_key, Direction::Receiving).await?;

        let identity = self.store.get_identity().await?;
        let signed = self.store.load_signed_pre_key(header.signed_pre_key_id).await?;
        let one_time = match header.one_time_pre_key_id {
            Some(key_id) => match self.store.load_pre_key(key_id).await {
                Ok(key_pair) => Some(key_pair),
                Err(e) => {
                    tracing::warn!(peer = %address, key_id, "First message references a consumed pre-key");
                    return Err(e);
                }
            },
            None => None,
        };

        let secret = x3dh_respond_to_header(&identity, &signed.key_pair, one_time.as_ref(), header)?;
        let mut state = SessionState::responder(&identity, header, &secret)?;
        let plaintext = state.decrypt(envelope, &self.config)?;

        if let Err(e) = self
            .store
            .commit_first_message(address, header.signed_pre_key_id, header.one_time_pre_key_id, &state)
            .await
        {
            if matches!(e, SessionError::FirstMessageReplayed { .. }) {
                tracing::warn!(peer = %address, "Rejected replayed first message");
            }
            return Err(e);
        }
        if self.store.save_identity(address, &header.identity_key).await? {
            tracing::info!(peer = %address, "Trusting identity on first use");
        }

        tracing::info!(
            peer = %address,
            signed_pre_key_id = header.signed_pre_key_id,
            one_time_pre_key_id = ?header.one_time_pre_key_id,
            "Session established as responder"
        );
        Ok(plaintext)
    }
}

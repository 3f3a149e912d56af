//! Message encryption against stored sessions
//!
//! Every successful step loads the session, advances it on an owned copy and
//! saves it back once. A failed decrypt never reaches the save.

use std::sync::Arc;

use crate::address::PeerAddress;
use crate::config::SessionConfig;
use crate::crypto::ratchet::SessionState;
use crate::envelope::EncryptedEnvelope;
use crate::error::{SessionError, SessionResult};
use crate::negotiator::SessionNegotiator;
use crate::store::{Direction, SessionStore};

pub struct MessageCodec {
    store: Arc<dyn SessionStore>,
    negotiator: Arc<SessionNegotiator>,
    local: PeerAddress,
    config: SessionConfig,
}

impl MessageCodec {
    pub fn new(
        store: Arc<dyn SessionStore>,
        negotiator: Arc<SessionNegotiator>,
        local: PeerAddress,
        config: SessionConfig,
    ) -> Self {
        Self {
            store,
            negotiator,
            local,
            config,
        }
    }

    async fn ensure_trusted(&self, address: &PeerAddress, state: &SessionState, direction: Direction) -> SessionResult<()> {
        if self.store.is_trusted(address, state.remote_identity(), direction).await? {
            Ok(())
        } else {
            tracing::warn!(peer = %address, ?direction, "Session identity no longer trusted");
            Err(SessionError::IdentityChanged {
                peer_id: address.to_string(),
            })
        }
    }

    /// Encrypt for a peer with an established session
    pub async fn encrypt(&self, address: &PeerAddress, plaintext: &[u8]) -> SessionResult<EncryptedEnvelope> {
        let mut state = self
            .store
            .load_session(address)
            .await?
            .ok_or_else(|| SessionError::SessionNotFound(address.to_string()))?;
        self.ensure_trusted(address, &state, Direction::Sending).await?;

        let envelope = state.encrypt(&self.local, plaintext)?;
        self.store.save_session(address, &state).await?;

        tracing::debug!(peer = %address, counter = envelope.counter, "Encrypted message");
        Ok(envelope)
    }

    /// Decrypt an envelope from a peer
    ///
    /// First-contact envelopes for an unknown negotiation are handed to the
    /// negotiator; everything else needs an existing session.
    pub async fn decrypt(&self, address: &PeerAddress, envelope: &EncryptedEnvelope) -> SessionResult<Vec<u8>> {
        envelope.validate()?;
        if envelope.sender() != *address {
            return Err(SessionError::MalformedEnvelope(format!(
                "envelope from {} routed to {}",
                envelope.sender(),
                address
            )));
        }

        let existing = self.store.load_session(address).await?;
        let state = match (&envelope.pre_key, existing) {
            (Some(header), Some(state)) if state.base_key() == header.ephemeral_key.as_slice() => state,
            (Some(_), _) => return self.negotiator.process_first_message(address, envelope).await,
            (None, Some(state)) => state,
            (None, None) => return Err(SessionError::SessionNotFound(address.to_string())),
        };

        self.ensure_trusted(address, &state, Direction::Receiving).await?;

        let mut working = state;
        let plaintext = match working.decrypt(envelope, &self.config) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(peer = %address, counter = envelope.counter, error = %e, "Decryption failed");
                return Err(e);
            }
        };
        self.store.save_session(address, &working).await?;

        tracing::debug!(peer = %address, counter = envelope.counter, "Decrypted message");
        Ok(plaintext)
    }
}

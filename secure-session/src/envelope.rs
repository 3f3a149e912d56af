//! Wire envelope
//!
//! An [`EncryptedEnvelope`] is the only thing the transport ever carries:
//! routing identifiers, the chain counter, the nonce and the ciphertext. First
//! contact envelopes also carry the initiator's [`PreKeyHeader`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::PeerAddress;
use crate::crypto::x3dh::PreKeyHeader;
use crate::error::{SessionError, SessionResult};

/// AES-GCM nonce length
pub const NONCE_LENGTH: usize = 12;

const AD_LABEL: &[u8] = b"SecureSession envelope v1";

/// Encrypted message unit exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    /// Sender user identifier
    pub sender_id: String,
    /// Sender device id
    pub device_id: u32,
    /// Position in the sender's sending chain
    pub counter: u32,
    /// Key agreement header, present until the sender has heard back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_key: Option<PreKeyHeader>,
    /// AEAD nonce
    #[serde(with = "crate::util::serde_b64")]
    pub nonce: Vec<u8>,
    /// Ciphertext including the authentication tag
    #[serde(with = "crate::util::serde_b64")]
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    /// Address of the sending installation
    pub fn sender(&self) -> PeerAddress {
        PeerAddress::new(self.sender_id.clone(), self.device_id)
    }

    /// True when the envelope carries key agreement material
    pub fn is_pre_key(&self) -> bool {
        self.pre_key.is_some()
    }

    /// Check field presence and sizes
    pub fn validate(&self) -> SessionResult<()> {
        if self.sender_id.is_empty() {
            return Err(SessionError::MalformedEnvelope("sender id missing".to_string()));
        }
        if self.nonce.len() != NONCE_LENGTH {
            return Err(SessionError::MalformedEnvelope(format!(
                "nonce is {} bytes, expected {}",
                self.nonce.len(),
                NONCE_LENGTH
            )));
        }
        if self.ciphertext.is_empty() {
            return Err(SessionError::MalformedEnvelope("ciphertext missing".to_string()));
        }
        if let Some(header) = &self.pre_key {
            header.validate()?;
        }
        Ok(())
    }

    /// Bytes authenticated alongside the ciphertext
    ///
    /// Binds routing identifiers, the counter and the key agreement header so
    /// none of them can be swapped without failing decryption.
    pub fn associated_data(&self) -> Vec<u8> {
        associated_data(&self.sender_id, self.device_id, self.counter, self.pre_key.as_ref())
    }

    /// Serialize for transmission
    pub fn to_bytes(&self) -> SessionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate a received envelope
    pub fn from_bytes(bytes: &[u8]) -> SessionResult<Self> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|e| SessionError::MalformedEnvelope(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

pub(crate) fn associated_data(
    sender_id: &str,
    device_id: u32,
    counter: u32,
    pre_key: Option<&PreKeyHeader>,
) -> Vec<u8> {
    let mut ad = Vec::with_capacity(AD_LABEL.len() + sender_id.len() + 96);
    ad.extend_from_slice(AD_LABEL);
    ad.extend_from_slice(&(sender_id.len() as u32).to_be_bytes());
    ad.extend_from_slice(sender_id.as_bytes());
    ad.extend_from_slice(&device_id.to_be_bytes());
    ad.extend_from_slice(&counter.to_be_bytes());

    match pre_key {
        Some(header) => {
            ad.push(1);
            ad.extend_from_slice(&header.identity_key);
            ad.extend_from_slice(&header.registration_id.to_be_bytes());
            ad.extend_from_slice(&header.ephemeral_key);
            ad.extend_from_slice(&header.signed_pre_key_id.to_be_bytes());
            match header.one_time_pre_key_id {
                Some(id) => {
                    ad.push(1);
                    ad.extend_from_slice(&id.to_be_bytes());
                }
                None => ad.push(0),
            }
        }
        None => ad.push(0),
    }

    ad
}

/// A decrypted message handed to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: Uuid,
    pub sender: PeerAddress,
    pub plaintext: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(sender: PeerAddress, plaintext: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            plaintext,
            received_at: Utc::now(),
        }
    }

    /// Plaintext as UTF-8, if it is text
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.plaintext).ok()
    }
}

//! Error types for the secure session layer
//!
//! Cryptographic and trust failures each get their own variant so callers can
//! decide whether to block, warn, or prompt re-verification. None of them are
//! ever folded into a generic error.

use thiserror::Error;

/// Errors raised by identity, store, negotiation and codec operations
#[derive(Debug, Error)]
pub enum SessionError {
    /// No local identity has been provisioned yet
    #[error("Local identity not provisioned")]
    NotProvisioned,

    /// Provisioning was attempted while an identity already exists
    #[error("Local identity already provisioned")]
    AlreadyProvisioned,

    /// One-time pre-key is unknown or already consumed
    #[error("Pre-key {0} not found (exhausted or replayed)")]
    PreKeyNotFound(u32),

    /// A first message whose negotiation was already accepted
    #[error("First message already accepted for signed pre-key {signed_pre_key_id}")]
    FirstMessageReplayed { signed_pre_key_id: u32 },

    /// Signed pre-key is unknown or was purged
    #[error("Signed pre-key {0} not found")]
    SignedPreKeyNotFound(u32),

    /// Bundle signature did not verify against the bundle identity key
    #[error("Invalid signed pre-key signature: {0}")]
    InvalidSignature(String),

    /// Authentication failure, replayed or out-of-window counter, wrong key
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The peer presented an identity key that is not (or no longer) trusted
    #[error("Identity key changed for peer: {peer_id}")]
    IdentityChanged { peer_id: String },

    /// No session exists for the peer address
    #[error("No session found for peer: {0}")]
    SessionNotFound(String),

    /// Bundle is missing fields or carries keys of the wrong size
    #[error("Malformed pre-key bundle: {0}")]
    MalformedBundle(String),

    /// Envelope is missing fields or carries values of the wrong size
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Failed to parse or decode a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Failed to derive a shared secret
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// Negotiation with this peer is blocked after repeated trust failures
    #[error("Peer {peer_id} quarantined after {failures} failed negotiations")]
    PeerQuarantined { peer_id: String, failures: u32 },

    /// The key directory has nothing published for the peer
    #[error("No pre-key bundle published for: {0}")]
    BundleNotFound(String),

    /// The key directory rejected or failed a request
    #[error("Key directory error: {0}")]
    Directory(String),

    /// Invalid caller input (e.g. purging the current signed pre-key)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// The transport could not carry the envelope
    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// True for failures that speak to the authenticity of a peer's keys.
    ///
    /// These are the outcomes counted by the negotiation quarantine policy.
    pub fn is_trust_failure(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidSignature(_) | SessionError::IdentityChanged { .. }
        )
    }
}

impl From<vodozemac::KeyError> for SessionError {
    fn from(e: vodozemac::KeyError) -> Self {
        SessionError::InvalidKey(e.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(e: serde_json::Error) -> Self {
        SessionError::Serialization(e.to_string())
    }
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

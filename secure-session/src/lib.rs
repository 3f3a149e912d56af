//! Secure session layer
//!
//! End-to-end encrypted sessions between peer devices: long-term identity
//! keys, published pre-key bundles, X3DH session establishment, a symmetric
//! chain ratchet per direction, and a transport that only ever carries
//! encrypted envelopes.
//!
//! Most applications only need [`SecureClient`] together with a
//! [`SessionStore`], a [`KeyDirectory`] and a [`Transport`].

pub mod address;
pub mod client;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod negotiator;
pub mod store;
pub mod transport;
pub mod util;

pub use address::{PeerAddress, DEFAULT_DEVICE_ID};
pub use client::SecureClient;
pub use codec::MessageCodec;
pub use config::{Config, PreKeyConfig, SessionConfig, TransportConfig};
pub use crypto::{PreKeyBundle, SessionState, SessionStats};
pub use directory::{HttpDirectory, KeyDirectory, MemoryDirectory, PublishedKeys};
pub use envelope::{EncryptedEnvelope, InboundMessage};
pub use error::{SessionError, SessionResult};
pub use identity::{IdentityManager, LocalIdentity, PreKeyStatus};
pub use negotiator::SessionNegotiator;
pub use store::{Direction, MemoryStore, SessionStore, SqliteStore, TrustedIdentity};
pub use transport::{ConnectionStatus, Credential, Transport, TransportError};

/// Install a `tracing` subscriber filtered by `RUST_LOG`
///
/// Defaults to `secure_session=info`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secure_session=info".into()),
        )
        .try_init();
}

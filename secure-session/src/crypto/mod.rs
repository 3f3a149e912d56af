//! Cryptographic primitives
//!
//! - **keys**: identity, signed pre-key and one-time pre-key material
//! - **x3dh**: Extended Triple Diffie-Hellman key agreement
//! - **ratchet**: per-direction HMAC chain ratchet and the session state
//!
//! Nothing in here touches storage or the network.

pub mod keys;
pub mod ratchet;
pub mod x3dh;

pub use keys::{fingerprint, Curve25519KeyPair, IdentityKeyPair, OneTimePreKey, SignedPreKey, SignedPreKeyRecord};
pub use ratchet::{SessionState, SessionStats};
pub use x3dh::{x3dh_initiate, x3dh_respond, PreKeyBundle, PreKeyHeader, X3dhResult};

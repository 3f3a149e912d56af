//! Key types and generation
//!
//! - Identity keys (Ed25519) for long-term identity and signing, converted to
//!   Curve25519 when they take part in X3DH
//! - Curve25519 key pairs for Diffie-Hellman (signed and one-time pre-keys,
//!   ephemeral keys)
//! - Public descriptors of pre-keys for bundle publication

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use vodozemac::{Curve25519PublicKey, Curve25519SecretKey, Ed25519PublicKey, Ed25519SecretKey};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{SessionError, SessionResult};

/// Size of every public key this crate handles
pub const KEY_LENGTH: usize = 32;

/// Size of an Ed25519 signature
pub const SIGNATURE_LENGTH: usize = 64;

/// Largest registration id handed out (same range as Signal clients)
pub const MAX_REGISTRATION_ID: u32 = 16380;

/// Generate a registration id in `1..=MAX_REGISTRATION_ID`
pub fn generate_registration_id() -> u32 {
    rand::thread_rng().gen_range(1..=MAX_REGISTRATION_ID)
}

fn to_array(bytes: &[u8], what: &str) -> SessionResult<[u8; KEY_LENGTH]> {
    bytes
        .try_into()
        .map_err(|_| SessionError::InvalidKey(format!("{} must be {} bytes", what, KEY_LENGTH)))
}

/// Long-term identity key pair (Ed25519)
///
/// Used for:
/// - Signing pre-keys to prove ownership
/// - X3DH, through its Curve25519 equivalent
/// - Key fingerprints for out-of-band verification
pub struct IdentityKeyPair {
    /// Public key (safe to share)
    pub public: Ed25519PublicKey,
    /// Secret key (never leaves the store)
    secret: Ed25519SecretKey,
}

impl IdentityKeyPair {
    /// Generate a new random identity key pair
    pub fn generate() -> Self {
        let secret = Ed25519SecretKey::new();
        let public = secret.public_key();
        Self { public, secret }
    }

    /// Restore from the 32-byte secret seed
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> SessionResult<Self> {
        let mut seed = to_array(secret_bytes, "Identity secret key")?;
        let secret = Ed25519SecretKey::from_slice(&seed);
        seed.zeroize();
        let public = secret.public_key();
        Ok(Self { public, secret })
    }

    /// Sign a message with this identity key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.secret.sign(message).to_bytes().to_vec()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.as_bytes().to_vec()
    }

    /// Get the secret seed bytes (for sealed storage)
    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }

    /// Short fingerprint for key verification
    pub fn fingerprint(&self) -> String {
        fingerprint(self.public.as_bytes())
    }

    /// Curve25519 key pair equivalent to this identity, for Diffie-Hellman
    ///
    /// The Ed25519 seed is hashed with SHA-512 and the clamped lower half is
    /// the X25519 scalar, so the public half matches [`identity_dh_public`].
    pub fn to_curve25519(&self) -> Curve25519KeyPair {
        let seed = self.secret_key_bytes();
        let hash = Sha512::digest(seed.as_slice());

        let mut scalar = [0u8; KEY_LENGTH];
        scalar.copy_from_slice(&hash[..KEY_LENGTH]);
        scalar[0] &= 248;
        scalar[31] &= 127;
        scalar[31] |= 64;

        let pair = Curve25519KeyPair::from_secret(Curve25519SecretKey::from_slice(&scalar));
        scalar.zeroize();
        pair
    }
}

impl Clone for IdentityKeyPair {
    fn clone(&self) -> Self {
        let seed = self.secret_key_bytes();
        let mut arr = [0u8; KEY_LENGTH];
        arr.copy_from_slice(&seed);
        let secret = Ed25519SecretKey::from_slice(&arr);
        arr.zeroize();
        Self { public: self.public, secret }
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// Fingerprint of a public identity key: first 8 bytes of SHA-256, hex
pub fn fingerprint(public_key: &[u8]) -> String {
    let hash = Sha256::digest(public_key);
    hex::encode(&hash[..8])
}

/// Parse an Ed25519 identity public key
pub fn parse_identity_key(bytes: &[u8]) -> SessionResult<Ed25519PublicKey> {
    let arr = to_array(bytes, "Identity key")?;
    Ed25519PublicKey::from_slice(&arr)
        .map_err(|e| SessionError::InvalidKey(format!("Invalid identity key: {:?}", e)))
}

/// Convert a peer's Ed25519 identity key to its Curve25519 equivalent
pub fn identity_dh_public(identity: &Ed25519PublicKey) -> SessionResult<Curve25519PublicKey> {
    use curve25519_dalek::edwards::CompressedEdwardsY;

    let compressed = CompressedEdwardsY::from_slice(identity.as_bytes())
        .map_err(|e| SessionError::InvalidKey(format!("Invalid Ed25519 public key: {:?}", e)))?;

    let point = compressed.decompress().ok_or_else(|| {
        SessionError::InvalidKey("Failed to decompress Ed25519 public key".to_string())
    })?;

    Curve25519PublicKey::from_slice(&point.to_montgomery().to_bytes()).map_err(Into::into)
}

/// Parse a Curve25519 public key
pub fn parse_curve_key(bytes: &[u8]) -> SessionResult<Curve25519PublicKey> {
    let arr = to_array(bytes, "Curve25519 key")?;
    Curve25519PublicKey::from_slice(&arr).map_err(Into::into)
}

/// Curve25519 key pair for Diffie-Hellman key exchange
///
/// Used for ephemeral keys in X3DH, signed pre-keys and one-time pre-keys.
pub struct Curve25519KeyPair {
    /// Public key (safe to share)
    pub public: Curve25519PublicKey,
    /// Secret key (never leaves the store)
    secret: Curve25519SecretKey,
}

impl Curve25519KeyPair {
    /// Generate a new random Curve25519 key pair
    pub fn generate() -> Self {
        Self::from_secret(Curve25519SecretKey::new())
    }

    fn from_secret(secret: Curve25519SecretKey) -> Self {
        let public = Curve25519PublicKey::from(&secret);
        Self { public, secret }
    }

    /// Restore from the 32-byte secret; the public half is recomputed
    pub fn from_secret_bytes(secret_bytes: &[u8]) -> SessionResult<Self> {
        let mut arr = to_array(secret_bytes, "Secret key")?;
        let pair = Self::from_secret(Curve25519SecretKey::from_slice(&arr));
        arr.zeroize();
        Ok(pair)
    }

    /// Perform Diffie-Hellman key exchange
    pub fn diffie_hellman(&self, their_public: &Curve25519PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.public.to_bytes().to_vec()
    }

    /// Get the secret key bytes (for sealed storage)
    pub fn secret_key_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.secret.to_bytes().to_vec())
    }
}

impl Clone for Curve25519KeyPair {
    fn clone(&self) -> Self {
        let secret = self.secret_key_bytes();
        let mut arr = [0u8; KEY_LENGTH];
        arr.copy_from_slice(&secret);
        let pair = Self::from_secret(Curve25519SecretKey::from_slice(&arr));
        arr.zeroize();
        pair
    }
}

impl std::fmt::Debug for Curve25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519KeyPair")
            .field("public", &hex::encode(self.public.to_bytes()))
            .finish_non_exhaustive()
    }
}

/// Public descriptor of a signed pre-key, as published in bundles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPreKey {
    /// Unique identifier for this pre-key
    pub key_id: u32,
    /// The Curve25519 public key
    #[serde(with = "crate::util::serde_b64")]
    pub public_key: Vec<u8>,
    /// Ed25519 signature of the public key by the identity key
    #[serde(with = "crate::util::serde_b64")]
    pub signature: Vec<u8>,
}

impl SignedPreKey {
    /// Verify the signature with the identity public key
    pub fn verify(&self, identity_public: &Ed25519PublicKey) -> SessionResult<()> {
        let signature = vodozemac::Ed25519Signature::from_slice(&self.signature).map_err(|e| {
            SessionError::InvalidSignature(format!("Invalid signature format: {:?}", e))
        })?;

        identity_public
            .verify(&self.public_key, &signature)
            .map_err(|e| SessionError::InvalidSignature(e.to_string()))
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> SessionResult<Curve25519PublicKey> {
        parse_curve_key(&self.public_key)
    }
}

/// Signed pre-key with its secret half, as kept in the store
#[derive(Debug, Clone)]
pub struct SignedPreKeyRecord {
    /// Unique identifier for this pre-key
    pub key_id: u32,
    /// The key pair
    pub key_pair: Curve25519KeyPair,
    /// Ed25519 signature of the public key
    pub signature: Vec<u8>,
    /// Unix timestamp when this pre-key was created
    pub created_at: i64,
}

impl SignedPreKeyRecord {
    /// Generate a fresh signed pre-key
    pub fn generate(key_id: u32, identity: &IdentityKeyPair) -> Self {
        let key_pair = Curve25519KeyPair::generate();
        let signature = identity.sign(&key_pair.public_key_bytes());

        Self {
            key_id,
            key_pair,
            signature,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Public descriptor for publication
    pub fn public(&self) -> SignedPreKey {
        SignedPreKey {
            key_id: self.key_id,
            public_key: self.key_pair.public_key_bytes(),
            signature: self.signature.clone(),
        }
    }

    /// Check if this pre-key is older than `max_age_days`
    pub fn is_expired(&self, max_age_days: i64) -> bool {
        let age_seconds = chrono::Utc::now().timestamp() - self.created_at;
        age_seconds > max_age_days * 24 * 60 * 60
    }
}

/// Public half of a one-time pre-key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneTimePreKey {
    /// Unique identifier for this pre-key
    pub key_id: u32,
    /// The Curve25519 public key
    #[serde(with = "crate::util::serde_b64")]
    pub public_key: Vec<u8>,
}

impl OneTimePreKey {
    /// Describe a one-time pre-key by its public half
    pub fn new(key_id: u32, key_pair: &Curve25519KeyPair) -> Self {
        Self {
            key_id,
            public_key: key_pair.public_key_bytes(),
        }
    }

    /// Get the Curve25519 public key
    pub fn get_public_key(&self) -> SessionResult<Curve25519PublicKey> {
        parse_curve_key(&self.public_key)
    }
}

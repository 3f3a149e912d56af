//! Session chain state
//!
//! A session holds one sending and one receiving symmetric chain, both seeded
//! from the X3DH shared secret. Every message advances its chain:
//!
//! 1. A message key is derived from the current chain key (HMAC-SHA256)
//! 2. The next chain key is derived and replaces the old one
//! 3. The message key encrypts exactly one envelope (AES-256-GCM) and is dropped
//!
//! Out-of-order delivery is tolerated inside a bounded window: keys for
//! skipped counters are kept (up to a cap) and removed when used, so a counter
//! can never be decrypted twice.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::address::PeerAddress;
use crate::config::SessionConfig;
use crate::crypto::keys::IdentityKeyPair;
use crate::crypto::x3dh::{PreKeyHeader, X3dhResult};
use crate::envelope::{associated_data, EncryptedEnvelope, NONCE_LENGTH};
use crate::error::{SessionError, SessionResult};

type HmacSha256 = Hmac<Sha256>;

const CHAIN_LABEL: &[u8] = b"chain";
const MESSAGE_LABEL: &[u8] = b"message";
const CHAINS_INFO: &[u8] = b"SecureSession chains v1";

/// A single-use message key
pub struct MessageKey {
    key: [u8; 32],
    index: u32,
}

impl MessageKey {
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Symmetric chain key and the counter of the next message it produces
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ChainKey {
    key: [u8; 32],
    index: u32,
}

impl ChainKey {
    pub fn new(seed: [u8; 32]) -> Self {
        Self { key: seed, index: 0 }
    }

    /// Counter of the next message key this chain yields
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Derive the current message key and the following chain key
    pub fn advance(&self) -> SessionResult<(MessageKey, ChainKey)> {
        if self.index == u32::MAX {
            return Err(SessionError::Internal("chain counter exhausted".to_string()));
        }

        let message_key = MessageKey {
            key: self.derive(MESSAGE_LABEL),
            index: self.index,
        };
        let next = ChainKey {
            key: self.derive(CHAIN_LABEL),
            index: self.index + 1,
        };
        Ok((message_key, next))
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let mut out = [0u8; 32];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Split the X3DH secret into (initiator-to-responder, responder-to-initiator) chains
fn derive_chains(shared_secret: &[u8; 32]) -> SessionResult<(ChainKey, ChainKey)> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 64];
    hkdf.expand(CHAINS_INFO, &mut okm)
        .map_err(|e| SessionError::KeyExchangeFailed(format!("HKDF expansion failed: {}", e)))?;

    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    first.copy_from_slice(&okm[..32]);
    second.copy_from_slice(&okm[32..]);
    okm.zeroize();

    Ok((ChainKey::new(first), ChainKey::new(second)))
}

fn seal(key: &MessageKey, nonce: &[u8], plaintext: &[u8], ad: &[u8]) -> SessionResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.key()));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: ad })
        .map_err(|_| SessionError::Internal("AES-GCM encryption failed".to_string()))
}

fn open(key: &MessageKey, nonce: &[u8], ciphertext: &[u8], ad: &[u8]) -> SessionResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.key()));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: ad })
        .map_err(|_| SessionError::DecryptionFailed("authentication failed".to_string()))
}

/// Negotiated per-peer session state
///
/// Serializable so stores can persist it after every ratchet step.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    local_identity: Vec<u8>,
    remote_identity: Vec<u8>,
    remote_registration_id: u32,
    /// Initiator's ephemeral key; identifies which negotiation produced this session
    base_key: Vec<u8>,
    sending: ChainKey,
    receiving: ChainKey,
    skipped: BTreeMap<u32, [u8; 32]>,
    /// Header the initiator repeats until the responder's first reply arrives
    pending_pre_key: Option<PreKeyHeader>,
    messages_sent: u64,
    messages_received: u64,
    created_at: i64,
}

impl SessionState {
    /// Session for the side that consumed a bundle
    pub fn initiator(
        local_identity: &IdentityKeyPair,
        local_registration_id: u32,
        remote_identity: Vec<u8>,
        remote_registration_id: u32,
        agreement: &X3dhResult,
    ) -> SessionResult<Self> {
        let (to_responder, to_initiator) = derive_chains(&agreement.shared_secret)?;

        let header = PreKeyHeader {
            identity_key: local_identity.public_key_bytes(),
            registration_id: local_registration_id,
            ephemeral_key: agreement.ephemeral_public.clone(),
            signed_pre_key_id: agreement.signed_pre_key_id,
            one_time_pre_key_id: agreement.used_one_time_pre_key,
        };

        Ok(Self {
            local_identity: local_identity.public_key_bytes(),
            remote_identity,
            remote_registration_id,
            base_key: agreement.ephemeral_public.clone(),
            sending: to_responder,
            receiving: to_initiator,
            skipped: BTreeMap::new(),
            pending_pre_key: Some(header),
            messages_sent: 0,
            messages_received: 0,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Session for the side that received a first message
    pub fn responder(
        local_identity: &IdentityKeyPair,
        header: &PreKeyHeader,
        shared_secret: &[u8; 32],
    ) -> SessionResult<Self> {
        let (to_responder, to_initiator) = derive_chains(shared_secret)?;

        Ok(Self {
            local_identity: local_identity.public_key_bytes(),
            remote_identity: header.identity_key.clone(),
            remote_registration_id: header.registration_id,
            base_key: header.ephemeral_key.clone(),
            sending: to_initiator,
            receiving: to_responder,
            skipped: BTreeMap::new(),
            pending_pre_key: None,
            messages_sent: 0,
            messages_received: 0,
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Peer identity key pinned when the session was negotiated
    pub fn remote_identity(&self) -> &[u8] {
        &self.remote_identity
    }

    pub fn remote_registration_id(&self) -> u32 {
        self.remote_registration_id
    }

    pub fn base_key(&self) -> &[u8] {
        &self.base_key
    }

    /// True while the initiator has not yet heard back from the responder
    pub fn has_pending_pre_key(&self) -> bool {
        self.pending_pre_key.is_some()
    }

    pub fn sending_index(&self) -> u32 {
        self.sending.index()
    }

    pub fn receiving_index(&self) -> u32 {
        self.receiving.index()
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Encrypt one message, advancing the sending chain
    ///
    /// A fresh random nonce and a fresh message key are used on every call.
    pub fn encrypt(&mut self, sender: &PeerAddress, plaintext: &[u8]) -> SessionResult<EncryptedEnvelope> {
        let (message_key, next) = self.sending.advance()?;

        let mut nonce = vec![0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ad = associated_data(
            &sender.name,
            sender.device_id,
            message_key.index(),
            self.pending_pre_key.as_ref(),
        );
        let ciphertext = seal(&message_key, &nonce, plaintext, &ad)?;

        let envelope = EncryptedEnvelope {
            sender_id: sender.name.clone(),
            device_id: sender.device_id,
            counter: message_key.index(),
            pre_key: self.pending_pre_key.clone(),
            nonce,
            ciphertext,
        };

        self.sending = next;
        self.messages_sent += 1;
        Ok(envelope)
    }

    /// Decrypt one message, advancing the receiving chain
    ///
    /// State only changes when decryption succeeds.
    pub fn decrypt(&mut self, envelope: &EncryptedEnvelope, config: &SessionConfig) -> SessionResult<Vec<u8>> {
        envelope.validate()?;

        if let Some(header) = &envelope.pre_key {
            if header.identity_key != self.remote_identity {
                return Err(SessionError::DecryptionFailed(
                    "identity key does not match session".to_string(),
                ));
            }
            if header.ephemeral_key != self.base_key {
                return Err(SessionError::DecryptionFailed(
                    "envelope belongs to a different session".to_string(),
                ));
            }
        }

        let counter = envelope.counter;
        let ad = envelope.associated_data();

        if counter < self.receiving.index() {
            let Some(key) = self.skipped.get(&counter) else {
                return Err(SessionError::DecryptionFailed(format!(
                    "message {} already received or outside the window",
                    counter
                )));
            };
            let message_key = MessageKey { key: *key, index: counter };
            let plaintext = open(&message_key, &envelope.nonce, &envelope.ciphertext, &ad)?;

            if let Some(mut used) = self.skipped.remove(&counter) {
                used.zeroize();
            }
            self.on_received();
            return Ok(plaintext);
        }

        let gap = counter - self.receiving.index();
        if gap > config.max_skip {
            return Err(SessionError::DecryptionFailed(format!(
                "message {} is {} ahead of the receiving chain (window {})",
                counter, gap, config.max_skip
            )));
        }

        let mut chain = self.receiving.clone();
        let mut skipped = Vec::with_capacity(gap as usize);
        while chain.index() < counter {
            let (message_key, next) = chain.advance()?;
            skipped.push((message_key.index(), *message_key.key()));
            chain = next;
        }
        let (message_key, next) = chain.advance()?;

        let plaintext = open(&message_key, &envelope.nonce, &envelope.ciphertext, &ad)?;

        self.receiving = next;
        self.skipped.extend(skipped);
        while self.skipped.len() > config.max_skipped_keys {
            if let Some((_, mut evicted)) = self.skipped.pop_first() {
                evicted.zeroize();
            }
        }
        self.on_received();
        Ok(plaintext)
    }

    fn on_received(&mut self) {
        self.messages_received += 1;
        // Any reply proves the responder holds the session
        self.pending_pre_key = None;
    }

    /// Statistics about this session
    pub fn stats(&self, peer: &PeerAddress) -> SessionStats {
        SessionStats {
            peer: peer.clone(),
            fingerprint: crate::crypto::keys::fingerprint(&self.remote_identity),
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            created_at: self.created_at,
        }
    }
}

impl Drop for SessionState {
    fn drop(&mut self) {
        for key in self.skipped.values_mut() {
            key.zeroize();
        }
    }
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("remote", &crate::crypto::keys::fingerprint(&self.remote_identity))
            .field("sending", &self.sending)
            .field("receiving", &self.receiving)
            .field("skipped", &self.skipped.len())
            .field("pending_pre_key", &self.pending_pre_key.is_some())
            .finish()
    }
}

/// Statistics about a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub peer: PeerAddress,
    pub fingerprint: String,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{Curve25519KeyPair, OneTimePreKey, SignedPreKeyRecord};
    use crate::crypto::x3dh::{x3dh_initiate, x3dh_respond_to_header, PreKeyBundle};
    use proptest::prelude::*;

    struct Pair {
        alice: SessionState,
        bob: SessionState,
        alice_addr: PeerAddress,
        bob_addr: PeerAddress,
    }

    fn session_pair() -> Pair {
        let alice_identity = IdentityKeyPair::generate();
        let bob_identity = IdentityKeyPair::generate();
        let bob_signed = SignedPreKeyRecord::generate(1, &bob_identity);
        let bob_otk = Curve25519KeyPair::generate();

        let bundle = PreKeyBundle {
            identity_key: bob_identity.public_key_bytes(),
            registration_id: 22,
            device_id: 1,
            signed_pre_key: bob_signed.public(),
            one_time_pre_key: Some(OneTimePreKey::new(5, &bob_otk)),
        };
        let agreement = x3dh_initiate(&alice_identity, &bundle).unwrap();
        let alice = SessionState::initiator(
            &alice_identity,
            11,
            bob_identity.public_key_bytes(),
            22,
            &agreement,
        )
        .unwrap();

        let header = alice.pending_pre_key.clone().unwrap();
        let secret =
            x3dh_respond_to_header(&bob_identity, &bob_signed.key_pair, Some(&bob_otk), &header)
                .unwrap();
        let bob = SessionState::responder(&bob_identity, &header, &secret).unwrap();

        Pair {
            alice,
            bob,
            alice_addr: PeerAddress::new("alice", 1),
            bob_addr: PeerAddress::new("bob", 1),
        }
    }

    fn config() -> SessionConfig {
        SessionConfig {
            max_skip: 10,
            max_skipped_keys: 4,
        }
    }

    #[test]
    fn test_chain_advance_is_deterministic_and_unique() {
        let chain = ChainKey::new([3u8; 32]);
        let (k0, next) = chain.advance().unwrap();
        let (k0_again, _) = ChainKey::new([3u8; 32]).advance().unwrap();
        let (k1, _) = next.advance().unwrap();

        assert_eq!(k0.key(), k0_again.key());
        assert_ne!(k0.key(), k1.key());
        assert_eq!(k1.index(), 1);
    }

    #[test]
    fn test_round_trip_both_directions() {
        let mut pair = session_pair();

        let first = pair.alice.encrypt(&pair.alice_addr, b"hello").unwrap();
        assert!(first.pre_key.is_some());
        assert_eq!(pair.bob.decrypt(&first, &config()).unwrap(), b"hello");

        let reply = pair.bob.encrypt(&pair.bob_addr, b"hi alice").unwrap();
        assert!(reply.pre_key.is_none());
        assert_eq!(pair.alice.decrypt(&reply, &config()).unwrap(), b"hi alice");

        // Alice has heard back, so her header is gone
        assert!(!pair.alice.has_pending_pre_key());
        let second = pair.alice.encrypt(&pair.alice_addr, b"again").unwrap();
        assert!(second.pre_key.is_none());
        assert_eq!(pair.bob.decrypt(&second, &config()).unwrap(), b"again");
    }

    #[test]
    fn test_same_plaintext_yields_different_ciphertext() {
        let mut pair = session_pair();
        let a = pair.alice.encrypt(&pair.alice_addr, b"same").unwrap();
        let b = pair.alice.encrypt(&pair.alice_addr, b"same").unwrap();

        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.counter, b.counter);
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut pair = session_pair();
        let m0 = pair.alice.encrypt(&pair.alice_addr, b"zero").unwrap();
        let m1 = pair.alice.encrypt(&pair.alice_addr, b"one").unwrap();
        let m2 = pair.alice.encrypt(&pair.alice_addr, b"two").unwrap();

        assert_eq!(pair.bob.decrypt(&m2, &config()).unwrap(), b"two");
        assert_eq!(pair.bob.skipped_key_count(), 2);
        assert_eq!(pair.bob.decrypt(&m0, &config()).unwrap(), b"zero");
        assert_eq!(pair.bob.decrypt(&m1, &config()).unwrap(), b"one");
        assert_eq!(pair.bob.skipped_key_count(), 0);
    }

    #[test]
    fn test_replay_rejected() {
        let mut pair = session_pair();
        let m0 = pair.alice.encrypt(&pair.alice_addr, b"once").unwrap();

        pair.bob.decrypt(&m0, &config()).unwrap();
        assert!(matches!(
            pair.bob.decrypt(&m0, &config()),
            Err(SessionError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_out_of_window_rejected_without_state_change() {
        let mut pair = session_pair();
        let mut last = None;
        for _ in 0..=config().max_skip + 1 {
            last = Some(pair.alice.encrypt(&pair.alice_addr, b"x").unwrap());
        }

        let before = pair.bob.clone();
        let result = pair.bob.decrypt(&last.unwrap(), &config());
        assert!(matches!(result, Err(SessionError::DecryptionFailed(_))));
        assert!(pair.bob == before);
    }

    #[test]
    fn test_skipped_keys_are_bounded() {
        let mut pair = session_pair();
        let mut envelopes = Vec::new();
        for i in 0..8u8 {
            envelopes.push(pair.alice.encrypt(&pair.alice_addr, &[i]).unwrap());
        }

        pair.bob.decrypt(&envelopes[7], &config()).unwrap();
        assert_eq!(pair.bob.skipped_key_count(), config().max_skipped_keys);

        // Oldest skipped keys were evicted
        assert!(pair.bob.decrypt(&envelopes[0], &config()).is_err());
        assert_eq!(pair.bob.decrypt(&envelopes[6], &config()).unwrap(), vec![6u8]);
    }

    #[test]
    fn test_tampered_ciphertext_leaves_state_untouched() {
        let mut pair = session_pair();
        let mut envelope = pair.alice.encrypt(&pair.alice_addr, b"secret").unwrap();
        envelope.ciphertext[0] ^= 0x01;

        let before = pair.bob.clone();
        assert!(matches!(
            pair.bob.decrypt(&envelope, &config()),
            Err(SessionError::DecryptionFailed(_))
        ));
        assert!(pair.bob == before);
    }

    #[test]
    fn test_rerouted_envelope_fails() {
        let mut pair = session_pair();
        let mut envelope = pair.alice.encrypt(&pair.alice_addr, b"secret").unwrap();
        envelope.sender_id = "mallory".to_string();

        assert!(pair.bob.decrypt(&envelope, &config()).is_err());
    }

    #[test]
    fn test_session_state_serializes() {
        let mut pair = session_pair();
        pair.alice.encrypt(&pair.alice_addr, b"advance").unwrap();

        let json = serde_json::to_string(&pair.alice).unwrap();
        let restored: SessionState = serde_json::from_str(&json).unwrap();
        assert!(restored == pair.alice);
        assert_eq!(restored.sending_index(), 1);
    }

    proptest! {
        #[test]
        fn prop_decrypt_inverts_encrypt(messages in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 1..8)) {
            let mut pair = session_pair();
            for message in &messages {
                let envelope = pair.alice.encrypt(&pair.alice_addr, message).unwrap();
                let plaintext = pair.bob.decrypt(&envelope, &config()).unwrap();
                prop_assert_eq!(&plaintext, message);
            }
        }
    }
}

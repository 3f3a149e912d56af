//! End-to-end session behaviour between two devices sharing a key directory

use std::sync::Arc;

use secure_session::config::PreKeyConfig;
use secure_session::{
    Config, Direction, EncryptedEnvelope, IdentityManager, MemoryDirectory, MemoryStore, PeerAddress,
    SecureClient, SessionConfig, SessionError, SessionNegotiator, SessionStore,
};

fn config() -> Config {
    Config {
        pre_keys: PreKeyConfig {
            initial_batch_size: 10,
            replenishment_batch_size: 10,
            min_pre_key_count: 3,
            signed_pre_key_max_age_days: 7,
        },
        ..Config::default()
    }
}

struct Device {
    client: SecureClient,
    store: Arc<MemoryStore>,
}

impl Device {
    async fn bootstrap(name: &str, directory: &Arc<MemoryDirectory>, config: Config) -> Self {
        let store = Arc::new(MemoryStore::new());
        let client = SecureClient::new(store.clone(), directory.clone(), PeerAddress::new(name, 1), config);
        client.bootstrap().await.unwrap();
        Self { client, store }
    }

    fn address(&self) -> &PeerAddress {
        self.client.address()
    }
}

async fn pair() -> (Arc<MemoryDirectory>, Device, Device) {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = Device::bootstrap("alice", &directory, config()).await;
    let bob = Device::bootstrap("bob", &directory, config()).await;
    (directory, alice, bob)
}

fn flip_bit(envelope: &EncryptedEnvelope) -> EncryptedEnvelope {
    let mut tampered = envelope.clone();
    tampered.ciphertext[0] ^= 0x01;
    tampered
}

#[tokio::test]
async fn test_hello_scenario_consumes_pre_key() {
    let (directory, alice, bob) = pair().await;

    let hello = alice.client.encrypt_for(bob.address(), b"hello").await.unwrap();
    let header = hello.pre_key.clone().expect("first message carries a pre-key header");
    let otk_id = header.one_time_pre_key_id.expect("bundle carried a one-time pre-key");
    assert_eq!(directory.available_pre_keys(bob.address()).await, 9);

    let received = bob.client.receive(&hello).await.unwrap();
    assert_eq!(received.plaintext, b"hello");
    assert_eq!(received.sender, *alice.address());

    // The consumed key is gone from Bob's pool and store
    assert!(matches!(
        bob.store.load_pre_key(otk_id).await,
        Err(SessionError::PreKeyNotFound(id)) if id == otk_id
    ));
    assert_eq!(bob.store.count_pre_keys().await.unwrap(), 9);

    let reply = bob.client.encrypt_for(alice.address(), b"hello back").await.unwrap();
    assert_eq!(alice.client.receive(&reply).await.unwrap().plaintext, b"hello back");
}

#[tokio::test]
async fn test_round_trip_many_messages() {
    let (_directory, alice, bob) = pair().await;

    for i in 0..20u32 {
        let text = format!("message {i}");
        let envelope = alice.client.encrypt_for(bob.address(), text.as_bytes()).await.unwrap();
        assert_eq!(bob.client.receive(&envelope).await.unwrap().text(), Some(text.as_str()));

        let echo = bob.client.encrypt_for(alice.address(), text.as_bytes()).await.unwrap();
        assert_eq!(alice.client.receive(&echo).await.unwrap().text(), Some(text.as_str()));
    }

    let stats = alice.client.session_stats(bob.address()).await.unwrap().unwrap();
    assert_eq!(stats.messages_sent, 20);
    assert_eq!(stats.messages_received, 20);
}

#[tokio::test]
async fn test_same_plaintext_differs() {
    let (_directory, alice, bob) = pair().await;

    let first = alice.client.encrypt_for(bob.address(), b"same").await.unwrap();
    let second = alice.client.encrypt_for(bob.address(), b"same").await.unwrap();
    assert_ne!(first.ciphertext, second.ciphertext);
    assert_ne!(first.nonce, second.nonce);
}

#[tokio::test]
async fn test_out_of_order_and_replay() {
    let (_directory, alice, bob) = pair().await;

    let envelopes: Vec<_> = {
        let mut out = Vec::new();
        for i in 0..4u8 {
            out.push(alice.client.encrypt_for(bob.address(), &[i]).await.unwrap());
        }
        out
    };

    for index in [2usize, 0, 3, 1] {
        let message = bob.client.receive(&envelopes[index]).await.unwrap();
        assert_eq!(message.plaintext, vec![index as u8]);
    }

    assert!(matches!(
        bob.client.receive(&envelopes[1]).await,
        Err(SessionError::DecryptionFailed(_))
    ));
}

#[tokio::test]
async fn test_counter_beyond_window_rejected() {
    let directory = Arc::new(MemoryDirectory::new());
    let narrow = Config {
        session: SessionConfig {
            max_skip: 2,
            max_skipped_keys: 10,
        },
        ..config()
    };
    let alice = Device::bootstrap("alice", &directory, config()).await;
    let bob = Device::bootstrap("bob", &directory, narrow).await;

    let first = alice.client.encrypt_for(bob.address(), b"0").await.unwrap();
    bob.client.receive(&first).await.unwrap();

    let mut last = None;
    for _ in 0..4 {
        last = Some(alice.client.encrypt_for(bob.address(), b"later").await.unwrap());
    }
    let before = bob.store.load_session(alice.address()).await.unwrap();

    assert!(matches!(
        bob.client.receive(&last.unwrap()).await,
        Err(SessionError::DecryptionFailed(_))
    ));
    assert_eq!(bob.store.load_session(alice.address()).await.unwrap(), before);
}

#[tokio::test]
async fn test_bit_flip_leaves_session_unchanged() {
    let (_directory, alice, bob) = pair().await;

    let hello = alice.client.encrypt_for(bob.address(), b"hello").await.unwrap();
    bob.client.receive(&hello).await.unwrap();

    let envelope = alice.client.encrypt_for(bob.address(), b"payload").await.unwrap();
    let before = bob.store.load_session(alice.address()).await.unwrap().unwrap();

    assert!(matches!(
        bob.client.receive(&flip_bit(&envelope)).await,
        Err(SessionError::DecryptionFailed(_))
    ));
    let after = bob.store.load_session(alice.address()).await.unwrap().unwrap();
    assert_eq!(before, after);

    // The untouched envelope still decrypts
    assert_eq!(bob.client.receive(&envelope).await.unwrap().plaintext, b"payload");
}

#[tokio::test]
async fn test_bit_flipped_first_message_consumes_nothing() {
    let (_directory, alice, bob) = pair().await;

    let hello = alice.client.encrypt_for(bob.address(), b"hello").await.unwrap();
    let otk_id = hello.pre_key.as_ref().unwrap().one_time_pre_key_id.unwrap();

    assert!(matches!(
        bob.client.receive(&flip_bit(&hello)).await,
        Err(SessionError::DecryptionFailed(_))
    ));
    assert!(bob.store.load_pre_key(otk_id).await.is_ok());
    assert!(!bob.client.has_session(alice.address()).await.unwrap());

    bob.client.receive(&hello).await.unwrap();
}

#[tokio::test]
async fn test_pre_key_consumed_at_most_once() {
    let (_directory, alice, bob) = pair().await;
    let hello = alice.client.encrypt_for(bob.address(), b"hello").await.unwrap();
    let otk_id = hello.pre_key.as_ref().unwrap().one_time_pre_key_id.unwrap();

    let negotiator = SessionNegotiator::new(bob.store.clone(), SessionConfig::default());
    negotiator.process_first_message(alice.address(), &hello).await.unwrap();

    let second = negotiator.process_first_message(alice.address(), &hello).await;
    assert!(matches!(second, Err(SessionError::PreKeyNotFound(id)) if id == otk_id));
}

#[tokio::test]
async fn test_tampered_signature_creates_no_session() {
    let (directory, alice, bob) = pair().await;
    directory
        .tamper(bob.address(), |keys| {
            let last = keys.signed_pre_key.signature.len() - 1;
            keys.signed_pre_key.signature[last] ^= 0x80;
        })
        .await;

    assert!(matches!(
        alice.client.encrypt_for(bob.address(), b"hello").await,
        Err(SessionError::InvalidSignature(_))
    ));
    assert!(alice.store.load_session(bob.address()).await.unwrap().is_none());
    assert!(alice.store.get_trusted_identity(bob.address()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_exhausted_pool_falls_back_to_signed_pre_key() {
    let directory = Arc::new(MemoryDirectory::new());
    let tiny = Config {
        pre_keys: PreKeyConfig {
            initial_batch_size: 0,
            ..config().pre_keys
        },
        ..config()
    };
    let alice = Device::bootstrap("alice", &directory, config()).await;
    let bob = Device::bootstrap("bob", &directory, tiny).await;

    let hello = alice.client.encrypt_for(bob.address(), b"no otk").await.unwrap();
    assert_eq!(hello.pre_key.as_ref().unwrap().one_time_pre_key_id, None);
    assert_eq!(bob.client.receive(&hello).await.unwrap().plaintext, b"no otk");
}

#[tokio::test]
async fn test_replayed_first_message_without_one_time_key() {
    let directory = Arc::new(MemoryDirectory::new());
    let empty_pool = Config {
        pre_keys: PreKeyConfig {
            initial_batch_size: 0,
            ..config().pre_keys
        },
        ..config()
    };
    let alice = Device::bootstrap("alice", &directory, config()).await;
    let bob = Device::bootstrap("bob", &directory, empty_pool).await;

    let old_hello = alice.client.encrypt_for(bob.address(), b"transfer $100").await.unwrap();
    assert_eq!(old_hello.pre_key.as_ref().unwrap().one_time_pre_key_id, None);
    assert_eq!(bob.client.receive(&old_hello).await.unwrap().plaintext, b"transfer $100");

    // Alice renegotiates and the new session is confirmed both ways
    alice.client.reset_session(bob.address()).await.unwrap();
    let hello = alice.client.encrypt_for(bob.address(), b"new session").await.unwrap();
    bob.client.receive(&hello).await.unwrap();
    let reply = bob.client.encrypt_for(alice.address(), b"ok").await.unwrap();
    alice.client.receive(&reply).await.unwrap();
    let live = bob.store.load_session(alice.address()).await.unwrap().unwrap();

    assert!(matches!(
        bob.client.receive(&old_hello).await,
        Err(SessionError::FirstMessageReplayed { signed_pre_key_id: 1 })
    ));
    assert_eq!(bob.store.load_session(alice.address()).await.unwrap().unwrap(), live);

    // The replay is refused directly at the negotiator too
    let negotiator = SessionNegotiator::new(bob.store.clone(), SessionConfig::default());
    assert!(matches!(
        negotiator.process_first_message(alice.address(), &hello).await,
        Err(SessionError::FirstMessageReplayed { .. })
    ));

    let next = alice.client.encrypt_for(bob.address(), b"still live").await.unwrap();
    assert_eq!(bob.client.receive(&next).await.unwrap().plaintext, b"still live");
    assert!(!bob.client.is_quarantined(alice.address()));
}

#[tokio::test]
async fn test_replenish_after_consumption() {
    let (directory, alice, bob) = pair().await;
    let carol = Device::bootstrap("carol", &directory, config()).await;

    // Drain Bob's pool below the minimum through real negotiations
    for _ in 0..8 {
        alice.client.reset_session(bob.address()).await.unwrap();
        let hello = alice.client.encrypt_for(bob.address(), b"hi").await.unwrap();
        bob.client.receive(&hello).await.unwrap();
    }
    assert_eq!(bob.store.count_pre_keys().await.unwrap(), 2);
    assert!(bob.client.status().await.unwrap().needs_replenishment);

    assert_eq!(bob.client.replenish().await.unwrap(), 10);
    assert_eq!(bob.store.count_pre_keys().await.unwrap(), 12);
    assert_eq!(directory.available_pre_keys(bob.address()).await, 12);

    // New ids continue after the highest ever issued
    let hello = carol.client.encrypt_for(bob.address(), b"hey").await.unwrap();
    assert_eq!(hello.pre_key.as_ref().unwrap().one_time_pre_key_id, Some(9));
    bob.client.receive(&hello).await.unwrap();
}

#[tokio::test]
async fn test_identity_rotation_requires_retrust() {
    let (directory, alice, bob) = pair().await;
    let hello = alice.client.encrypt_for(bob.address(), b"hello").await.unwrap();
    bob.client.receive(&hello).await.unwrap();

    // Bob reinstalls: same address, new identity
    let new_bob = Device::bootstrap("bob", &directory, config()).await;
    let new_key = new_bob.client.local_identity().await.unwrap().identity_key;

    // The store reports the change and pins the new key unverified
    let scratch = MemoryStore::new();
    scratch.save_identity(bob.address(), &[7; 32]).await.unwrap();
    assert!(scratch.save_identity(bob.address(), &new_key).await.unwrap());
    assert!(!scratch.is_trusted(bob.address(), &new_key, Direction::Sending).await.unwrap());

    // Alice's first sight of the new key happens on receive
    let from_new_bob = new_bob.client.encrypt_for(alice.address(), b"it's me").await.unwrap();
    assert!(matches!(
        alice.client.receive(&from_new_bob).await,
        Err(SessionError::IdentityChanged { .. })
    ));
    let pinned = alice.client.trusted_identity(bob.address()).await.unwrap().unwrap();
    assert_eq!(pinned.identity_key, new_key);
    assert!(!pinned.verified);

    // Until re-trusted, the old session is blocked as well
    assert!(matches!(
        alice.client.encrypt_for(bob.address(), b"still there?").await,
        Err(SessionError::IdentityChanged { .. })
    ));

    alice.client.trust_identity(bob.address(), &new_key).await.unwrap();
    let message = alice.client.receive(&from_new_bob).await.unwrap();
    assert_eq!(message.plaintext, b"it's me");

    let reply = alice.client.encrypt_for(bob.address(), b"welcome back").await.unwrap();
    assert_eq!(new_bob.client.receive(&reply).await.unwrap().plaintext, b"welcome back");
}

#[tokio::test]
async fn test_misrouted_envelope_rejected() {
    let (directory, alice, bob) = pair().await;
    let carol = Device::bootstrap("carol", &directory, config()).await;

    let mut envelope = alice.client.encrypt_for(bob.address(), b"hello").await.unwrap();
    envelope.sender_id = carol.address().name.clone();

    // Carol never negotiated with Bob and her identity does not match the header
    let result = bob.client.receive(&envelope).await;
    assert!(result.is_err());
    assert!(!bob.client.has_session(carol.address()).await.unwrap());
}

#[tokio::test]
async fn test_identity_manager_rotation_and_purge() {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let manager = IdentityManager::new(store.clone(), PeerAddress::new("dave", 1), config().pre_keys);
    manager.bootstrap().await.unwrap();

    manager.rotate_signed_pre_key(2).await.unwrap();
    assert_eq!(manager.export_public_bundle().await.unwrap().signed_pre_key.key_id, 2);

    // The previous key still answers late first messages until purged
    assert!(store.load_signed_pre_key(1).await.is_ok());
    assert!(matches!(
        manager.purge_signed_pre_key(2).await,
        Err(SessionError::InvalidInput(_))
    ));
    manager.purge_signed_pre_key(1).await.unwrap();
    assert!(matches!(
        store.load_signed_pre_key(1).await,
        Err(SessionError::SignedPreKeyNotFound(1))
    ));
}

//! SQLite persistence across reopen and atomic pre-key consumption

use std::sync::Arc;

use secure_session::config::PreKeyConfig;
use secure_session::crypto::Curve25519KeyPair;
use secure_session::store::derive_pickle_key;
use secure_session::{
    Config, Direction, MemoryDirectory, MemoryStore, PeerAddress, SecureClient, SessionConfig, SessionError,
    SessionNegotiator, SessionStore, SqliteStore,
};

fn config() -> Config {
    Config {
        pre_keys: PreKeyConfig {
            initial_batch_size: 5,
            replenishment_batch_size: 5,
            min_pre_key_count: 2,
            signed_pre_key_max_age_days: 7,
        },
        ..Config::default()
    }
}

fn pickle_key() -> [u8; 32] {
    derive_pickle_key(b"correct horse battery staple", b"bob").unwrap()
}

async fn open(path: &str) -> Arc<SqliteStore> {
    Arc::new(SqliteStore::open(path, pickle_key()).await.unwrap())
}

#[tokio::test]
async fn test_conversation_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bob.db");
    let path = path.to_str().unwrap();

    let directory = Arc::new(MemoryDirectory::new());
    let alice = SecureClient::new(
        Arc::new(MemoryStore::new()),
        directory.clone(),
        PeerAddress::new("alice", 1),
        config(),
    );
    alice.bootstrap().await.unwrap();

    let bob_address = PeerAddress::new("bob", 1);
    let fingerprint = {
        let store = open(path).await;
        let bob = SecureClient::new(store.clone(), directory.clone(), bob_address.clone(), config());
        let identity = bob.bootstrap().await.unwrap();

        let hello = alice.encrypt_for(&bob_address, b"before restart").await.unwrap();
        assert_eq!(bob.receive(&hello).await.unwrap().plaintext, b"before restart");
        store.close().await;
        identity.fingerprint
    };

    let store = open(path).await;
    let bob = SecureClient::new(store.clone(), directory.clone(), bob_address.clone(), config());

    // Same identity, no re-provisioning, same pool minus the consumed key
    assert_eq!(bob.bootstrap().await.unwrap().fingerprint, fingerprint);
    assert_eq!(store.count_pre_keys().await.unwrap(), 4);
    assert!(store
        .is_trusted(alice.address(), &alice.local_identity().await.unwrap().identity_key, Direction::Receiving)
        .await
        .unwrap());

    let after = alice.encrypt_for(&bob_address, b"after restart").await.unwrap();
    assert_eq!(bob.receive(&after).await.unwrap().plaintext, b"after restart");

    let reply = bob.encrypt_for(alice.address(), b"still here").await.unwrap();
    assert!(!reply.is_pre_key());
    assert_eq!(alice.receive(&reply).await.unwrap().plaintext, b"still here");
}

#[tokio::test]
async fn test_first_message_consumes_key_once() {
    let directory = Arc::new(MemoryDirectory::new());
    let alice = SecureClient::new(
        Arc::new(MemoryStore::new()),
        directory.clone(),
        PeerAddress::new("alice", 1),
        config(),
    );
    alice.bootstrap().await.unwrap();

    let store = Arc::new(SqliteStore::open_in_memory(pickle_key()).await.unwrap());
    let bob = SecureClient::new(store.clone(), directory.clone(), PeerAddress::new("bob", 1), config());
    bob.bootstrap().await.unwrap();

    let hello = alice.encrypt_for(bob.address(), b"hello").await.unwrap();
    let otk_id = hello.pre_key.as_ref().unwrap().one_time_pre_key_id.unwrap();
    bob.receive(&hello).await.unwrap();
    let committed = store.load_session(alice.address()).await.unwrap().unwrap();

    let negotiator = SessionNegotiator::new(store.clone(), SessionConfig::default());
    assert!(matches!(
        negotiator.process_first_message(alice.address(), &hello).await,
        Err(SessionError::PreKeyNotFound(id)) if id == otk_id
    ));
    assert_eq!(store.load_session(alice.address()).await.unwrap().unwrap(), committed);
}

#[tokio::test]
async fn test_commit_with_missing_key_writes_nothing() {
    let store = SqliteStore::open_in_memory(pickle_key()).await.unwrap();
    let directory = Arc::new(MemoryDirectory::new());

    // Borrow a real session state from a negotiation between two memory clients
    let alice = SecureClient::new(
        Arc::new(MemoryStore::new()),
        directory.clone(),
        PeerAddress::new("alice", 1),
        config(),
    );
    let carol = SecureClient::new(
        Arc::new(MemoryStore::new()),
        directory.clone(),
        PeerAddress::new("carol", 1),
        config(),
    );
    alice.bootstrap().await.unwrap();
    carol.bootstrap().await.unwrap();
    alice.encrypt_for(carol.address(), b"x").await.unwrap();
    let state = alice.store().load_session(carol.address()).await.unwrap().unwrap();

    let peer = PeerAddress::new("carol", 1);
    assert!(matches!(
        store.commit_first_message(&peer, 1, Some(42), &state).await,
        Err(SessionError::PreKeyNotFound(42))
    ));
    assert!(store.load_session(&peer).await.unwrap().is_none());

    store.save_pre_key(42, &Curve25519KeyPair::generate()).await.unwrap();
    store.commit_first_message(&peer, 1, Some(42), &state).await.unwrap();
    assert_eq!(store.load_session(&peer).await.unwrap().unwrap(), state);
    assert_eq!(store.count_pre_keys().await.unwrap(), 0);
    assert_eq!(store.list_sessions().await.unwrap(), vec![peer.clone()]);

    // The same base key is refused even with a fresh one-time key, which survives
    store.save_pre_key(43, &Curve25519KeyPair::generate()).await.unwrap();
    assert!(matches!(
        store.commit_first_message(&peer, 1, Some(43), &state).await,
        Err(SessionError::FirstMessageReplayed { signed_pre_key_id: 1 })
    ));
    assert_eq!(store.count_pre_keys().await.unwrap(), 1);

    // Purging the signed pre-key forgets the base keys accepted under it
    store.remove_signed_pre_key(1).await.unwrap();
    store.commit_first_message(&peer, 1, None, &state).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_take_yields_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("race.db");
    let store = open(path.to_str().unwrap()).await;
    store.save_pre_key(7, &Curve25519KeyPair::generate()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move { store.take_pre_key(7).await }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(SessionError::PreKeyNotFound(7)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_trust_records_persist() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trust.db");
    let path = path.to_str().unwrap();
    let peer = PeerAddress::new("mallory", 2);

    {
        let store = open(path).await;
        assert!(store.save_identity(&peer, &[1; 32]).await.unwrap());
        assert!(!store.save_identity(&peer, &[1; 32]).await.unwrap());
        assert!(store.save_identity(&peer, &[2; 32]).await.unwrap());
        store.close().await;
    }

    let store = open(path).await;
    let record = store.get_trusted_identity(&peer).await.unwrap().unwrap();
    assert_eq!(record.identity_key, vec![2; 32]);
    assert!(!record.verified);
    assert!(!store.is_trusted(&peer, &[2; 32], Direction::Receiving).await.unwrap());

    store.trust_identity(&peer, &[2; 32]).await.unwrap();
    assert!(store.is_trusted(&peer, &[2; 32], Direction::Receiving).await.unwrap());
    assert!(!store.is_trusted(&peer, &[1; 32], Direction::Sending).await.unwrap());
}

//! Secure session demo
//!
//! Provisions two devices, exchanges a message each way over an in-process
//! relay, and prints both fingerprints. Pass a JSON config path as the first
//! argument; `SECURE_SESSION_DATABASE` switches to SQLite stores (sealed with
//! a key derived from `SECURE_SESSION_PASSPHRASE`) and
//! `SECURE_SESSION_DIRECTORY_URL` to the HTTP key directory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use secure_session::store::derive_pickle_key;
use secure_session::transport::MemoryRelay;
use secure_session::{
    init_tracing, Config, Credential, EncryptedEnvelope, HttpDirectory, KeyDirectory, MemoryDirectory,
    MemoryStore, PeerAddress, SecureClient, SessionStore, SqliteStore, Transport,
};

const PASSPHRASE_ENV: &str = "SECURE_SESSION_PASSPHRASE";

async fn open_store(config: &Config, name: &str) -> Result<Arc<dyn SessionStore>> {
    match &config.database_path {
        Some(path) => {
            let passphrase = std::env::var(PASSPHRASE_ENV)
                .with_context(|| format!("{PASSPHRASE_ENV} is required with a database path"))?;
            let pickle_key = derive_pickle_key(passphrase.as_bytes(), name.as_bytes())?;
            let store = SqliteStore::open(&format!("{path}.{name}"), pickle_key).await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

fn open_directory(config: &Config) -> Result<Arc<dyn KeyDirectory>> {
    match &config.directory_url {
        Some(url) => Ok(Arc::new(HttpDirectory::new(url)?)),
        None => Ok(Arc::new(MemoryDirectory::new())),
    }
}

async fn next_envelope(inbound: &mut mpsc::Receiver<EncryptedEnvelope>) -> Result<EncryptedEnvelope> {
    match tokio::time::timeout(Duration::from_secs(5), inbound.recv()).await {
        Ok(Some(envelope)) => Ok(envelope),
        Ok(None) => bail!("transport closed"),
        Err(_) => bail!("timed out waiting for an envelope"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading {path}"))?,
        None => Config::from_env()?,
    };

    let directory = open_directory(&config)?;
    let alice_address = PeerAddress::new("alice", 1);
    let bob_address = PeerAddress::new("bob", 1);

    let alice = SecureClient::new(
        open_store(&config, "alice").await?,
        Arc::clone(&directory),
        alice_address.clone(),
        config.clone(),
    );
    let bob = SecureClient::new(
        open_store(&config, "bob").await?,
        Arc::clone(&directory),
        bob_address.clone(),
        config.clone(),
    );

    let alice_identity = alice.bootstrap().await?;
    let bob_identity = bob.bootstrap().await?;
    println!("alice fingerprint: {}", alice_identity.fingerprint);
    println!("bob fingerprint:   {}", bob_identity.fingerprint);

    let relay = MemoryRelay::new();
    relay.register("alice", "alice-token");
    relay.register("bob", "bob-token");

    let (alice_transport, mut alice_inbound) =
        Transport::new(Arc::new(relay.connector()), config.transport.clone());
    let (bob_transport, mut bob_inbound) = Transport::new(Arc::new(relay.connector()), config.transport.clone());
    alice_transport
        .connect(Credential::new("alice", 1, "alice-token"))
        .await?;
    bob_transport.connect(Credential::new("bob", 1, "bob-token")).await?;

    alice.send(&alice_transport, &bob_address, b"Hello, Bob!").await?;
    let message = bob.receive(&next_envelope(&mut bob_inbound).await?).await?;
    println!("bob received from {}: {}", message.sender, message.text().unwrap_or("<binary>"));

    bob.send(&bob_transport, &alice_address, b"Hi Alice, got it.").await?;
    let reply = alice.receive(&next_envelope(&mut alice_inbound).await?).await?;
    println!("alice received from {}: {}", reply.sender, reply.text().unwrap_or("<binary>"));

    if let Some(stats) = alice.session_stats(&bob_address).await? {
        println!(
            "session alice -> bob: {} sent, {} received",
            stats.messages_sent, stats.messages_received
        );
    }

    alice_transport.disconnect();
    bob_transport.disconnect();
    Ok(())
}

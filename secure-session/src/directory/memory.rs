//! In-process directory

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{KeyDirectory, PublishedKeys};
use crate::address::PeerAddress;
use crate::crypto::keys::OneTimePreKey;
use crate::crypto::x3dh::PreKeyBundle;
use crate::error::{SessionError, SessionResult};

struct Entry {
    keys: PublishedKeys,
    available: VecDeque<OneTimePreKey>,
    /// Every one-time pre-key id ever accepted for the current identity
    seen: HashSet<u32>,
}

/// Directory kept in memory, doing the server-side bookkeeping
///
/// Republishing only adds one-time pre-keys it has not seen before, so keys
/// already handed to a fetcher are not handed out again.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: Mutex<HashMap<PeerAddress, Entry>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-time pre-keys still available for a device
    pub async fn available_pre_keys(&self, address: &PeerAddress) -> usize {
        self.entries
            .lock()
            .await
            .get(address)
            .map(|entry| entry.available.len())
            .unwrap_or(0)
    }

    /// Replace the published signed pre-key without touching the pool
    ///
    /// Lets tests serve a bundle whose signature no longer matches.
    pub async fn tamper<F>(&self, address: &PeerAddress, f: F)
    where
        F: FnOnce(&mut PublishedKeys) + Send,
    {
        if let Some(entry) = self.entries.lock().await.get_mut(address) {
            f(&mut entry.keys);
        }
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn publish(&self, keys: &PublishedKeys) -> SessionResult<()> {
        let address = keys.address();
        let mut entries = self.entries.lock().await;

        let entry = entries.entry(address.clone()).or_insert_with(|| Entry {
            keys: keys.clone(),
            available: VecDeque::new(),
            seen: HashSet::new(),
        });
        if entry.keys.identity_key != keys.identity_key {
            // Re-provisioned device: pre-keys of the old identity are useless
            entry.available.clear();
            entry.seen.clear();
        }

        entry.keys = keys.clone();
        let mut added = 0;
        for otk in &keys.one_time_pre_keys {
            if entry.seen.insert(otk.key_id) {
                entry.available.push_back(otk.clone());
                added += 1;
            }
        }

        tracing::debug!(peer = %address, added, available = entry.available.len(), "Published keys");
        Ok(())
    }

    async fn fetch(&self, address: &PeerAddress) -> SessionResult<PreKeyBundle> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(address)
            .ok_or_else(|| SessionError::BundleNotFound(address.to_string()))?;

        let otk = entry.available.pop_front();
        if otk.is_none() {
            tracing::warn!(peer = %address, "One-time pre-keys exhausted, serving signed pre-key only");
        }
        Ok(entry.keys.bundle(otk))
    }
}

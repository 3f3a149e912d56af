//! Pre-key bundle directory
//!
//! The directory is where a device publishes its public key material and where
//! peers fetch a [`PreKeyBundle`] to start a session. Each fetch hands out at
//! most one one-time pre-key and never the same one twice.

mod http;
mod memory;

pub use http::HttpDirectory;
pub use memory::MemoryDirectory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::PeerAddress;
use crate::crypto::keys::{OneTimePreKey, SignedPreKey};
use crate::error::SessionResult;
use crate::crypto::x3dh::PreKeyBundle;

/// Everything a device uploads to the directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedKeys {
    pub user_id: String,
    pub device_id: u32,
    #[serde(with = "crate::util::serde_b64")]
    pub identity_key: Vec<u8>,
    pub registration_id: u32,
    pub signed_pre_key: SignedPreKey,
    #[serde(default)]
    pub one_time_pre_keys: Vec<OneTimePreKey>,
}

impl PublishedKeys {
    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.user_id.clone(), self.device_id)
    }

    /// Bundle for a fetcher, carrying the given one-time pre-key if any
    pub fn bundle(&self, one_time_pre_key: Option<OneTimePreKey>) -> PreKeyBundle {
        PreKeyBundle {
            identity_key: self.identity_key.clone(),
            registration_id: self.registration_id,
            device_id: self.device_id,
            signed_pre_key: self.signed_pre_key.clone(),
            one_time_pre_key,
        }
    }
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// Publish or refresh a device's key material
    async fn publish(&self, keys: &PublishedKeys) -> SessionResult<()>;

    /// Fetch a bundle for a peer device; `BundleNotFound` if nothing is published
    async fn fetch(&self, address: &PeerAddress) -> SessionResult<PreKeyBundle>;
}

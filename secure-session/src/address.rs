//! Peer addressing

use std::fmt;

use serde::{Deserialize, Serialize};

/// Device id used when a peer has a single installation
pub const DEFAULT_DEVICE_ID: u32 = 1;

/// A peer installation: user identifier plus device id
///
/// Sessions and pinned identities are both keyed by the full address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddress {
    pub name: String,
    pub device_id: u32,
}

impl PeerAddress {
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

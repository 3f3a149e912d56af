//! In-process relay
//!
//! Routes envelopes between connected devices and keeps a mailbox for
//! devices that are offline, flushed in order when they reconnect. A full
//! mailbox drops its oldest envelope. Also lets tests inject connection
//! failures and cut live links.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connector, Credential, Link, OutboundFrame, TransportError};
use crate::address::PeerAddress;
use crate::envelope::EncryptedEnvelope;

/// Envelopes kept per offline device
pub const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

struct RelayState {
    tokens: HashMap<String, String>,
    online: HashMap<PeerAddress, (u64, mpsc::UnboundedSender<EncryptedEnvelope>)>,
    mailboxes: HashMap<PeerAddress, VecDeque<EncryptedEnvelope>>,
    mailbox_capacity: usize,
    fail_next: u32,
    next_link_id: u64,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            tokens: HashMap::new(),
            online: HashMap::new(),
            mailboxes: HashMap::new(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            fail_next: 0,
            next_link_id: 0,
        }
    }
}

impl RelayState {
    fn stash(&mut self, address: &PeerAddress, envelope: EncryptedEnvelope) {
        let capacity = self.mailbox_capacity.max(1);
        let mailbox = self.mailboxes.entry(address.clone()).or_default();
        if mailbox.len() >= capacity {
            mailbox.pop_front();
            tracing::warn!(peer = %address, capacity, "Mailbox full, dropped oldest envelope");
        }
        mailbox.push_back(envelope);
    }

    fn detach(&mut self, address: &PeerAddress, link_id: u64) {
        if self.online.get(address).is_some_and(|(id, _)| *id == link_id) {
            self.online.remove(address);
        }
    }
}

#[derive(Default)]
struct RelayInner {
    state: Mutex<RelayState>,
}

impl RelayInner {
    fn state(&self) -> MutexGuard<'_, RelayState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, frame: OutboundFrame) {
        let OutboundFrame { recipient, envelope } = frame;
        let mut state = self.state();

        let undelivered = match state.online.get(&recipient) {
            Some((_, queue)) => match queue.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };

        state.online.remove(&recipient);
        state.stash(&recipient, undelivered);
        tracing::debug!(peer = %recipient, "Queued envelope for offline device");
    }
}

/// Relay shared by every connector created from it
#[derive(Clone, Default)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Relay whose offline mailboxes hold at most `capacity` envelopes each
    pub fn with_mailbox_capacity(capacity: usize) -> Self {
        let relay = Self::default();
        relay.inner.state().mailbox_capacity = capacity.max(1);
        relay
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Require `token` for connections as `user_id`
    pub fn register(&self, user_id: impl Into<String>, token: impl Into<String>) {
        self.inner.state().tokens.insert(user_id.into(), token.into());
    }

    /// Fail the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.state().fail_next = count;
    }

    /// Cut the live link of a device, as if the network dropped it
    pub fn drop_connection(&self, address: &PeerAddress) -> bool {
        self.inner.state().online.remove(address).is_some()
    }

    pub fn is_online(&self, address: &PeerAddress) -> bool {
        self.inner.state().online.contains_key(address)
    }

    /// Envelopes waiting for a device to come online
    pub fn pending(&self, address: &PeerAddress) -> usize {
        self.inner
            .state()
            .mailboxes
            .get(address)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    /// Attach a device to the relay, returning its link
    pub(crate) fn attach(&self, credential: &Credential, capacity: usize) -> Result<Link, TransportError> {
        attach(&self.inner, credential, capacity)
    }
}

fn attach(inner: &Arc<RelayInner>, credential: &Credential, capacity: usize) -> Result<Link, TransportError> {
    let address = credential.address();
    let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(capacity.max(1));
    let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<EncryptedEnvelope>();

    let link_id = {
        let mut state = inner.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(TransportError::Connection("relay unavailable".to_string()));
        }
        if let Some(expected) = state.tokens.get(&credential.user_id) {
            if *expected != credential.token {
                return Err(TransportError::AuthRejected(format!("bad token for {}", credential.user_id)));
            }
        }

        // Mailbox first, in arrival order, then live traffic behind it
        if let Some(mailbox) = state.mailboxes.remove(&address) {
            for envelope in mailbox {
                let _ = queue_tx.send(envelope);
            }
        }

        state.next_link_id += 1;
        let link_id = state.next_link_id;
        state.online.insert(address.clone(), (link_id, queue_tx));
        link_id
    };

    tracing::debug!(peer = %address, link_id, "Device attached to relay");

    // Relay -> device
    let forwarder = Arc::clone(inner);
    let forward_address = address.clone();
    tokio::spawn(async move {
        while let Some(envelope) = queue_rx.recv().await {
            if let Err(mpsc::error::SendError(envelope)) = in_tx.send(envelope).await {
                // Device stopped reading: keep this envelope and the rest for later
                let mut state = forwarder.state();
                state.detach(&forward_address, link_id);
                state.stash(&forward_address, envelope);
                while let Ok(rest) = queue_rx.try_recv() {
                    state.stash(&forward_address, rest);
                }
                return;
            }
        }
    });

    // Device -> relay
    let router = Arc::clone(inner);
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            router.deliver(frame);
        }
        router.state().detach(&address, link_id);
    });

    Ok(Link {
        outbound: out_tx,
        inbound: in_rx,
    })
}

#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<RelayInner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, credential: &Credential, capacity: usize) -> Result<Link, TransportError> {
        attach(&self.inner, credential, capacity)
    }
}

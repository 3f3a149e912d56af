//! Envelope transport
//!
//! [`Transport`] keeps one persistent link to a relay and only ever carries
//! [`EncryptedEnvelope`]s. Links come from a [`Connector`]:
//!
//! - [`MemoryConnector`]: in-process relay, for tests and the demo
//! - [`TcpConnector`]: length-prefixed JSON frames over TCP
//!
//! Inbound envelopes arrive on an `mpsc` receiver handed out by
//! [`Transport::new`]; connection status is published on a `watch` channel.
//! When a link drops the transport reconnects on its own with the stored
//! credential. Sessions are never renegotiated by a reconnect.

mod backoff;
mod memory;
mod tcp;

pub use backoff::Backoff;
pub use memory::{MemoryConnector, MemoryRelay, DEFAULT_MAILBOX_CAPACITY};
pub use tcp::{read_frame, serve, write_frame, Frame, TcpConnector, MAX_FRAME_SIZE};

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::address::PeerAddress;
use crate::config::TransportConfig;
use crate::envelope::EncryptedEnvelope;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// No live link; nothing was queued
    #[error("not connected")]
    NotConnected,

    /// Every connection attempt failed
    #[error("connection attempts exhausted after {attempts} tries")]
    ConnectionExhausted { attempts: u32 },

    /// A single connection attempt failed
    #[error("connection failed: {0}")]
    Connection(String),

    /// The relay refused the credential; retrying will not help
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Peer spoke something other than the frame protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting { attempt: u32 },
    Connected,
    /// Retries ran out; only an explicit `connect` starts over
    Exhausted,
}

/// Who is connecting, and the token proving it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub user_id: String,
    pub device_id: u32,
    pub token: String,
}

impl Credential {
    pub fn new(user_id: impl Into<String>, device_id: u32, token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
            token: token.into(),
        }
    }

    pub fn address(&self) -> PeerAddress {
        PeerAddress::new(self.user_id.clone(), self.device_id)
    }
}

/// An envelope addressed to a peer device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundFrame {
    pub recipient: PeerAddress,
    pub envelope: EncryptedEnvelope,
}

/// Channels of one established link
///
/// The link is considered dropped when `inbound` yields `None`.
pub struct Link {
    pub outbound: mpsc::Sender<OutboundFrame>,
    pub inbound: mpsc::Receiver<EncryptedEnvelope>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Make one connection attempt
    async fn connect(&self, credential: &Credential, capacity: usize) -> Result<Link, TransportError>;
}

struct Inner {
    connector: Arc<dyn Connector>,
    config: TransportConfig,
    status: watch::Sender<ConnectionStatus>,
    inbound: mpsc::Sender<EncryptedEnvelope>,
    outbound: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn teardown(&self) {
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        lock(&self.outbound).take();
    }
}

/// Leaves the status `Disconnected` if a connect is dropped mid-retry
struct ConnectGuard<'a> {
    inner: &'a Inner,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.set_status(ConnectionStatus::Disconnected);
        }
    }
}

/// Run the retry loop until a link is up or attempts run out
async fn establish(inner: &Inner, credential: &Credential) -> Result<Link, TransportError> {
    let backoff = Backoff::from_config(&inner.config);
    let max_attempts = inner.config.max_attempts.max(1);
    let mut guard = ConnectGuard { inner, armed: true };

    for attempt in 1..=max_attempts {
        inner.set_status(ConnectionStatus::Connecting { attempt });

        match inner
            .connector
            .connect(credential, inner.config.channel_capacity)
            .await
        {
            Ok(link) => {
                guard.armed = false;
                return Ok(link);
            }
            Err(TransportError::AuthRejected(reason)) => {
                tracing::warn!(user = %credential.user_id, %reason, "Relay rejected credential");
                return Err(TransportError::AuthRejected(reason));
            }
            Err(e) => {
                tracing::warn!(attempt, max_attempts, error = %e, "Connection attempt failed");
                if attempt < max_attempts {
                    backoff.sleep(attempt).await;
                }
            }
        }
    }

    guard.armed = false;
    inner.set_status(ConnectionStatus::Exhausted);
    tracing::error!(attempts = max_attempts, "Giving up on connection");
    Err(TransportError::ConnectionExhausted {
        attempts: max_attempts,
    })
}

/// Forward inbound envelopes, reconnecting whenever the link drops
async fn pump(inner: Arc<Inner>, mut inbound: mpsc::Receiver<EncryptedEnvelope>, credential: Credential) {
    loop {
        while let Some(envelope) = inbound.recv().await {
            if inner.inbound.send(envelope).await.is_err() {
                // Application dropped its receiver
                return;
            }
        }

        lock(&inner.outbound).take();
        inner.set_status(ConnectionStatus::Disconnected);
        tracing::warn!(user = %credential.user_id, "Link dropped");

        if !inner.config.auto_reconnect {
            return;
        }

        match establish(&inner, &credential).await {
            Ok(link) => {
                *lock(&inner.outbound) = Some(link.outbound);
                inbound = link.inbound;
                inner.set_status(ConnectionStatus::Connected);
                tracing::info!(user = %credential.user_id, "Reconnected");
            }
            Err(e) => {
                tracing::error!(error = %e, "Reconnection failed");
                return;
            }
        }
    }
}

/// Persistent envelope transport
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Create a disconnected transport and the receiver inbound envelopes arrive on
    pub fn new(connector: Arc<dyn Connector>, config: TransportConfig) -> (Self, mpsc::Receiver<EncryptedEnvelope>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.channel_capacity.max(1));
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);

        let inner = Arc::new(Inner {
            connector,
            config,
            status,
            inbound: inbound_tx,
            outbound: Mutex::new(None),
            pump: Mutex::new(None),
        });
        (Self { inner }, inbound_rx)
    }

    /// Connect, retrying with backoff
    ///
    /// Dropping the returned future stops the retry loop and leaves the
    /// transport `Disconnected` with no link installed.
    pub async fn connect(&self, credential: Credential) -> Result<(), TransportError> {
        self.inner.teardown();

        let link = establish(&self.inner, &credential).await?;

        *lock(&self.inner.outbound) = Some(link.outbound);
        self.inner.set_status(ConnectionStatus::Connected);
        tracing::info!(user = %credential.user_id, device = credential.device_id, "Connected");

        let handle = tokio::spawn(pump(Arc::clone(&self.inner), link.inbound, credential));
        *lock(&self.inner.pump) = Some(handle);
        Ok(())
    }

    /// Hand an envelope to the relay
    ///
    /// Fails `NotConnected` right away when there is no live link.
    pub async fn send(&self, recipient: &PeerAddress, envelope: EncryptedEnvelope) -> Result<(), TransportError> {
        let sender = lock(&self.inner.outbound)
            .clone()
            .ok_or(TransportError::NotConnected)?;

        sender
            .send(OutboundFrame {
                recipient: recipient.clone(),
                envelope,
            })
            .await
            .map_err(|_| TransportError::NotConnected)
    }

    pub fn disconnect(&self) {
        self.inner.teardown();
        self.inner.set_status(ConnectionStatus::Disconnected);
        tracing::info!("Disconnected");
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected && lock(&self.inner.outbound).is_some()
    }

    /// Watch connection status changes
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.inner.teardown();
    }
}

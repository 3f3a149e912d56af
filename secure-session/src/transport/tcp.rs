//! TCP relay link
//!
//! Frames are a big-endian `u32` length followed by that many bytes of JSON.
//! A connection opens with `hello` from the client and `welcome` or
//! `rejected` from the relay; after that the client writes `send` frames and
//! the relay writes `deliver` frames.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::memory::MemoryRelay;
use super::{Connector, Credential, Link, OutboundFrame, TransportError};
use crate::address::PeerAddress;
use crate::envelope::EncryptedEnvelope;

/// Largest frame either side will read or write
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Frame {
    Hello {
        user_id: String,
        device_id: u32,
        token: String,
    },
    Welcome,
    Rejected {
        reason: String,
    },
    Send {
        recipient: PeerAddress,
        envelope: EncryptedEnvelope,
    },
    Deliver {
        envelope: EncryptedEnvelope,
    },
}

/// Read one frame; `None` on a clean end of stream
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let length = match reader.read_u32().await {
        Ok(length) => length as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if length > MAX_FRAME_SIZE {
        return Err(TransportError::Protocol(format!(
            "frame of {length} bytes exceeds {MAX_FRAME_SIZE}"
        )));
    }

    let mut buf = vec![0u8; length];
    reader.read_exact(&mut buf).await?;

    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| TransportError::Protocol(format!("invalid frame: {e}")))
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame).map_err(|e| TransportError::Protocol(format!("encode failed: {e}")))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::Protocol(format!(
            "frame of {} bytes exceeds {MAX_FRAME_SIZE}",
            payload.len()
        )));
    }

    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Connects to a relay started with [`serve`]
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, credential: &Credential, capacity: usize) -> Result<Link, TransportError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connection(format!("connect to {} failed: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        let hello = Frame::Hello {
            user_id: credential.user_id.clone(),
            device_id: credential.device_id,
            token: credential.token.clone(),
        };
        write_frame(&mut writer, &hello).await?;

        let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| TransportError::Connection("handshake timed out".to_string()))??;
        match reply {
            Some(Frame::Welcome) => {}
            Some(Frame::Rejected { reason }) => return Err(TransportError::AuthRejected(reason)),
            Some(other) => {
                return Err(TransportError::Protocol(format!("unexpected handshake reply: {other:?}")));
            }
            None => return Err(TransportError::Connection("relay closed during handshake".to_string())),
        }

        let (out_tx, out_rx) = mpsc::channel(capacity.max(1));
        let (in_tx, in_rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(client_reader(reader, in_tx));
        tokio::spawn(client_writer(writer, out_rx));

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

async fn client_reader(mut reader: OwnedReadHalf, inbound: mpsc::Sender<EncryptedEnvelope>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Deliver { envelope })) => {
                if inbound.send(envelope).await.is_err() {
                    return;
                }
            }
            Ok(Some(other)) => {
                tracing::warn!(frame = ?other, "Unexpected frame from relay");
                return;
            }
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Relay read failed");
                return;
            }
        }
    }
}

async fn client_writer(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<OutboundFrame>) {
    while let Some(OutboundFrame { recipient, envelope }) = outbound.recv().await {
        if let Err(e) = write_frame(&mut writer, &Frame::Send { recipient, envelope }).await {
            tracing::warn!(error = %e, "Relay write failed");
            return;
        }
    }
}

/// Accept TCP clients and attach each one to `relay`
///
/// Runs until accepting fails.
pub async fn serve(listener: TcpListener, relay: MemoryRelay) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let relay = relay.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, relay).await {
                tracing::debug!(%peer, error = %e, "Relay client closed with error");
            }
        });
    }
}

async fn handle_client(stream: TcpStream, relay: MemoryRelay) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_frame(&mut reader))
        .await
        .map_err(|_| TransportError::Connection("handshake timed out".to_string()))??;
    let credential = match hello {
        Some(Frame::Hello {
            user_id,
            device_id,
            token,
        }) => Credential::new(user_id, device_id, token),
        Some(other) => return Err(TransportError::Protocol(format!("expected hello, got {other:?}"))),
        None => return Ok(()),
    };

    let link = match relay.attach(&credential, SERVER_CHANNEL_CAPACITY) {
        Ok(link) => link,
        Err(e) => {
            write_frame(&mut writer, &Frame::Rejected { reason: e.to_string() }).await?;
            return Ok(());
        }
    };
    write_frame(&mut writer, &Frame::Welcome).await?;
    tracing::info!(peer = %credential.address(), "Relay client connected");

    let Link { outbound, mut inbound } = link;
    let delivery = tokio::spawn(async move {
        while let Some(envelope) = inbound.recv().await {
            if write_frame(&mut writer, &Frame::Deliver { envelope }).await.is_err() {
                return;
            }
        }
    });

    let result = loop {
        match read_frame(&mut reader).await {
            Ok(Some(Frame::Send { recipient, envelope })) => {
                if outbound.send(OutboundFrame { recipient, envelope }).await.is_err() {
                    break Ok(());
                }
            }
            Ok(Some(other)) => break Err(TransportError::Protocol(format!("unexpected frame: {other:?}"))),
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    // Closing the outbound side detaches the device from the relay
    drop(outbound);
    delivery.abort();
    tracing::info!(peer = %credential.address(), "Relay client disconnected");
    result
}

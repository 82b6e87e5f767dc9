//! Connection port.
//!
//! The physical stream (handshake, framing, stanza parsing) lives outside
//! this crate. The correlation layer only needs to send packets and to know
//! the local identity used to stamp them.

use crate::packet::Packet;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Connection errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    /// The outbound queue has no room right now.
    #[error("outbound queue full")]
    Full,
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Outbound side of the shared stanza stream.
///
/// Implementations serialize concurrent sends at the transport boundary.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Queue a packet for transmission.
    async fn send(&self, packet: Packet) -> Result<(), ConnectionError>;

    /// Queue a packet only if that can happen without waiting.
    ///
    /// For callers on the delivery path, which must never wait for
    /// outbound capacity.
    fn try_send(&self, packet: Packet) -> Result<(), ConnectionError>;

    /// Local endpoint address stamped on outbound packets.
    fn identity(&self) -> &str;
}

/// In-memory connection backed by a tokio `mpsc` channel.
///
/// Whatever holds the receiver plays the remote server.
pub struct ChannelConnection {
    identity: String,
    outbound: mpsc::Sender<Packet>,
}

impl ChannelConnection {
    pub fn new(identity: impl Into<String>, outbound: mpsc::Sender<Packet>) -> Self {
        Self {
            identity: identity.into(),
            outbound,
        }
    }

    /// Create a connection and the receiver of everything it sends.
    pub fn pair(identity: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(identity, tx), rx)
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| ConnectionError::Closed)
    }

    fn try_send(&self, packet: Packet) -> Result<(), ConnectionError> {
        self.outbound.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::Full,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }

    fn identity(&self) -> &str {
        &self.identity
    }
}

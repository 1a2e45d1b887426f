//! Transport abstraction for peer connections.
//!
//! The engine talks to peers over a pluggable byte transport. The production
//! implementation is TCP under an externally-established TLS session; the
//! transport reports the certificate digest that session authenticated so
//! the peer actor can match it against the expected device id. The mock
//! keeps protocol tests free of sockets.

mod mock;
mod tcp;

pub use mock::MockTransport;
pub use tcp::TcpTransport;

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Deadline exceeded.
    #[error("connection timeout")]
    Timeout,
}

/// A connected, bidirectional byte stream to one peer.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send bytes; the transport preserves ordering.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next chunk of bytes. Chunk boundaries carry no meaning;
    /// the frame decoder reassembles messages.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// SHA-256 of the peer certificate the outer session authenticated, when
    /// the transport knows it.
    fn peer_digest(&self) -> Option<[u8; 32]>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

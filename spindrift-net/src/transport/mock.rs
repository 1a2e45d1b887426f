//! In-memory transport for testing.
//!
//! [`MockTransport::pair`] wires two endpoints back to back so a peer actor
//! can be exercised against a scripted counterpart without sockets.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{Transport, TransportError};

/// One endpoint of an in-memory connection.
#[derive(Debug)]
pub struct MockTransport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    digest: Option<[u8; 32]>,
}

impl MockTransport {
    /// Two connected endpoints; bytes sent on one arrive on the other.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
                digest: None,
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
                digest: None,
            },
        )
    }

    /// Set the certificate digest this endpoint reports for its peer.
    pub fn with_peer_digest(mut self, digest: [u8; 32]) -> Self {
        self.digest = Some(digest);
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.tx
            .send(data.to_vec())
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        // the actor is the only reader; the mutex makes `&self` receivable
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    fn peer_digest(&self) -> Option<[u8; 32]> {
        self.digest
    }

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

//! TCP transport.
//!
//! The TLS layer that authenticates the peer certificate is an external
//! collaborator; whoever establishes the session hands the authenticated
//! digest to [`TcpTransport::with_peer_digest`] so the BEP handshake can
//! verify it against the expected device id.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{Transport, TransportError};

const READ_CHUNK: usize = 64 * 1024;

/// A connected TCP transport.
pub struct TcpTransport {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    digest: Option<[u8; 32]>,
}

impl TcpTransport {
    /// Connect to `address` within `timeout`.
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self, TransportError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an accepted stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            digest: None,
        }
    }

    /// Attach the certificate digest the TLS layer authenticated.
    pub fn with_peer_digest(mut self, digest: [u8; 32]) -> Self {
        self.digest = Some(digest);
        self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut reader = self.reader.lock().await;
        let mut buf = vec![0u8; READ_CHUNK];
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed);
        }
        buf.truncate(n);
        Ok(buf)
    }

    fn peer_digest(&self) -> Option<[u8; 32]> {
        self.digest
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_send_recv_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport = TcpTransport::from_stream(stream);
            let data = transport.recv().await.unwrap();
            transport.send(&data).await.unwrap();
        });

        let client = TcpTransport::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        client.send(b"echo").await.unwrap();
        assert_eq!(client.recv().await.unwrap(), b"echo");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn closed_peer_surfaces_as_connection_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = TcpTransport::connect(&addr.to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        server.await.unwrap();
        assert!(matches!(
            client.recv().await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}

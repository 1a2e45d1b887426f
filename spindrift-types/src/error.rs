//! Error taxonomy for spindrift.
//!
//! Every failure in the engine maps to one [`ErrorKind`]; the concrete
//! [`SyncError`] variants carry a string context and, where available, the
//! underlying source error so front-ends can render the full chain.

use std::fmt;
use thiserror::Error;

/// The closed set of failure kinds the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The peer violated the BEP state machine or framing rules.
    ProtocolViolation,
    /// The peer's certificate digest does not match the expected device id.
    AuthFailure,
    /// A frame or record failed to decode.
    Decode,
    /// The key-value store failed; fatal for the cluster.
    Db,
    /// A local filesystem operation failed.
    Io,
    /// No transport is available to reach the peer.
    TransportNotAvailable,
    /// A message referenced a folder this device does not know.
    UnknownFolder,
    /// Received block data did not hash to the advertised digest.
    DigestMismatch,
    /// An on-disk or on-wire version is not one this build understands.
    VersionMismatch,
    /// The operation was cancelled by shutdown; not reported as an error.
    Cancelled,
    /// An outbound network operation exceeded its deadline.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ProtocolViolation => "protocol-violation",
            Self::AuthFailure => "auth-failure",
            Self::Decode => "decode-error",
            Self::Db => "db-error",
            Self::Io => "io-error",
            Self::TransportNotAvailable => "transport-not-available",
            Self::UnknownFolder => "unknown-folder",
            Self::DigestMismatch => "digest-mismatch",
            Self::VersionMismatch => "version-mismatch",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Engine-wide error type.
#[derive(Debug, Error)]
pub enum SyncError {
    /// BEP state machine or framing violation.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Peer identity did not match expectations.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Failed to decode a frame, message or stored record.
    #[error("decode error: {0}")]
    Decode(String),

    /// Key-value store failure.
    #[error("database error: {0}")]
    Db(String),

    /// Local I/O failure with its operating-system cause.
    #[error("i/o error: {context}")]
    Io {
        /// What the engine was doing when the error occurred.
        context: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// No usable transport for the peer.
    #[error("transport is not available")]
    TransportNotAvailable,

    /// A message referenced a folder unknown to this device.
    #[error("unknown folder '{0}'")]
    UnknownFolder(String),

    /// Block content did not match its advertised SHA-256.
    #[error("digest mismatch: {0}")]
    DigestMismatch(String),

    /// Database schema or protocol version from the future.
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch {
        /// The version this build supports.
        expected: u32,
        /// The version that was found.
        got: u32,
    },

    /// Cancelled by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// Deadline exceeded.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl SyncError {
    /// Classify this error into the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::ProtocolViolation,
            Self::Auth(_) => ErrorKind::AuthFailure,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Db(_) => ErrorKind::Db,
            Self::Io { .. } => ErrorKind::Io,
            Self::TransportNotAvailable => ErrorKind::TransportNotAvailable,
            Self::UnknownFolder(_) => ErrorKind::UnknownFolder,
            Self::DigestMismatch(_) => ErrorKind::DigestMismatch,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether this error must taint the cluster and force shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Db)
    }

    /// Wrap an OS error with a context string.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<prost::DecodeError> for SyncError {
    fn from(e: prost::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn kinds_render_as_codes() {
        assert_eq!(ErrorKind::DigestMismatch.to_string(), "digest-mismatch");
        assert_eq!(ErrorKind::AuthFailure.to_string(), "auth-failure");
    }

    #[test]
    fn io_errors_chain_their_source() {
        let err = SyncError::io(
            "writing q.txt",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert_eq!(err.to_string(), "i/o error: writing q.txt");
        assert_eq!(err.source().unwrap().to_string(), "disk full");
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn only_db_errors_are_fatal() {
        assert!(SyncError::Db("bad page".into()).is_fatal());
        assert!(!SyncError::Cancelled.is_fatal());
        assert!(!SyncError::Protocol("bad frame".into()).is_fatal());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SyncError>();
    }
}

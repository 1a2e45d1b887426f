//! # spindrift-types
//!
//! Protocol and storage types shared across the spindrift crates:
//! - [`DeviceId`] - the base32/Luhn textual identity derived from a peer certificate
//! - [`bep`] - Block Exchange Protocol wire messages (protobuf)
//! - [`records`] - persisted entity records (protobuf)
//! - [`wire`] - frame envelope, hello magic, optional LZ4 message compression
//! - [`SyncError`] / [`ErrorKind`] - the error taxonomy every layer maps into

#![warn(clippy::all)]

pub mod bep;
pub mod block;
mod device_id;
mod error;
pub mod records;
pub mod wire;

pub use device_id::{DeviceId, DeviceIdError, ShortId};
pub use error::{ErrorKind, SyncError};

/// Suffix appended to files while their blocks are still being pulled.
pub const TEMP_SUFFIX: &str = ".spindrift-tmp";

/// Client name announced in the BEP Hello message.
pub const CLIENT_NAME: &str = "spindrift";

/// Client version announced in the BEP Hello message.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

//! # spindrift-model
//!
//! The in-memory cluster model and its diff layer. Every mutation of the
//! model is expressed as an immutable [`diff::ClusterDiff`] or
//! [`diff::BlockDiff`], applied at a single point ([`Cluster::apply`] /
//! [`Cluster::apply_block`]) and then fanned out to observers through the
//! visitor traits. This crate is pure logic: no I/O, no async.

#![warn(clippy::all)]

mod block_info;
mod cluster;
mod device;
pub mod diff;
mod file_info;
mod folder;
mod folder_info;
pub mod iterator;
mod version;

pub use block_info::{BlockHash, BlockInfo, FileBlock, FileKey};
pub use cluster::{Cluster, UnknownFolder};

/// The cluster as shared between actors. Locked only for short, non-awaiting
/// critical sections on the primary strand.
pub type SharedCluster = std::sync::Arc<std::sync::Mutex<Cluster>>;
pub use device::Device;
pub use file_info::{FileInfo, FileKind};
pub use folder::Folder;
pub use folder_info::FolderInfo;
pub use version::{Dominance, Version};

/// Generate a non-zero random 64-bit index id.
pub fn random_index_id() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes) | 1
}

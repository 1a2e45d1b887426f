//! # spindrift-fs
//!
//! The local-filesystem side of the engine: the file actor applying block
//! diffs through an LRU of memory-mapped files, the scanner reconciling
//! on-disk state with the model, and the hasher pool both of them lean on.

#![warn(clippy::all)]

mod file_actor;
mod hasher;
mod mmap;
mod scan_actor;
mod scan_task;

pub use file_actor::{FileActor, FsEvent, FsHandle, FsRequest, ImmediateOp, ReadOutcome};
pub use hasher::{sha256, BlockDigest, HasherPool};
pub use mmap::{FileCache, MappedFile};
pub use scan_actor::{ScanActor, ScanCommand, ScanHandle};
pub use scan_task::{ScanError, ScanOutcome, ScanTask};

//! Pull iteration: which file next, and which block of that file.
//!
//! Both iterators are passive; the controller drives them against the shared
//! cluster and turns the yielded actions into clone diffs or peer requests.

use std::collections::HashSet;

use spindrift_types::records::PullOrder;
use spindrift_types::DeviceId;

use crate::block_info::BlockHash;
use crate::cluster::Cluster;
use crate::file_info::{FileInfo, FileKind};
use crate::version::Dominance;

/// A file selected for synchronization from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullFile {
    /// The folder.
    pub folder_id: String,
    /// Folder-relative name.
    pub name: String,
}

/// What pulling a file amounts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullClass {
    /// Remove the local path; no network I/O.
    Delete,
    /// Create an empty file; no network I/O.
    CreateEmpty,
    /// Create a directory; no network I/O.
    CreateDir,
    /// Create a symlink to `target`; no network I/O.
    CreateSymlink {
        /// Symlink target string.
        target: String,
    },
    /// Transfer blocks.
    Blocks,
}

/// Classify a file entry into its pull action.
pub fn classify(file: &FileInfo) -> PullClass {
    if file.deleted {
        PullClass::Delete
    } else {
        match file.kind {
            FileKind::Directory => PullClass::CreateDir,
            FileKind::Symlink => PullClass::CreateSymlink {
                target: file.symlink_target.clone(),
            },
            FileKind::File if file.size == 0 => PullClass::CreateEmpty,
            FileKind::File => PullClass::Blocks,
        }
    }
}

/// Walks a peer's folder-infos selecting files that are newer than or
/// incomparable to the local version, skipping files already visited in this
/// pass and folders not shared in a pull-capable mode.
#[derive(Debug)]
pub struct FileIterator {
    peer: DeviceId,
    visited: HashSet<(String, String)>,
}

impl FileIterator {
    /// An iterator over files offered by `peer`.
    pub fn new(peer: DeviceId) -> Self {
        Self {
            peer,
            visited: HashSet::new(),
        }
    }

    /// Forget visited files; called when the peer's index changes.
    pub fn reset(&mut self) {
        self.visited.clear();
    }

    /// The peer this iterator follows.
    pub fn peer(&self) -> DeviceId {
        self.peer
    }

    fn wanted(cluster: &Cluster, folder_id: &str, remote: &FileInfo) -> bool {
        if remote.invalid {
            return false;
        }
        match cluster.file(folder_id, &cluster.local_id(), &remote.name) {
            None => !remote.deleted,
            Some(local) => match remote.version.compare(&local.version) {
                Dominance::Greater | Dominance::Concurrent => {
                    if remote.deleted && local.deleted {
                        return false;
                    }
                    // a newer history over byte-identical content (the other
                    // side finished pulling what we already hold) has
                    // nothing to transfer
                    !Self::content_present(remote, local)
                }
                // same version locally, but the pull never finished: resume
                Dominance::Equal => local.is_incomplete() && !local.deleted,
                Dominance::Lesser => false,
            },
        }
    }

    /// The remote entry's content is already fully present at the local
    /// location: same kind, size, block list and link target, no deletion on
    /// either side, every block on disk.
    fn content_present(remote: &FileInfo, local: &FileInfo) -> bool {
        !remote.deleted
            && !local.deleted
            && remote.kind == local.kind
            && remote.size == local.size
            && remote.blocks == local.blocks
            && remote.symlink_target == local.symlink_target
            && local.is_complete()
    }

    /// The next file to pull, in the folder's configured order.
    pub fn next(&mut self, cluster: &Cluster) -> Option<PullFile> {
        for folder in cluster.folders_shared_with(&self.peer) {
            if !folder.pull_capable() {
                continue;
            }
            let Some(info) = cluster.folder_info(&folder.id, &self.peer) else {
                continue;
            };
            let mut candidates: Vec<&FileInfo> = info
                .files()
                .filter(|f| !self.visited.contains(&(folder.id.clone(), f.name.clone())))
                .filter(|f| Self::wanted(cluster, &folder.id, f))
                .collect();
            if candidates.is_empty() {
                continue;
            }
            match folder.pull_order {
                PullOrder::SmallestFirst => candidates.sort_by_key(|f| (f.size, f.name.clone())),
                PullOrder::LargestFirst => {
                    candidates.sort_by_key(|f| (std::cmp::Reverse(f.size), f.name.clone()))
                }
                PullOrder::OldestFirst => {
                    candidates.sort_by_key(|f| (f.modified_s, f.name.clone()))
                }
                PullOrder::NewestFirst => {
                    candidates.sort_by_key(|f| (std::cmp::Reverse(f.modified_s), f.name.clone()))
                }
                PullOrder::Random | PullOrder::Alphabetic => {
                    candidates.sort_by(|a, b| a.name.cmp(&b.name))
                }
            }
            let chosen = candidates[0];
            let target = PullFile {
                folder_id: folder.id.clone(),
                name: chosen.name.clone(),
            };
            self.visited
                .insert((target.folder_id.clone(), target.name.clone()));
            return Some(target);
        }
        None
    }
}

/// What to do about one block of a file being pulled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockAction {
    /// Already present at the target location.
    Skip,
    /// Copy from an existing local file; no network I/O.
    Clone {
        /// Folder containing the source copy.
        source_folder_id: String,
        /// Source file name.
        source_name: String,
        /// Block index within the source file.
        source_index: u32,
    },
    /// Request from the peer.
    Request,
}

/// One block decision from the [`BlockIterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPull {
    /// Block index within the target file.
    pub index: u32,
    /// Byte offset within the target file.
    pub offset: u64,
    /// Block length in bytes.
    pub size: u32,
    /// Expected content hash.
    pub hash: BlockHash,
    /// How to obtain the bytes.
    pub action: BlockAction,
}

/// Walks the local (cloned) file entry's block list in offset order.
#[derive(Debug)]
pub struct BlockIterator {
    folder_id: String,
    name: String,
    next_index: u32,
    total: u32,
}

impl BlockIterator {
    /// Iterate the blocks of the local entry for (`folder_id`, `name`).
    /// Returns `None` when no such entry exists.
    pub fn new(cluster: &Cluster, folder_id: &str, name: &str) -> Option<Self> {
        let file = cluster.file(folder_id, &cluster.local_id(), name)?;
        Some(Self {
            folder_id: folder_id.to_string(),
            name: name.to_string(),
            next_index: 0,
            total: file.blocks.len() as u32,
        })
    }

    /// True when every block decision has been yielded.
    pub fn exhausted(&self) -> bool {
        self.next_index >= self.total
    }

    /// The next block decision, strictly in offset order.
    pub fn next(&mut self, cluster: &Cluster) -> Option<BlockPull> {
        let file = cluster.file(&self.folder_id, &cluster.local_id(), &self.name)?;
        while self.next_index < self.total {
            let index = self.next_index;
            self.next_index += 1;
            let hash = *file.blocks.get(index as usize)?;
            let size = file.block_len(index);
            let offset = file.block_offset(index);
            if file.is_local(index) {
                return Some(BlockPull {
                    index,
                    offset,
                    size,
                    hash,
                    action: BlockAction::Skip,
                });
            }
            let action = match cluster.block(&hash).and_then(|b| b.local_source()) {
                Some(source)
                    if !(source.file.name == self.name
                        && source.file.folder_id == self.folder_id
                        && source.index == index) =>
                {
                    BlockAction::Clone {
                        source_folder_id: source.file.folder_id.clone(),
                        source_name: source.file.name.clone(),
                        source_index: source.index,
                    }
                }
                _ => BlockAction::Request,
            };
            return Some(BlockPull {
                index,
                offset,
                size,
                hash,
                action,
            });
        }
        None
    }
}

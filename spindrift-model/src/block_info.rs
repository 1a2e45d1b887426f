//! Content-addressed blocks and their file back-links.

use spindrift_types::records::BlockRecord;
use spindrift_types::DeviceId;

/// SHA-256 of a block's content.
pub type BlockHash = [u8; 32];

/// Identifies a file entry: (folder, device, name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileKey {
    /// Folder id.
    pub folder_id: String,
    /// Owning device.
    pub device_id: DeviceId,
    /// Folder-relative name.
    pub name: String,
}

/// One reference from a file to a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    /// The referencing file.
    pub file: FileKey,
    /// Index of the block within that file.
    pub index: u32,
    /// Whether the bytes are present in local storage at this location.
    pub local: bool,
}

/// A content-addressed block, alive while at least one file references it.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    /// Content hash.
    pub hash: BlockHash,
    /// Length in bytes.
    pub size: u32,
    /// Optional Adler-style rolling hash; zero when unknown.
    pub weak_hash: u32,
    links: Vec<FileBlock>,
}

impl BlockInfo {
    /// A block with no references yet.
    pub fn new(hash: BlockHash, size: u32, weak_hash: u32) -> Self {
        Self {
            hash,
            size,
            weak_hash,
            links: Vec::new(),
        }
    }

    /// Rebuild from a stored record; the hash comes from the key.
    pub fn from_record(hash: BlockHash, record: BlockRecord) -> Self {
        Self::new(hash, record.size, record.weak_hash)
    }

    /// Serialize the stored attributes.
    pub fn to_record(&self) -> BlockRecord {
        BlockRecord {
            size: self.size,
            weak_hash: self.weak_hash,
        }
    }

    /// Add a reference from `file` at `index`.
    pub fn link(&mut self, file: FileKey, index: u32, local: bool) {
        self.links.push(FileBlock { file, index, local });
    }

    /// Drop every reference from `file`, returning the removed indexes.
    pub fn unlink(&mut self, file: &FileKey) -> Vec<u32> {
        let mut removed = Vec::new();
        self.links.retain(|l| {
            if &l.file == file {
                removed.push(l.index);
                false
            } else {
                true
            }
        });
        removed
    }

    /// Record that the copy at (`file`, `index`) is now in local storage.
    pub fn mark_local(&mut self, file: &FileKey, index: u32) {
        for l in &mut self.links {
            if &l.file == file && l.index == index {
                l.local = true;
            }
        }
    }

    /// Some locally available copy of this block, if any.
    pub fn local_source(&self) -> Option<&FileBlock> {
        self.links.iter().find(|l| l.local)
    }

    /// Number of referencing file-blocks.
    pub fn ref_count(&self) -> usize {
        self.links.len()
    }

    /// All references.
    pub fn links(&self) -> &[FileBlock] {
        &self.links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> FileKey {
        FileKey {
            folder_id: "f".into(),
            device_id: DeviceId::from_sha256([1; 32]),
            name: name.into(),
        }
    }

    #[test]
    fn link_unlink_tracks_refcount() {
        let mut block = BlockInfo::new([9; 32], 5, 0);
        block.link(key("a"), 0, false);
        block.link(key("a"), 3, false);
        block.link(key("b"), 1, false);
        assert_eq!(block.ref_count(), 3);
        let removed = block.unlink(&key("a"));
        assert_eq!(removed, vec![0, 3]);
        assert_eq!(block.ref_count(), 1);
    }

    #[test]
    fn local_source_prefers_available_copies() {
        let mut block = BlockInfo::new([9; 32], 5, 0);
        block.link(key("a"), 0, false);
        assert!(block.local_source().is_none());
        block.mark_local(&key("a"), 0);
        let source = block.local_source().unwrap();
        assert_eq!(source.file.name, "a");
        assert_eq!(source.index, 0);
    }

    #[test]
    fn record_roundtrip() {
        let block = BlockInfo::new([2; 32], 1024, 77);
        let restored = BlockInfo::from_record([2; 32], block.to_record());
        assert_eq!(restored.size, 1024);
        assert_eq!(restored.weak_hash, 77);
        assert_eq!(restored.ref_count(), 0);
    }
}

//! A versioned file entry inside a folder-info.

use spindrift_types::bep::{self, FileInfoType};
use spindrift_types::records::FileInfoRecord;
use spindrift_types::{SyncError, TEMP_SUFFIX};

use crate::block_info::BlockHash;
use crate::version::Version;

/// Kind of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileKind {
    fn from_wire(t: i32) -> Self {
        match FileInfoType::try_from(t) {
            Ok(FileInfoType::Directory) => Self::Directory,
            Ok(FileInfoType::Symlink)
            | Ok(FileInfoType::SymlinkFile)
            | Ok(FileInfoType::SymlinkDirectory) => Self::Symlink,
            _ => Self::File,
        }
    }

    fn to_wire(self) -> i32 {
        match self {
            Self::File => FileInfoType::File as i32,
            Self::Directory => FileInfoType::Directory as i32,
            Self::Symlink => FileInfoType::Symlink as i32,
        }
    }
}

/// A versioned file, directory or symlink entry.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    /// Folder-relative path.
    pub name: String,
    /// File, directory or symlink.
    pub kind: FileKind,
    /// Size in bytes; zero for directories and symlinks.
    pub size: u64,
    /// Block size used to chunk the file.
    pub block_size: u32,
    /// Modification time, seconds part.
    pub modified_s: i64,
    /// Modification time, nanoseconds part.
    pub modified_ns: i32,
    /// Unix permission bits.
    pub permissions: u32,
    /// Deletion tombstone.
    pub deleted: bool,
    /// Excluded from synchronization (conflict or scan failure).
    pub invalid: bool,
    /// Sequence within the owning folder-info; zero until assigned.
    pub sequence: u64,
    /// Vector clock of the edit history.
    pub version: Version,
    /// Symlink target, when kind is a symlink.
    pub symlink_target: String,
    /// Ordered content block hashes.
    pub blocks: Vec<BlockHash>,
    /// Which blocks are available in local storage.
    local: Vec<bool>,
    /// Storage key, zero until persisted.
    pub db_key: u64,
}

impl FileInfo {
    /// An empty entry with the given name and kind.
    pub fn new(name: impl Into<String>, kind: FileKind) -> Self {
        Self {
            name: name.into(),
            kind,
            size: 0,
            block_size: 0,
            modified_s: 0,
            modified_ns: 0,
            permissions: 0,
            deleted: false,
            invalid: false,
            sequence: 0,
            version: Version::new(),
            symlink_target: String::new(),
            blocks: Vec::new(),
            local: Vec::new(),
            db_key: 0,
        }
    }

    /// Byte offset of a block.
    pub fn block_offset(&self, index: u32) -> u64 {
        index as u64 * self.block_size as u64
    }

    /// Length of a block; the final block may be short.
    pub fn block_len(&self, index: u32) -> u32 {
        let offset = self.block_offset(index);
        (self.size - offset).min(self.block_size as u64) as u32
    }

    /// Whether block `index` is present in local storage.
    pub fn is_local(&self, index: u32) -> bool {
        self.local.get(index as usize).copied().unwrap_or(false)
    }

    /// Record that block `index` is now present in local storage.
    pub fn mark_local(&mut self, index: u32) {
        if let Some(slot) = self.local.get_mut(index as usize) {
            *slot = true;
        }
    }

    /// Mark every block as locally available.
    pub fn mark_all_local(&mut self) {
        self.local.iter_mut().for_each(|b| *b = true);
    }

    /// A file is complete when every block is locally available.
    pub fn is_complete(&self) -> bool {
        self.local.iter().all(|b| *b)
    }

    /// A file is incomplete while any block is missing locally.
    pub fn is_incomplete(&self) -> bool {
        !self.is_complete()
    }

    /// Replace the block list, resetting local availability.
    pub fn set_blocks(&mut self, blocks: Vec<BlockHash>) {
        self.local = vec![false; blocks.len()];
        self.blocks = blocks;
    }

    /// Snapshot of the local-availability flags.
    pub fn local_blocks(&self) -> &[bool] {
        &self.local
    }

    /// Name of the temporary file blocks are written into.
    pub fn temp_name(&self) -> String {
        format!("{}{}", self.name, TEMP_SUFFIX)
    }

    /// Build from a wire FileInfo; block hashes must be 32 bytes.
    pub fn from_wire(wire: &bep::FileInfo) -> Result<Self, SyncError> {
        let mut blocks = Vec::with_capacity(wire.blocks.len());
        for b in &wire.blocks {
            let hash: BlockHash = b.hash.as_slice().try_into().map_err(|_| {
                SyncError::Decode(format!(
                    "block hash of '{}' has length {}, expected 32",
                    wire.name,
                    b.hash.len()
                ))
            })?;
            blocks.push(hash);
        }
        let mut file = Self {
            name: wire.name.clone(),
            kind: FileKind::from_wire(wire.r#type),
            size: wire.size.max(0) as u64,
            block_size: wire.block_size.max(0) as u32,
            modified_s: wire.modified_s,
            modified_ns: wire.modified_ns,
            permissions: wire.permissions,
            deleted: wire.deleted,
            invalid: wire.invalid,
            sequence: wire.sequence.max(0) as u64,
            version: wire
                .version
                .as_ref()
                .map(Version::from_wire)
                .unwrap_or_default(),
            symlink_target: wire.symlink_target.clone(),
            blocks: Vec::new(),
            local: Vec::new(),
            db_key: 0,
        };
        file.set_blocks(blocks);
        Ok(file)
    }

    /// Convert to the wire representation. `weak_hash` supplies the optional
    /// rolling hash recorded for a block, zero when unknown.
    pub fn to_wire(&self, weak_hash: impl Fn(&BlockHash) -> u32) -> bep::FileInfo {
        bep::FileInfo {
            name: self.name.clone(),
            r#type: self.kind.to_wire(),
            size: self.size as i64,
            permissions: self.permissions,
            modified_s: self.modified_s,
            modified_ns: self.modified_ns,
            modified_by: 0,
            deleted: self.deleted,
            invalid: self.invalid,
            no_permissions: false,
            version: Some(self.version.to_wire()),
            sequence: self.sequence as i64,
            block_size: self.block_size as i32,
            blocks: self
                .blocks
                .iter()
                .enumerate()
                .map(|(i, hash)| bep::BlockInfo {
                    offset: self.block_offset(i as u32) as i64,
                    size: self.block_len(i as u32) as i32,
                    hash: hash.to_vec(),
                    weak_hash: weak_hash(hash),
                })
                .collect(),
            symlink_target: self.symlink_target.clone(),
        }
    }

    /// Build from a stored record.
    pub fn from_record(record: FileInfoRecord, db_key: u64) -> Result<Self, SyncError> {
        let mut blocks = Vec::with_capacity(record.blocks.len());
        for b in &record.blocks {
            let hash: BlockHash = b.as_slice().try_into().map_err(|_| {
                SyncError::Decode(format!("stored block hash has length {}", b.len()))
            })?;
            blocks.push(hash);
        }
        let mut local = record.local_blocks;
        local.resize(blocks.len(), false);
        Ok(Self {
            name: record.name,
            kind: FileKind::from_wire(record.r#type),
            size: record.size,
            block_size: record.block_size,
            modified_s: record.modified_s,
            modified_ns: record.modified_ns,
            permissions: record.permissions,
            deleted: record.deleted,
            invalid: record.invalid,
            sequence: record.sequence,
            version: record
                .version
                .as_ref()
                .map(Version::from_wire)
                .unwrap_or_default(),
            symlink_target: record.symlink_target,
            blocks,
            local,
            db_key,
        })
    }

    /// Serialize to a stored record under the owning folder-info's key.
    pub fn to_record(&self, folder_info_key: u64) -> FileInfoRecord {
        FileInfoRecord {
            folder_info: folder_info_key,
            name: self.name.clone(),
            r#type: self.kind.to_wire(),
            size: self.size,
            permissions: self.permissions,
            modified_s: self.modified_s,
            modified_ns: self.modified_ns,
            deleted: self.deleted,
            invalid: self.invalid,
            sequence: self.sequence,
            version: Some(self.version.to_wire()),
            symlink_target: self.symlink_target.clone(),
            block_size: self.block_size,
            blocks: self.blocks.iter().map(|h| h.to_vec()).collect(),
            local_blocks: self.local.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_block_file() -> FileInfo {
        let mut file = FileInfo::new("a.bin", FileKind::File);
        file.size = 130 * 1024;
        file.block_size = 128 * 1024;
        file.set_blocks(vec![[1; 32], [2; 32]]);
        file
    }

    #[test]
    fn completeness_tracks_local_blocks() {
        let mut file = two_block_file();
        assert!(file.is_incomplete());
        file.mark_local(0);
        assert!(file.is_incomplete());
        file.mark_local(1);
        assert!(file.is_complete());
    }

    #[test]
    fn zero_block_entries_are_complete() {
        let dir = FileInfo::new("d", FileKind::Directory);
        assert!(dir.is_complete());
    }

    #[test]
    fn final_block_is_short() {
        let file = two_block_file();
        assert_eq!(file.block_len(0), 128 * 1024);
        assert_eq!(file.block_len(1), 2 * 1024);
        assert_eq!(file.block_offset(1), 128 * 1024);
    }

    #[test]
    fn wire_roundtrip_preserves_blocks() {
        let mut file = two_block_file();
        file.version.update(42);
        file.sequence = 9;
        let wire = file.to_wire(|_| 7);
        assert_eq!(wire.blocks.len(), 2);
        assert_eq!(wire.blocks[1].size, 2 * 1024);
        assert_eq!(wire.blocks[1].weak_hash, 7);
        let restored = FileInfo::from_wire(&wire).unwrap();
        assert_eq!(restored.blocks, file.blocks);
        assert_eq!(restored.version, file.version);
        assert_eq!(restored.sequence, 9);
        // local availability never crosses the wire
        assert!(restored.is_incomplete());
    }

    #[test]
    fn bad_wire_hash_length_is_rejected() {
        let wire = bep::FileInfo {
            name: "x".into(),
            blocks: vec![bep::BlockInfo {
                hash: vec![1, 2, 3],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(
            FileInfo::from_wire(&wire),
            Err(SyncError::Decode(_))
        ));
    }

    #[test]
    fn record_roundtrip_keeps_local_flags() {
        let mut file = two_block_file();
        file.mark_local(1);
        file.sequence = 3;
        let restored = FileInfo::from_record(file.to_record(77), 5).unwrap();
        assert_eq!(restored.local_blocks(), &[false, true]);
        assert_eq!(restored.db_key, 5);
        assert_eq!(restored.sequence, 3);
    }

    #[test]
    fn temp_name_appends_suffix() {
        assert_eq!(two_block_file().temp_name(), "a.bin.spindrift-tmp");
    }
}

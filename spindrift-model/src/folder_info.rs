//! The per-(folder, device) record: index id, max sequence, and the device's
//! file set for the folder.

use std::collections::HashMap;

use spindrift_types::records::FolderInfoRecord;
use spindrift_types::DeviceId;

use crate::file_info::FileInfo;

/// One device's view of one folder.
#[derive(Debug, Clone, PartialEq)]
pub struct FolderInfo {
    /// Owning folder id.
    pub folder_id: String,
    /// Owning device.
    pub device_id: DeviceId,
    /// Random identifier of the device's index sequence for this folder. A
    /// change signals a reset and forces a full re-index.
    pub index_id: u64,
    /// Highest sequence observed or assigned for this (folder, device).
    pub max_sequence: u64,
    /// Storage key, zero until persisted.
    pub db_key: u64,
    files: HashMap<String, FileInfo>,
}

impl FolderInfo {
    /// A fresh folder-info with no files.
    pub fn new(folder_id: impl Into<String>, device_id: DeviceId, index_id: u64) -> Self {
        Self {
            folder_id: folder_id.into(),
            device_id,
            index_id,
            max_sequence: 0,
            db_key: 0,
            files: HashMap::new(),
        }
    }

    /// Rebuild from a stored record.
    pub fn from_record(record: &FolderInfoRecord, device_id: DeviceId, db_key: u64) -> Self {
        Self {
            folder_id: record.folder.clone(),
            device_id,
            index_id: record.index_id,
            max_sequence: record.max_sequence,
            db_key,
            files: HashMap::new(),
        }
    }

    /// Serialize the stored attributes.
    pub fn to_record(&self) -> FolderInfoRecord {
        FolderInfoRecord {
            index_id: self.index_id,
            max_sequence: self.max_sequence,
            folder: self.folder_id.clone(),
            device: self.device_id.as_bytes().to_vec(),
        }
    }

    /// Insert or replace a file entry, keeping `max_sequence` monotone.
    pub fn add(&mut self, file: FileInfo) {
        if file.sequence > self.max_sequence {
            self.max_sequence = file.sequence;
        }
        self.files.insert(file.name.clone(), file);
    }

    /// Remove a file entry by name.
    pub fn remove(&mut self, name: &str) -> Option<FileInfo> {
        self.files.remove(name)
    }

    /// Look up a file by folder-relative name.
    pub fn file(&self, name: &str) -> Option<&FileInfo> {
        self.files.get(name)
    }

    /// Mutable lookup by folder-relative name.
    pub fn file_mut(&mut self, name: &str) -> Option<&mut FileInfo> {
        self.files.get_mut(name)
    }

    /// Iterate all file entries.
    pub fn files(&self) -> impl Iterator<Item = &FileInfo> {
        self.files.values()
    }

    /// Number of file entries.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Allocate the next local sequence number.
    pub fn next_sequence(&mut self) -> u64 {
        self.max_sequence += 1;
        self.max_sequence
    }
}

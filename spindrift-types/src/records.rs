//! Persisted entity records.
//!
//! Values stored in the key-value environment, one message per entity kind.
//! Identity usually lives in the key (digest or folder id); folder-infos and
//! file-infos are keyed by store-allocated sequence numbers, so their records
//! carry back-references.

use crate::bep::Vector;

/// How a folder participates in synchronization.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FolderType {
    /// Pull from peers and push local changes.
    SendReceive = 0,
    /// Only announce local state; never pull.
    SendOnly = 1,
    /// Only pull; local modifications are not announced.
    ReceiveOnly = 2,
}

/// Order in which missing files are pulled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PullOrder {
    /// No particular order.
    Random = 0,
    /// Lexicographic by name.
    Alphabetic = 1,
    /// Smallest file first.
    SmallestFirst = 2,
    /// Largest file first.
    LargestFirst = 3,
    /// Oldest modification first.
    OldestFirst = 4,
    /// Newest modification first.
    NewestFirst = 5,
}

/// A known peer device. Keyed by its 32-byte certificate digest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeviceRecord {
    /// Human-readable name.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Pinned certificate common name, if any.
    #[prost(string, tag = "2")]
    pub cert_name: String,
    /// Compression preference (bep::Compression).
    #[prost(int32, tag = "3")]
    pub compression: i32,
    /// Device may introduce further devices.
    #[prost(bool, tag = "4")]
    pub introducer: bool,
    /// Accept folders this device offers without prompting.
    #[prost(bool, tag = "5")]
    pub auto_accept: bool,
    /// Synchronization with this device is paused.
    #[prost(bool, tag = "6")]
    pub paused: bool,
    /// Statically configured contact URLs.
    #[prost(string, repeated, tag = "7")]
    pub addresses: Vec<String>,
    /// Addresses observed at the last successful contact.
    #[prost(string, repeated, tag = "8")]
    pub last_seen: Vec<String>,
}

/// A synchronized folder. Keyed by its folder id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FolderRecord {
    /// Folder id, shared across devices.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Human-readable label.
    #[prost(string, tag = "2")]
    pub label: String,
    /// Local filesystem root.
    #[prost(string, tag = "3")]
    pub path: String,
    /// Send/receive mode.
    #[prost(enumeration = "FolderType", tag = "4")]
    pub folder_type: i32,
    /// Seconds between scheduled rescans.
    #[prost(uint32, tag = "5")]
    pub rescan_interval: u32,
    /// Pull scheduling order.
    #[prost(enumeration = "PullOrder", tag = "6")]
    pub pull_order: i32,
    /// Watch the folder for changes between rescans.
    #[prost(bool, tag = "7")]
    pub watched: bool,
    /// Do not synchronize permission bits.
    #[prost(bool, tag = "8")]
    pub ignore_permissions: bool,
}

/// The (folder, device) pair record. Keyed by a store-allocated sequence.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FolderInfoRecord {
    /// Random identifier of the device's index sequence for this folder.
    #[prost(uint64, tag = "1")]
    pub index_id: u64,
    /// Highest sequence observed for this (folder, device).
    #[prost(uint64, tag = "2")]
    pub max_sequence: u64,
    /// Owning folder id.
    #[prost(string, tag = "3")]
    pub folder: String,
    /// Owning device digest.
    #[prost(bytes = "vec", tag = "4")]
    pub device: Vec<u8>,
}

/// A versioned file entry. Keyed by a store-allocated sequence.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfoRecord {
    /// Key of the owning folder-info.
    #[prost(uint64, tag = "1")]
    pub folder_info: u64,
    /// Folder-relative path.
    #[prost(string, tag = "2")]
    pub name: String,
    /// File, directory or symlink (bep::FileInfoType).
    #[prost(int32, tag = "3")]
    pub r#type: i32,
    /// Size in bytes.
    #[prost(uint64, tag = "4")]
    pub size: u64,
    /// Unix permission bits.
    #[prost(uint32, tag = "5")]
    pub permissions: u32,
    /// Modification time, seconds part.
    #[prost(int64, tag = "6")]
    pub modified_s: i64,
    /// Modification time, nanoseconds part.
    #[prost(int32, tag = "7")]
    pub modified_ns: i32,
    /// Deletion tombstone.
    #[prost(bool, tag = "8")]
    pub deleted: bool,
    /// Excluded from synchronization.
    #[prost(bool, tag = "9")]
    pub invalid: bool,
    /// Sequence within the owning folder-info.
    #[prost(uint64, tag = "10")]
    pub sequence: u64,
    /// Vector clock.
    #[prost(message, optional, tag = "11")]
    pub version: Option<Vector>,
    /// Symlink target, when applicable.
    #[prost(string, tag = "12")]
    pub symlink_target: String,
    /// Block size used to chunk this file.
    #[prost(uint32, tag = "13")]
    pub block_size: u32,
    /// Ordered 32-byte block hashes.
    #[prost(bytes = "vec", repeated, tag = "16")]
    pub blocks: Vec<Vec<u8>>,
    /// Which blocks are locally available (for resume).
    #[prost(bool, repeated, tag = "17")]
    pub local_blocks: Vec<bool>,
}

/// A content-addressed block. Keyed by its 32-byte hash.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockRecord {
    /// Block length in bytes.
    #[prost(uint32, tag = "1")]
    pub size: u32,
    /// Optional Adler-style rolling hash.
    #[prost(uint32, tag = "2")]
    pub weak_hash: u32,
}

/// A device whose connection attempts are rejected. Keyed by digest.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IgnoredDeviceRecord {
    /// Name the device announced when it was ignored.
    #[prost(string, tag = "1")]
    pub name: String,
}

/// A folder offer that was declined. Keyed by folder id.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IgnoredFolderRecord {
    /// Label the folder carried when it was declined.
    #[prost(string, tag = "1")]
    pub label: String,
}

/// A folder a peer advertised that is not yet accepted locally.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UnknownFolderRecord {
    /// Folder id.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Label from the announcement.
    #[prost(string, tag = "2")]
    pub label: String,
    /// Digest of the announcing device.
    #[prost(bytes = "vec", tag = "3")]
    pub device: Vec<u8>,
    /// Index id the announcer assigned for itself.
    #[prost(uint64, tag = "4")]
    pub index_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message as _;

    #[test]
    fn folder_record_roundtrip() {
        let record = FolderRecord {
            id: "1234-5678".into(),
            label: "my-label".into(),
            path: "/tmp/x".into(),
            folder_type: FolderType::SendReceive as i32,
            rescan_interval: 3600,
            pull_order: PullOrder::Alphabetic as i32,
            watched: true,
            ignore_permissions: false,
        };
        let restored = FolderRecord::decode(record.encode_to_vec().as_slice()).unwrap();
        assert_eq!(record, restored);
    }

    #[test]
    fn file_record_keeps_block_order() {
        let record = FileInfoRecord {
            folder_info: 9,
            name: "a/b.txt".into(),
            size: 300_000,
            block_size: 128 * 1024,
            sequence: 4,
            blocks: vec![vec![1; 32], vec![2; 32], vec![3; 32]],
            local_blocks: vec![true, false, true],
            ..Default::default()
        };
        let restored = FileInfoRecord::decode(record.encode_to_vec().as_slice()).unwrap();
        assert_eq!(restored.blocks[1], vec![2; 32]);
        assert_eq!(restored.local_blocks, vec![true, false, true]);
    }

    #[test]
    fn default_records_encode_empty() {
        assert!(BlockRecord::default().encode_to_vec().is_empty());
        assert!(DeviceRecord::default().encode_to_vec().is_empty());
    }
}

//! Block Exchange Protocol wire messages.
//!
//! Protobuf payloads exchanged after the Hello handshake. The structs carry
//! hand-written `prost` field attributes so the crate needs no build-script
//! codegen; tags follow BEP v1 so the wire format stays compatible.

use prost::Message as _;

use crate::SyncError;

/// Message type discriminator carried in the frame [`Header`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    /// Folder membership exchange.
    ClusterConfig = 0,
    /// Full index snapshot.
    Index = 1,
    /// Incremental index delta.
    IndexUpdate = 2,
    /// Block data request.
    Request = 3,
    /// Block data response.
    Response = 4,
    /// Informational download progress.
    DownloadProgress = 5,
    /// Keepalive.
    Ping = 6,
    /// Graceful close with a reason.
    Close = 7,
}

/// Per-message compression flag in the frame [`Header`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageCompression {
    /// Payload is stored as-is.
    None = 0,
    /// Payload is an LZ4 block with a length prefix.
    Lz4 = 1,
}

/// Device-level compression preference advertised in [`Device`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Compression {
    /// Compress metadata messages only.
    Metadata = 0,
    /// Never compress.
    Never = 1,
    /// Compress all payloads above the threshold.
    Always = 2,
}

/// Kind of filesystem entry a [`FileInfo`] describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FileInfoType {
    /// Regular file.
    File = 0,
    /// Directory.
    Directory = 1,
    /// Legacy symlink-to-file entry, treated as [`FileInfoType::Symlink`].
    SymlinkFile = 2,
    /// Legacy symlink-to-directory entry, treated as [`FileInfoType::Symlink`].
    SymlinkDirectory = 3,
    /// Symbolic link with a target string.
    Symlink = 4,
}

/// Result code in a [`Response`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    /// Request served.
    NoError = 0,
    /// Unspecified failure.
    Generic = 1,
    /// The named file does not exist in the folder.
    NoSuchFile = 2,
    /// The file exists but is invalid or out of bounds.
    InvalidFile = 3,
}

/// First message on a connection, preceded by the hello magic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    /// Human-readable device name.
    #[prost(string, tag = "1")]
    pub device_name: String,
    /// Implementation name, e.g. `spindrift`.
    #[prost(string, tag = "2")]
    pub client_name: String,
    /// Implementation version.
    #[prost(string, tag = "3")]
    pub client_version: String,
}

/// Frame header: message type plus compression flag.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    /// Which message the payload decodes to.
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    /// Whether the payload is LZ4-compressed.
    #[prost(enumeration = "MessageCompression", tag = "2")]
    pub compression: i32,
}

/// The folders this device shares with the peer, and with whom.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ClusterConfig {
    /// One entry per folder shared with the receiving peer.
    #[prost(message, repeated, tag = "1")]
    pub folders: Vec<Folder>,
}

/// A folder as announced in a [`ClusterConfig`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Folder {
    /// Folder id, shared across devices.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Human-readable label.
    #[prost(string, tag = "2")]
    pub label: String,
    /// The announcing device only sends, never pulls.
    #[prost(bool, tag = "3")]
    pub read_only: bool,
    /// Permissions are not synchronized for this folder.
    #[prost(bool, tag = "4")]
    pub ignore_permissions: bool,
    /// Deletions from peers are ignored.
    #[prost(bool, tag = "5")]
    pub ignore_delete: bool,
    /// Peer should not send temporary-index announcements.
    #[prost(bool, tag = "6")]
    pub disable_temp_indexes: bool,
    /// Folder is paused on the announcing device.
    #[prost(bool, tag = "7")]
    pub paused: bool,
    /// Devices the folder is shared with, including the announcer.
    #[prost(message, repeated, tag = "16")]
    pub devices: Vec<Device>,
}

/// A device entry inside a [`Folder`] announcement.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Device {
    /// Raw 32-byte certificate digest.
    #[prost(bytes = "vec", tag = "1")]
    pub id: Vec<u8>,
    /// Device name.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Contact addresses.
    #[prost(string, repeated, tag = "3")]
    pub addresses: Vec<String>,
    /// Compression preference.
    #[prost(enumeration = "Compression", tag = "4")]
    pub compression: i32,
    /// Certificate common name, if pinned.
    #[prost(string, tag = "5")]
    pub cert_name: String,
    /// Highest sequence the announcer has seen from this device.
    #[prost(int64, tag = "6")]
    pub max_sequence: i64,
    /// Device may introduce further devices.
    #[prost(bool, tag = "7")]
    pub introducer: bool,
    /// Identifier of the device's index sequence for this folder.
    #[prost(uint64, tag = "8")]
    pub index_id: u64,
    /// Keep devices the introducer has dropped.
    #[prost(bool, tag = "9")]
    pub skip_introduction_removals: bool,
}

/// Full index snapshot for one folder.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Index {
    /// Folder id.
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Every file the sender knows in this folder.
    #[prost(message, repeated, tag = "2")]
    pub files: Vec<FileInfo>,
}

/// Incremental index delta: only modified files.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IndexUpdate {
    /// Folder id.
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Files changed since the last Index or IndexUpdate.
    #[prost(message, repeated, tag = "2")]
    pub files: Vec<FileInfo>,
}

/// A versioned file entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileInfo {
    /// Folder-relative path.
    #[prost(string, tag = "1")]
    pub name: String,
    /// File, directory or symlink.
    #[prost(enumeration = "FileInfoType", tag = "2")]
    pub r#type: i32,
    /// Size in bytes; zero for directories and symlinks.
    #[prost(int64, tag = "3")]
    pub size: i64,
    /// Unix permission bits.
    #[prost(uint32, tag = "4")]
    pub permissions: u32,
    /// Modification time, seconds part.
    #[prost(int64, tag = "5")]
    pub modified_s: i64,
    /// Entry is a deletion tombstone.
    #[prost(bool, tag = "6")]
    pub deleted: bool,
    /// Entry must not be synchronized (conflict or scan failure).
    #[prost(bool, tag = "7")]
    pub invalid: bool,
    /// Permissions are unknown on the origin filesystem.
    #[prost(bool, tag = "8")]
    pub no_permissions: bool,
    /// Vector clock of the file's edit history.
    #[prost(message, optional, tag = "9")]
    pub version: Option<Vector>,
    /// Sequence assigned by the device that created this version.
    #[prost(int64, tag = "10")]
    pub sequence: i64,
    /// Modification time, nanoseconds part.
    #[prost(int32, tag = "11")]
    pub modified_ns: i32,
    /// Short id of the last modifying device.
    #[prost(uint64, tag = "12")]
    pub modified_by: u64,
    /// Block size used to chunk this file.
    #[prost(int32, tag = "13")]
    pub block_size: i32,
    /// Ordered content blocks.
    #[prost(message, repeated, tag = "16")]
    pub blocks: Vec<BlockInfo>,
    /// Symlink target, when type is a symlink.
    #[prost(string, tag = "17")]
    pub symlink_target: String,
}

/// One content-addressed block of a file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockInfo {
    /// Byte offset within the file.
    #[prost(int64, tag = "1")]
    pub offset: i64,
    /// Block length in bytes.
    #[prost(int32, tag = "2")]
    pub size: i32,
    /// SHA-256 of the block content.
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
    /// Optional Adler-style rolling hash.
    #[prost(uint32, tag = "4")]
    pub weak_hash: u32,
}

/// Vector clock: per-device edit counters.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Vector {
    /// Counters ordered by first modification.
    #[prost(message, repeated, tag = "1")]
    pub counters: Vec<Counter>,
}

/// One vector-clock entry.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Counter {
    /// Short device id (first 8 digest bytes).
    #[prost(uint64, tag = "1")]
    pub id: u64,
    /// Edit counter for that device.
    #[prost(uint64, tag = "2")]
    pub value: u64,
}

/// Request for a range of a file's bytes.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    /// Correlation id echoed in the [`Response`].
    #[prost(int32, tag = "1")]
    pub id: i32,
    /// Folder id.
    #[prost(string, tag = "2")]
    pub folder: String,
    /// Folder-relative file name.
    #[prost(string, tag = "3")]
    pub name: String,
    /// Byte offset to read from.
    #[prost(int64, tag = "4")]
    pub offset: i64,
    /// Number of bytes requested.
    #[prost(int32, tag = "5")]
    pub size: i32,
    /// Expected SHA-256 of the returned bytes, if known.
    #[prost(bytes = "vec", tag = "6")]
    pub hash: Vec<u8>,
    /// Read from the peer's temporary copy of the file.
    #[prost(bool, tag = "7")]
    pub from_temporary: bool,
}

/// Answer to a [`Request`].
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    /// Correlation id from the request.
    #[prost(int32, tag = "1")]
    pub id: i32,
    /// The requested bytes, empty on error.
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    /// Outcome code.
    #[prost(enumeration = "ErrorCode", tag = "3")]
    pub code: i32,
}

/// Informational progress report for partially downloaded files.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DownloadProgress {
    /// Folder id.
    #[prost(string, tag = "1")]
    pub folder: String,
    /// Per-file progress updates.
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<FileDownloadProgressUpdate>,
}

/// Progress entry for one file.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileDownloadProgressUpdate {
    /// 0 = append available blocks, 1 = forget the file.
    #[prost(int32, tag = "1")]
    pub update_type: i32,
    /// Folder-relative file name.
    #[prost(string, tag = "2")]
    pub name: String,
    /// Version this progress refers to.
    #[prost(message, optional, tag = "3")]
    pub version: Option<Vector>,
    /// Locally available block indexes.
    #[prost(int32, repeated, tag = "4")]
    pub block_indexes: Vec<i32>,
}

/// Keepalive; carries nothing.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {}

/// Graceful close with a human-readable reason.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Close {
    /// Why the sender is closing.
    #[prost(string, tag = "1")]
    pub reason: String,
}

/// A decoded BEP payload, tagged by its header type.
#[derive(Debug, Clone, PartialEq)]
pub enum BepMessage {
    /// Folder membership exchange.
    ClusterConfig(ClusterConfig),
    /// Full index snapshot.
    Index(Index),
    /// Incremental index delta.
    IndexUpdate(IndexUpdate),
    /// Block data request.
    Request(Request),
    /// Block data response.
    Response(Response),
    /// Informational download progress.
    DownloadProgress(DownloadProgress),
    /// Keepalive.
    Ping(Ping),
    /// Graceful close.
    Close(Close),
}

impl BepMessage {
    /// The header type for this payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ClusterConfig(_) => MessageType::ClusterConfig,
            Self::Index(_) => MessageType::Index,
            Self::IndexUpdate(_) => MessageType::IndexUpdate,
            Self::Request(_) => MessageType::Request,
            Self::Response(_) => MessageType::Response,
            Self::DownloadProgress(_) => MessageType::DownloadProgress,
            Self::Ping(_) => MessageType::Ping,
            Self::Close(_) => MessageType::Close,
        }
    }

    /// Encode the payload to protobuf bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::ClusterConfig(m) => m.encode_to_vec(),
            Self::Index(m) => m.encode_to_vec(),
            Self::IndexUpdate(m) => m.encode_to_vec(),
            Self::Request(m) => m.encode_to_vec(),
            Self::Response(m) => m.encode_to_vec(),
            Self::DownloadProgress(m) => m.encode_to_vec(),
            Self::Ping(m) => m.encode_to_vec(),
            Self::Close(m) => m.encode_to_vec(),
        }
    }

    /// Decode a payload of the given header type.
    pub fn from_bytes(msg_type: MessageType, bytes: &[u8]) -> Result<Self, SyncError> {
        let msg = match msg_type {
            MessageType::ClusterConfig => Self::ClusterConfig(ClusterConfig::decode(bytes)?),
            MessageType::Index => Self::Index(Index::decode(bytes)?),
            MessageType::IndexUpdate => Self::IndexUpdate(IndexUpdate::decode(bytes)?),
            MessageType::Request => Self::Request(Request::decode(bytes)?),
            MessageType::Response => Self::Response(Response::decode(bytes)?),
            MessageType::DownloadProgress => {
                Self::DownloadProgress(DownloadProgress::decode(bytes)?)
            }
            MessageType::Ping => Self::Ping(Ping::decode(bytes)?),
            MessageType::Close => Self::Close(Close::decode(bytes)?),
        };
        Ok(msg)
    }
}

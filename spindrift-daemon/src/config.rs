//! Daemon configuration.
//!
//! Loaded from a TOML file (default: `spindrift.toml`). Every field has a
//! default so a minimal file works, and the whole structure serializes back
//! losslessly: `serialize(default) -> parse -> equal` is a test guarantee.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use spindrift_types::bep::Compression;
use spindrift_types::records::{
    DeviceRecord, FolderRecord, FolderType as RecordFolderType, PullOrder as RecordPullOrder,
};
use spindrift_types::DeviceId;

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// The local device.
    #[serde(default)]
    pub device: DeviceSection,
    /// Networking parameters.
    #[serde(default)]
    pub net: NetConfig,
    /// Persistence parameters.
    #[serde(default)]
    pub db: DbConfig,
    /// Filesystem parameters.
    #[serde(default)]
    pub fs: FsConfig,
    /// Hasher pool parameters.
    #[serde(default)]
    pub hasher: HasherConfig,
    /// Device ids whose connection attempts are rejected.
    #[serde(default)]
    pub ignored_devices: Vec<String>,
    /// Folder offers that are declined.
    #[serde(default)]
    pub ignored_folders: Vec<IgnoredFolderConfig>,
    /// Synchronized folders.
    #[serde(default)]
    pub folders: Vec<FolderConfig>,
    /// Known peer devices.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// The local device section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSection {
    /// Name announced in the hello message.
    #[serde(default = "default_device_name")]
    pub name: String,
    /// Textual device id; generated and logged when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Networking parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Listen address for inbound connections.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Outbound connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Block request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Keepalive ping interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

/// Persistence parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    /// Environment directory.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Non-critical diffs tolerated in the open batch before a commit.
    #[serde(default = "default_uncommitted_threshold")]
    pub uncommitted_threshold: usize,
}

/// Filesystem parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsConfig {
    /// Maximum number of concurrently open file mappings.
    #[serde(default = "default_mmap_cache_size")]
    pub mmap_cache_size: usize,
}

/// Hasher pool parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HasherConfig {
    /// Number of digest worker threads.
    #[serde(default = "default_hasher_threads")]
    pub threads: usize,
}

/// A declined folder offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IgnoredFolderConfig {
    /// Folder id.
    pub id: String,
    /// Label it carried when declined.
    #[serde(default)]
    pub label: String,
}

/// How a folder participates in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FolderType {
    /// Pull and push.
    #[default]
    SendReceive,
    /// Announce only.
    SendOnly,
    /// Pull only.
    ReceiveOnly,
}

/// Pull scheduling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PullOrder {
    /// No particular order.
    #[default]
    Random,
    /// Lexicographic by name.
    Alphabetic,
    /// Smallest file first.
    SmallestFirst,
    /// Largest file first.
    LargestFirst,
    /// Oldest modification first.
    OldestFirst,
    /// Newest modification first.
    NewestFirst,
}

/// A synchronized folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Folder id, shared across devices.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
    /// Local filesystem root.
    pub path: PathBuf,
    /// Send/receive mode.
    #[serde(default, rename = "type")]
    pub folder_type: FolderType,
    /// Seconds between scheduled rescans.
    #[serde(default = "default_rescan_interval")]
    pub rescan_interval_secs: u32,
    /// Pull scheduling order.
    #[serde(default)]
    pub pull_order: PullOrder,
    /// Watch the folder between rescans.
    #[serde(default)]
    pub watched: bool,
    /// Do not synchronize permission bits.
    #[serde(default)]
    pub ignore_permissions: bool,
    /// Device ids this folder is shared with.
    #[serde(default)]
    pub devices: Vec<String>,
}

/// Compression preference for a peer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionPref {
    /// Compress metadata messages only.
    #[default]
    Metadata,
    /// Never compress.
    Never,
    /// Compress all payloads above the threshold.
    Always,
}

impl From<CompressionPref> for Compression {
    fn from(pref: CompressionPref) -> Self {
        match pref {
            CompressionPref::Metadata => Compression::Metadata,
            CompressionPref::Never => Compression::Never,
            CompressionPref::Always => Compression::Always,
        }
    }
}

/// A known peer device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Textual device id.
    pub id: String,
    /// Human-readable name.
    #[serde(default)]
    pub name: String,
    /// Compression preference.
    #[serde(default)]
    pub compression: CompressionPref,
    /// Pinned certificate common name.
    #[serde(default)]
    pub cert_name: String,
    /// Device may introduce further devices.
    #[serde(default)]
    pub introducer: bool,
    /// Accept folder offers from this device without prompting.
    #[serde(default)]
    pub auto_accept: bool,
    /// Synchronization with this device is paused.
    #[serde(default)]
    pub paused: bool,
    /// Static contact URLs, e.g. `tcp://10.0.0.2:22000`.
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            id: None,
        }
    }
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            keepalive_secs: default_keepalive(),
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            uncommitted_threshold: default_uncommitted_threshold(),
        }
    }
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            mmap_cache_size: default_mmap_cache_size(),
        }
    }
}

impl Default for HasherConfig {
    fn default() -> Self {
        Self {
            threads: default_hasher_threads(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceSection::default(),
            net: NetConfig::default(),
            db: DbConfig::default(),
            fs: FsConfig::default(),
            hasher: HasherConfig::default(),
            ignored_devices: Vec::new(),
            ignored_folders: Vec::new(),
            folders: Vec::new(),
            devices: Vec::new(),
        }
    }
}

fn default_device_name() -> String {
    "spindrift".to_string()
}

fn default_bind_address() -> String {
    "0.0.0.0:22000".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    60
}

fn default_keepalive() -> u64 {
    90
}

fn default_db_path() -> PathBuf {
    PathBuf::from("spindrift.db")
}

fn default_uncommitted_threshold() -> usize {
    32
}

fn default_mmap_cache_size() -> usize {
    16
}

fn default_hasher_threads() -> usize {
    4
}

fn default_rescan_interval() -> u32 {
    3600
}

impl Config {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_str(&content, path)
    }

    /// Parse a TOML string; `path` is only for error context.
    pub fn from_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize { source: e })
    }
}

impl FolderConfig {
    /// The stored record for this folder.
    pub fn to_record(&self) -> FolderRecord {
        let folder_type = match self.folder_type {
            FolderType::SendReceive => RecordFolderType::SendReceive,
            FolderType::SendOnly => RecordFolderType::SendOnly,
            FolderType::ReceiveOnly => RecordFolderType::ReceiveOnly,
        };
        let pull_order = match self.pull_order {
            PullOrder::Random => RecordPullOrder::Random,
            PullOrder::Alphabetic => RecordPullOrder::Alphabetic,
            PullOrder::SmallestFirst => RecordPullOrder::SmallestFirst,
            PullOrder::LargestFirst => RecordPullOrder::LargestFirst,
            PullOrder::OldestFirst => RecordPullOrder::OldestFirst,
            PullOrder::NewestFirst => RecordPullOrder::NewestFirst,
        };
        FolderRecord {
            id: self.id.clone(),
            label: self.label.clone(),
            path: self.path.to_string_lossy().into_owned(),
            folder_type: folder_type as i32,
            rescan_interval: self.rescan_interval_secs,
            pull_order: pull_order as i32,
            watched: self.watched,
            ignore_permissions: self.ignore_permissions,
        }
    }
}

impl DeviceConfig {
    /// Parse the configured device id.
    pub fn device_id(&self) -> Result<DeviceId, ConfigError> {
        self.id.parse().map_err(|e| ConfigError::DeviceId {
            id: self.id.clone(),
            source: e,
        })
    }

    /// The stored record for this device.
    pub fn to_record(&self) -> DeviceRecord {
        DeviceRecord {
            name: self.name.clone(),
            cert_name: self.cert_name.clone(),
            compression: Compression::from(self.compression) as i32,
            introducer: self.introducer,
            auto_accept: self.auto_accept,
            paused: self.paused,
            addresses: self.addresses.clone(),
            last_seen: Vec::new(),
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path to the file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse the configuration file.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path to the file.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Failed to serialize the configuration.
    #[error("failed to serialize config: {source}")]
    Serialize {
        /// Underlying TOML error.
        source: toml::ser::Error,
    },
    /// A configured device id does not parse.
    #[error("invalid device id '{id}': {source}")]
    DeviceId {
        /// The offending id string.
        id: String,
        /// The parse failure.
        source: spindrift_types::DeviceIdError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const IGNORED: &str = "O4LHPKG-O6BQ36W-MUOVKTI-MKAVHSC-Y7EC3U4-DHNLEDE-MZBJWQN-UIX6QAL";

    #[test]
    fn default_config_roundtrips() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let restored = Config::from_str(&text, Path::new("spindrift.toml")).unwrap();
        assert_eq!(config, restored);
    }

    #[test]
    fn ignored_device_survives_roundtrip() {
        let mut config = Config::default();
        config.ignored_devices.push(IGNORED.to_string());
        let text = config.to_toml().unwrap();
        assert!(text.contains("O4LHPKG"));
        let restored = Config::from_str(&text, Path::new("spindrift.toml")).unwrap();
        assert_eq!(restored.ignored_devices, vec![IGNORED.to_string()]);
        assert_eq!(restored, config);
    }

    #[test]
    fn device_entry_survives_roundtrip() {
        let mut config = Config::default();
        config.devices.push(DeviceConfig {
            id: IGNORED.to_string(),
            name: "my-device".into(),
            compression: CompressionPref::Metadata,
            cert_name: "cert-issuer".into(),
            introducer: true,
            auto_accept: true,
            paused: false,
            addresses: vec!["tcp://10.0.0.2:22000".into()],
        });
        let text = config.to_toml().unwrap();
        assert!(text.contains("O4LHPKG"));
        let restored = Config::from_str(&text, Path::new("spindrift.toml")).unwrap();
        assert_eq!(restored, config);
        restored.devices[0].device_id().unwrap();
    }

    #[test]
    fn minimal_file_uses_defaults() {
        let config = Config::from_str("", Path::new("empty.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.net.bind_address, "0.0.0.0:22000");
        assert_eq!(config.db.uncommitted_threshold, 32);
        assert_eq!(config.hasher.threads, 4);
    }

    #[test]
    fn folder_entry_parses_with_sparse_fields() {
        let text = r#"
[[folders]]
id = "1234-5678"
label = "my-label"
path = "/tmp/x"
type = "receive_only"
devices = ["O4LHPKG-O6BQ36W-MUOVKTI-MKAVHSC-Y7EC3U4-DHNLEDE-MZBJWQN-UIX6QAL"]
"#;
        let config = Config::from_str(text, Path::new("x.toml")).unwrap();
        let folder = &config.folders[0];
        assert_eq!(folder.folder_type, FolderType::ReceiveOnly);
        assert_eq!(folder.rescan_interval_secs, 3600);
        assert_eq!(folder.pull_order, PullOrder::Random);
        let record = folder.to_record();
        assert_eq!(record.folder_type, RecordFolderType::ReceiveOnly as i32);
    }

    #[test]
    fn bad_device_id_is_an_error() {
        let device = DeviceConfig {
            id: "not-a-device-id".into(),
            name: String::new(),
            compression: CompressionPref::default(),
            cert_name: String::new(),
            introducer: false,
            auto_accept: false,
            paused: false,
            addresses: vec![],
        };
        assert!(matches!(
            device.device_id(),
            Err(ConfigError::DeviceId { .. })
        ));
    }
}

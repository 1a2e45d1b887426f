//! A synchronized folder.

use std::path::{Path, PathBuf};

use spindrift_types::records::{FolderRecord, FolderType, PullOrder};
use spindrift_types::TEMP_SUFFIX;

/// A folder shared across devices, rooted at a local path.
#[derive(Debug, Clone, PartialEq)]
pub struct Folder {
    /// Folder id, shared across devices.
    pub id: String,
    /// Human-readable label.
    pub label: String,
    /// Local filesystem root.
    pub path: PathBuf,
    /// Send/receive mode.
    pub folder_type: FolderType,
    /// Seconds between scheduled rescans.
    pub rescan_interval: u32,
    /// Pull scheduling order.
    pub pull_order: PullOrder,
    /// Watch the folder between rescans.
    pub watched: bool,
    /// Do not synchronize permission bits.
    pub ignore_permissions: bool,
}

impl Folder {
    /// Rebuild from a stored record.
    pub fn from_record(record: FolderRecord) -> Self {
        Self {
            id: record.id,
            label: record.label,
            path: PathBuf::from(record.path),
            folder_type: FolderType::try_from(record.folder_type)
                .unwrap_or(FolderType::SendReceive),
            rescan_interval: record.rescan_interval,
            pull_order: PullOrder::try_from(record.pull_order).unwrap_or(PullOrder::Random),
            watched: record.watched,
            ignore_permissions: record.ignore_permissions,
        }
    }

    /// Serialize the stored attributes.
    pub fn to_record(&self) -> FolderRecord {
        FolderRecord {
            id: self.id.clone(),
            label: self.label.clone(),
            path: self.path.to_string_lossy().into_owned(),
            folder_type: self.folder_type as i32,
            rescan_interval: self.rescan_interval,
            pull_order: self.pull_order as i32,
            watched: self.watched,
            ignore_permissions: self.ignore_permissions,
        }
    }

    /// Whether this device pulls remote changes into the folder.
    pub fn pull_capable(&self) -> bool {
        matches!(
            self.folder_type,
            FolderType::SendReceive | FolderType::ReceiveOnly
        )
    }

    /// Whether local changes are announced to peers.
    pub fn push_capable(&self) -> bool {
        matches!(
            self.folder_type,
            FolderType::SendReceive | FolderType::SendOnly
        )
    }

    /// Absolute path of a folder-relative name.
    pub fn resolve(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Absolute path of the temporary copy of a folder-relative name.
    pub fn resolve_temp(&self, name: &str) -> PathBuf {
        self.path.join(format!("{name}{TEMP_SUFFIX}"))
    }

    /// Strip the root from an absolute path, yielding the folder-relative
    /// name with `/` separators.
    pub fn relativize(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.path).ok()?;
        let mut name = String::new();
        for part in rel.components() {
            if !name.is_empty() {
                name.push('/');
            }
            name.push_str(&part.as_os_str().to_string_lossy());
        }
        Some(name)
    }
}

//! Locally originated cluster diffs.

use spindrift_types::bep;
use spindrift_types::records::{DeviceRecord, FolderRecord};
use spindrift_types::{DeviceId, SyncError};

use crate::block_info::FileKey;
use crate::cluster::Cluster;
use crate::device::Device;
use crate::file_info::FileInfo;
use crate::folder::Folder;
use crate::folder_info::FolderInfo;
use crate::random_index_id;
use crate::version::Version;

/// Create a folder locally, with the local folder-info alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateFolder {
    /// The folder's configuration record.
    pub record: FolderRecord,
    /// Index id for the local folder-info; generated at construction.
    pub index_id: u64,
}

impl CreateFolder {
    /// Build with a freshly generated index id.
    pub fn new(record: FolderRecord) -> Self {
        Self {
            record,
            index_id: random_index_id(),
        }
    }

    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let folder = Folder::from_record(self.record.clone());
        let folder_id = folder.id.clone();
        cluster.add_folder(folder);
        if cluster.local_folder_info(&folder_id).is_none() {
            cluster.add_folder_info(FolderInfo::new(
                folder_id,
                cluster.local_id(),
                self.index_id,
            ));
        }
        Ok(())
    }
}

/// Share an existing folder with a peer device.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareFolder {
    /// The peer gaining access.
    pub peer: DeviceId,
    /// The folder being shared.
    pub folder_id: String,
    /// Index id for the peer's folder-info until its real one is learned.
    pub index_id: u64,
}

impl ShareFolder {
    /// Build with a freshly generated index id.
    pub fn new(peer: DeviceId, folder_id: impl Into<String>) -> Self {
        Self {
            peer,
            folder_id: folder_id.into(),
            index_id: random_index_id(),
        }
    }

    /// Build with the index id a peer announced for itself.
    pub fn with_index(peer: DeviceId, folder_id: impl Into<String>, index_id: u64) -> Self {
        Self {
            peer,
            folder_id: folder_id.into(),
            index_id,
        }
    }

    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        if cluster.folder(&self.folder_id).is_none() {
            return Err(SyncError::UnknownFolder(self.folder_id.clone()));
        }
        if cluster.device(&self.peer).is_none() {
            return Err(SyncError::Protocol(format!(
                "cannot share '{}' with unknown device {}",
                self.folder_id,
                self.peer.short()
            )));
        }
        if cluster.folder_info(&self.folder_id, &self.peer).is_none() {
            cluster.add_folder_info(FolderInfo::new(
                self.folder_id.clone(),
                self.peer,
                self.index_id,
            ));
        }
        Ok(())
    }
}

/// Stop sharing a folder with a peer; the peer's file entries and their block
/// references go away.
#[derive(Debug, Clone, PartialEq)]
pub struct UnshareFolder {
    /// The peer losing access.
    pub peer: DeviceId,
    /// The folder being unshared.
    pub folder_id: String,
}

impl UnshareFolder {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let Some(info) = cluster.remove_folder_info(&self.folder_id, &self.peer) else {
            return Ok(());
        };
        for file in info.files() {
            let key = FileKey {
                folder_id: self.folder_id.clone(),
                device_id: self.peer,
                name: file.name.clone(),
            };
            cluster.unlink_file_blocks(&key, &file.blocks);
        }
        Ok(())
    }
}

/// Insert or update a peer device. The digest arrives raw so a malformed id
/// surfaces as a decode failure at apply time.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatePeer {
    /// Raw 32-byte certificate digest.
    pub device: Vec<u8>,
    /// Attributes to apply.
    pub record: DeviceRecord,
}

impl UpdatePeer {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let id = DeviceId::from_bytes(&self.device)
            .ok_or_else(|| SyncError::Decode("device id is malformed".into()))?;
        match cluster.device_mut(&id) {
            Some(device) => device.update_from(&self.record),
            None => cluster.add_device(Device::from_record(id, self.record.clone())),
        }
        Ok(())
    }
}

/// Forget a peer device together with every folder-info it owned.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovePeer {
    /// The device to forget.
    pub device: DeviceId,
}

impl RemovePeer {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let folder_ids: Vec<String> = cluster.folders().map(|f| f.id.clone()).collect();
        for folder_id in folder_ids {
            UnshareFolder {
                peer: self.device,
                folder_id,
            }
            .apply(cluster)?;
        }
        cluster.remove_device(&self.device);
        Ok(())
    }
}

/// Reject future connection attempts from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct AddIgnoredDevice {
    /// The device to ignore.
    pub device: DeviceId,
    /// Name it announced, for display.
    pub name: String,
}

impl AddIgnoredDevice {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        cluster.add_ignored_device(self.device, self.name.clone());
        Ok(())
    }
}

/// Decline offers of a folder id.
#[derive(Debug, Clone, PartialEq)]
pub struct AddIgnoredFolder {
    /// The folder id to decline.
    pub id: String,
    /// Label it carried, for display.
    pub label: String,
}

impl AddIgnoredFolder {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        cluster.add_ignored_folder(self.id.clone(), self.label.clone());
        Ok(())
    }
}

/// Copy a peer's file entry into the local folder-info so the pull has a
/// target; blocks start out unavailable and the sequence unassigned.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneFile {
    /// The folder.
    pub folder_id: String,
    /// The peer whose entry is being cloned.
    pub source: DeviceId,
    /// Folder-relative name.
    pub name: String,
}

impl CloneFile {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let source = cluster
            .file(&self.folder_id, &self.source, &self.name)
            .ok_or_else(|| {
                SyncError::Protocol(format!(
                    "clone source '{}' missing in folder '{}'",
                    self.name, self.folder_id
                ))
            })?
            .clone();
        let local_id = cluster.local_id();
        let key = FileKey {
            folder_id: self.folder_id.clone(),
            device_id: local_id,
            name: self.name.clone(),
        };

        let mut clone = source;
        clone.sequence = 0;
        clone.db_key = 0;
        let blocks = clone.blocks.clone();
        clone.set_blocks(blocks);

        let info = cluster
            .folder_info_mut(&self.folder_id, &local_id)
            .ok_or_else(|| SyncError::UnknownFolder(self.folder_id.clone()))?;
        let previous = info.remove(&self.name);
        info.add(clone.clone());
        if let Some(prev) = previous {
            cluster.unlink_file_blocks(&key, &prev.blocks);
        }
        cluster.link_file_blocks(&key, &clone);
        Ok(())
    }
}

/// Scanner-observed local change: a new, modified or deleted entry. Carries
/// the full current state including freshly hashed blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalUpdate {
    /// The folder.
    pub folder_id: String,
    /// Current on-disk state; `deleted` marks a tombstone.
    pub file: bep::FileInfo,
}

impl LocalUpdate {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        if cluster.folder(&self.folder_id).is_none() {
            return Err(SyncError::UnknownFolder(self.folder_id.clone()));
        }
        let local_id = cluster.local_id();
        let short_id = local_id.short_id();
        let key = FileKey {
            folder_id: self.folder_id.clone(),
            device_id: local_id,
            name: self.file.name.clone(),
        };

        let mut file = FileInfo::from_wire(&self.file)?;
        file.mark_all_local();

        let info = cluster
            .folder_info_mut(&self.folder_id, &local_id)
            .ok_or_else(|| SyncError::UnknownFolder(self.folder_id.clone()))?;
        let previous = info.remove(&self.file.name);
        file.version = match &previous {
            Some(prev) => {
                let mut v = prev.version.clone();
                v.update(short_id);
                v
            }
            None => Version::initial(short_id),
        };
        file.sequence = info.next_sequence();
        info.add(file.clone());

        if let Some(prev) = &previous {
            cluster.unlink_file_blocks(&key, &prev.blocks);
        }
        for (i, wire_block) in self.file.blocks.iter().enumerate() {
            if let Some(hash) = file.blocks.get(i) {
                cluster.insert_block(*hash, wire_block.size.max(0) as u32, wire_block.weak_hash);
                if let Some(block) = cluster.block_mut(hash) {
                    block.link(key.clone(), i as u32, true);
                }
            }
        }
        Ok(())
    }
}

/// Exclude a local file from synchronization, typically after repeated
/// digest mismatches tainted it.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidateFile {
    /// The folder.
    pub folder_id: String,
    /// Folder-relative name.
    pub name: String,
}

impl InvalidateFile {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let local_id = cluster.local_id();
        let info = cluster
            .folder_info_mut(&self.folder_id, &local_id)
            .ok_or_else(|| SyncError::UnknownFolder(self.folder_id.clone()))?;
        if let Some(file) = info.file_mut(&self.name) {
            file.invalid = true;
        }
        Ok(())
    }
}

/// A pulled file's last block has been flushed; assign the local sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishFile {
    /// The folder.
    pub folder_id: String,
    /// Folder-relative name.
    pub name: String,
}

impl FinishFile {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let local_id = cluster.local_id();
        let short_id = local_id.short_id();
        let info = cluster
            .folder_info_mut(&self.folder_id, &local_id)
            .ok_or_else(|| SyncError::UnknownFolder(self.folder_id.clone()))?;
        let file = info.file(&self.name).ok_or_else(|| {
            SyncError::Protocol(format!(
                "finish for unknown file '{}' in folder '{}'",
                self.name, self.folder_id
            ))
        })?;
        if file.is_incomplete() {
            return Err(SyncError::Protocol(format!(
                "finish for incomplete file '{}'",
                self.name
            )));
        }
        let sequence = info.next_sequence();
        if let Some(file) = info.file_mut(&self.name) {
            file.sequence = sequence;
            file.version.update(short_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ClusterDiff;

    const MY_ID: &str = "KHQNO2S-5QSILRK-YX4JZZ4-7L77APM-QNVGZJT-EKU7IFI-PNEPBMY-4MXFMQD";
    const PEER_ID: &str = "VUV42CZ-IQD5A37-RPEBPM4-VVQK6E4-6WSKC7B-PVJQHHD-4PZD44V-ENC6WAZ";

    fn cluster() -> Cluster {
        let my_id: DeviceId = MY_ID.parse().unwrap();
        let peer_id: DeviceId = PEER_ID.parse().unwrap();
        let mut cluster = Cluster::new(Device::new(my_id, "my-device"));
        cluster.add_device(Device::new(peer_id, "peer-device"));
        cluster
    }

    fn folder_record() -> FolderRecord {
        FolderRecord {
            id: "1234-5678".into(),
            label: "my-label".into(),
            path: "/tmp/x".into(),
            ..Default::default()
        }
    }

    #[test]
    fn folder_creation() {
        let mut cluster = cluster();
        cluster
            .apply(&ClusterDiff::create_folder(folder_record()))
            .unwrap();

        let folder = cluster.folder("1234-5678").unwrap();
        assert_eq!(folder.label, "my-label");
        assert_eq!(folder.path.to_string_lossy(), "/tmp/x");

        let fi = cluster.local_folder_info("1234-5678").unwrap();
        assert_eq!(fi.max_sequence, 0);
        assert_ne!(fi.index_id, 0);
    }

    #[test]
    fn share_folder_creates_peer_folder_info() {
        let mut cluster = cluster();
        let peer: DeviceId = PEER_ID.parse().unwrap();
        cluster
            .apply(&ClusterDiff::create_folder(folder_record()))
            .unwrap();
        cluster
            .apply(&ClusterDiff::share_folder(peer, "1234-5678"))
            .unwrap();

        let fi = cluster.folder_info("1234-5678", &peer).unwrap();
        assert_eq!(fi.device_id, peer);
        assert_eq!(fi.max_sequence, 0);
        assert_ne!(fi.index_id, 0);
    }

    #[test]
    fn share_unknown_folder_fails() {
        let mut cluster = cluster();
        let peer: DeviceId = PEER_ID.parse().unwrap();
        let err = cluster
            .apply(&ClusterDiff::share_folder(peer, "nope"))
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownFolder(_)));
    }

    #[test]
    fn update_peer_by_raw_digest() {
        let mut cluster = cluster();
        let my_id: DeviceId = MY_ID.parse().unwrap();
        let diff = ClusterDiff::update_peer(
            my_id.as_bytes().to_vec(),
            DeviceRecord {
                name: "myyy-devices".into(),
                cert_name: "cn2".into(),
                ..Default::default()
            },
        );
        cluster.apply(&diff).unwrap();
        let device = cluster.device(&my_id).unwrap();
        assert_eq!(device.name, "myyy-devices");
        assert_eq!(device.cert_name, "cn2");
    }

    #[test]
    fn update_peer_with_malformed_digest_fails() {
        let mut cluster = cluster();
        let diff = ClusterDiff::update_peer(b"wrong-sha256".to_vec(), DeviceRecord::default());
        let err = cluster.apply(&diff).unwrap_err();
        assert_eq!(err.to_string(), "decode error: device id is malformed");
    }

    #[test]
    fn local_update_assigns_sequence_and_version() {
        let mut cluster = cluster();
        cluster
            .apply(&ClusterDiff::create_folder(folder_record()))
            .unwrap();
        let wire = bep::FileInfo {
            name: "a.txt".into(),
            size: 5,
            block_size: 5,
            blocks: vec![bep::BlockInfo {
                offset: 0,
                size: 5,
                hash: vec![7; 32],
                weak_hash: 3,
            }],
            ..Default::default()
        };
        cluster
            .apply(&ClusterDiff::local_update("1234-5678", wire.clone()))
            .unwrap();

        let my_id = cluster.local_id();
        let file = cluster.file("1234-5678", &my_id, "a.txt").unwrap();
        assert_eq!(file.sequence, 1);
        assert_eq!(file.version.counter(my_id.short_id()), 1);
        assert!(file.is_complete());
        assert_eq!(cluster.blocks().len(), 1);

        // a second scan of the same file bumps sequence and version
        cluster
            .apply(&ClusterDiff::local_update("1234-5678", wire))
            .unwrap();
        let fi = cluster.local_folder_info("1234-5678").unwrap();
        let file = fi.file("a.txt").unwrap();
        assert_eq!(file.sequence, 2);
        assert_eq!(file.version.counter(my_id.short_id()), 2);
        assert_eq!(fi.max_sequence, 2);
        assert!(file.sequence <= fi.max_sequence);
    }

    #[test]
    fn local_tombstone_releases_blocks() {
        let mut cluster = cluster();
        cluster
            .apply(&ClusterDiff::create_folder(folder_record()))
            .unwrap();
        let wire = bep::FileInfo {
            name: "a.txt".into(),
            size: 5,
            block_size: 5,
            blocks: vec![bep::BlockInfo {
                offset: 0,
                size: 5,
                hash: vec![7; 32],
                weak_hash: 0,
            }],
            ..Default::default()
        };
        cluster
            .apply(&ClusterDiff::local_update("1234-5678", wire))
            .unwrap();
        assert_eq!(cluster.blocks().len(), 1);

        let tombstone = bep::FileInfo {
            name: "a.txt".into(),
            deleted: true,
            ..Default::default()
        };
        cluster
            .apply(&ClusterDiff::local_update("1234-5678", tombstone))
            .unwrap();
        assert_eq!(cluster.blocks().len(), 0);
        assert!(cluster.deleted_blocks().contains(&[7; 32]));
        let file = cluster
            .file("1234-5678", &cluster.local_id(), "a.txt")
            .unwrap();
        assert!(file.deleted);
    }

    #[test]
    fn finish_file_bumps_sequence_once_complete() {
        let mut cluster = cluster();
        let peer: DeviceId = PEER_ID.parse().unwrap();
        cluster
            .apply(&ClusterDiff::create_folder(folder_record()))
            .unwrap();
        cluster
            .apply(&ClusterDiff::share_folder(peer, "1234-5678"))
            .unwrap();

        // peer announces a single-block file; we clone it locally
        let wire = bep::FileInfo {
            name: "q.txt".into(),
            size: 5,
            block_size: 5,
            sequence: 1,
            version: Some(bep::Vector {
                counters: vec![bep::Counter { id: 9, value: 1 }],
            }),
            blocks: vec![bep::BlockInfo {
                offset: 0,
                size: 5,
                hash: vec![5; 32],
                weak_hash: 0,
            }],
            ..Default::default()
        };
        cluster
            .apply(&ClusterDiff::update_folder(peer, "1234-5678", vec![wire]))
            .unwrap();
        cluster
            .apply(&ClusterDiff::clone_file("1234-5678", peer, "q.txt"))
            .unwrap();

        // finishing before the block landed is a protocol error
        let err = cluster
            .apply(&ClusterDiff::finish_file("1234-5678", "q.txt"))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));

        let local = cluster.local_id();
        cluster
            .mark_block_local("1234-5678", &local, "q.txt", 0)
            .unwrap();
        cluster
            .apply(&ClusterDiff::finish_file("1234-5678", "q.txt"))
            .unwrap();

        let fi = cluster.local_folder_info("1234-5678").unwrap();
        let file = fi.file("q.txt").unwrap();
        assert!(file.sequence > 0);
        assert!(file.sequence <= fi.max_sequence);
        // the completed pull records a new local version on top of the
        // origin's history, so later peer edits compare as concurrent
        // instead of being discarded
        assert_eq!(file.version.counter(local.short_id()), 1);
        assert_eq!(file.version.counter(9), 1, "origin history is retained");
    }

    #[test]
    fn unshare_releases_peer_blocks() {
        let mut cluster = cluster();
        let peer: DeviceId = PEER_ID.parse().unwrap();
        cluster
            .apply(&ClusterDiff::create_folder(folder_record()))
            .unwrap();
        cluster
            .apply(&ClusterDiff::share_folder(peer, "1234-5678"))
            .unwrap();
        let wire = bep::FileInfo {
            name: "p.txt".into(),
            size: 5,
            block_size: 5,
            sequence: 1,
            blocks: vec![bep::BlockInfo {
                offset: 0,
                size: 5,
                hash: vec![8; 32],
                weak_hash: 0,
            }],
            ..Default::default()
        };
        cluster
            .apply(&ClusterDiff::update_folder(peer, "1234-5678", vec![wire]))
            .unwrap();
        assert_eq!(cluster.blocks().len(), 1);

        cluster
            .apply(&ClusterDiff::unshare_folder(peer, "1234-5678"))
            .unwrap();
        assert!(cluster.folder_info("1234-5678", &peer).is_none());
        assert_eq!(cluster.blocks().len(), 0);
    }
}

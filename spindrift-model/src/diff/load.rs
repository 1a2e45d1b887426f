//! Cluster reconstruction from storage.
//!
//! The persistence actor packages one raw `(key-body, value)` batch per
//! entity kind into a [`LoadCluster`] aggregate; applying it rebuilds the
//! cluster in one pass. The trailing [`LoadPart::Close`] lets observers end
//! their read transaction.

use std::collections::HashMap;

use prost::Message as _;

use spindrift_types::records::{
    BlockRecord, DeviceRecord, FileInfoRecord, FolderInfoRecord, FolderRecord,
    IgnoredDeviceRecord, IgnoredFolderRecord, UnknownFolderRecord,
};
use spindrift_types::{DeviceId, SyncError};

use crate::block_info::FileKey;
use crate::cluster::{Cluster, UnknownFolder};
use crate::device::Device;
use crate::file_info::FileInfo;
use crate::folder::Folder;
use crate::folder_info::FolderInfo;

/// A raw key-body/value pair as read from the store, prefix byte stripped.
pub type RawKv = (Vec<u8>, Vec<u8>);

/// One entity-kind batch inside the aggregate.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadPart {
    /// Device records keyed by digest.
    Devices(Vec<RawKv>),
    /// Block records keyed by hash.
    Blocks(Vec<RawKv>),
    /// Folder records keyed by folder id.
    Folders(Vec<RawKv>),
    /// Folder-info records keyed by big-endian u64.
    FolderInfos(Vec<RawKv>),
    /// File-info records keyed by big-endian u64.
    FileInfos(Vec<RawKv>),
    /// Ignored-device records keyed by digest.
    IgnoredDevices(Vec<RawKv>),
    /// Ignored-folder records keyed by folder id.
    IgnoredFolders(Vec<RawKv>),
    /// Unknown-folder records.
    UnknownFolders(Vec<RawKv>),
    /// Sentinel: the read transaction may be closed.
    Close,
}

/// The aggregate load diff: every part, applied in order, atomically from the
/// observers' point of view (one visitor pass).
#[derive(Debug, Clone, PartialEq)]
pub struct LoadCluster {
    /// Per-kind batches, in dependency order.
    pub parts: Vec<LoadPart>,
}

fn key_digest(key: &[u8]) -> Result<DeviceId, SyncError> {
    DeviceId::from_bytes(key)
        .ok_or_else(|| SyncError::Db(format!("stored digest key has length {}", key.len())))
}

fn key_u64(key: &[u8]) -> Result<u64, SyncError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| SyncError::Db(format!("stored sequence key has length {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

impl LoadCluster {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        // folder-info db key -> (folder, device), for linking file records
        let mut fi_keys: HashMap<u64, (String, DeviceId)> = HashMap::new();

        for part in &self.parts {
            match part {
                LoadPart::Devices(batch) => {
                    for (key, value) in batch {
                        let id = key_digest(key)?;
                        let record = DeviceRecord::decode(value.as_slice())?;
                        if id == cluster.local_id() {
                            if let Some(local) = cluster.device_mut(&id) {
                                local.update_from(&record);
                            }
                        } else {
                            cluster.add_device(Device::from_record(id, record));
                        }
                    }
                }
                LoadPart::Blocks(batch) => {
                    for (key, value) in batch {
                        let hash = *key_digest(key)?.as_bytes();
                        let record = BlockRecord::decode(value.as_slice())?;
                        cluster.insert_block(hash, record.size, record.weak_hash);
                    }
                }
                LoadPart::Folders(batch) => {
                    for (_, value) in batch {
                        let record = FolderRecord::decode(value.as_slice())?;
                        cluster.add_folder(Folder::from_record(record));
                    }
                }
                LoadPart::FolderInfos(batch) => {
                    for (key, value) in batch {
                        let db_key = key_u64(key)?;
                        let record = FolderInfoRecord::decode(value.as_slice())?;
                        let device = DeviceId::from_bytes(&record.device).ok_or_else(|| {
                            SyncError::Db("folder-info has a malformed device digest".into())
                        })?;
                        if cluster.folder(&record.folder).is_none() {
                            return Err(SyncError::Db(format!(
                                "folder-info {db_key} references unknown folder '{}'",
                                record.folder
                            )));
                        }
                        fi_keys.insert(db_key, (record.folder.clone(), device));
                        cluster.add_folder_info(FolderInfo::from_record(&record, device, db_key));
                    }
                }
                LoadPart::FileInfos(batch) => {
                    for (key, value) in batch {
                        let db_key = key_u64(key)?;
                        let record = FileInfoRecord::decode(value.as_slice())?;
                        let (folder_id, device) =
                            fi_keys.get(&record.folder_info).cloned().ok_or_else(|| {
                                SyncError::Db(format!(
                                    "file-info {db_key} references unknown folder-info {}",
                                    record.folder_info
                                ))
                            })?;
                        let file = FileInfo::from_record(record, db_key)?;
                        let file_key = FileKey {
                            folder_id: folder_id.clone(),
                            device_id: device,
                            name: file.name.clone(),
                        };
                        cluster.link_file_blocks(&file_key, &file);
                        if let Some(info) = cluster.folder_info_mut(&folder_id, &device) {
                            info.add(file);
                        }
                    }
                }
                LoadPart::IgnoredDevices(batch) => {
                    for (key, value) in batch {
                        let id = key_digest(key)?;
                        let record = IgnoredDeviceRecord::decode(value.as_slice())?;
                        cluster.add_ignored_device(id, record.name);
                    }
                }
                LoadPart::IgnoredFolders(batch) => {
                    for (key, value) in batch {
                        let id = String::from_utf8_lossy(key).into_owned();
                        let record = IgnoredFolderRecord::decode(value.as_slice())?;
                        cluster.add_ignored_folder(id, record.label);
                    }
                }
                LoadPart::UnknownFolders(batch) => {
                    for (_, value) in batch {
                        let record = UnknownFolderRecord::decode(value.as_slice())?;
                        let device = DeviceId::from_bytes(&record.device).ok_or_else(|| {
                            SyncError::Db("unknown-folder has a malformed device digest".into())
                        })?;
                        cluster.add_unknown_folder(UnknownFolder {
                            id: record.id,
                            label: record.label,
                            device,
                            index_id: record.index_id,
                        });
                    }
                }
                LoadPart::Close => {}
            }
        }
        Ok(())
    }

    /// Serialize a cluster into the load representation. Entities without a
    /// storage key get deterministic ones, so loading the result and
    /// snapshotting again is stable.
    pub fn snapshot(cluster: &Cluster) -> Self {
        let mut next_key = 1u64;
        let mut alloc = |existing: u64| {
            if existing != 0 {
                next_key = next_key.max(existing + 1);
                existing
            } else {
                let k = next_key;
                next_key += 1;
                k
            }
        };

        let mut devices: Vec<RawKv> = cluster
            .devices()
            .map(|d| (d.id.as_bytes().to_vec(), d.to_record().encode_to_vec()))
            .collect();
        devices.sort();

        let mut blocks: Vec<RawKv> = cluster
            .blocks()
            .values()
            .map(|b| (b.hash.to_vec(), b.to_record().encode_to_vec()))
            .collect();
        blocks.sort();

        let mut folder_ids: Vec<&str> = cluster.folders().map(|f| f.id.as_str()).collect();
        folder_ids.sort_unstable();
        let folders: Vec<RawKv> = folder_ids
            .iter()
            .map(|id| {
                let f = cluster.folder(id).unwrap();
                (id.as_bytes().to_vec(), f.to_record().encode_to_vec())
            })
            .collect();

        let mut folder_infos: Vec<RawKv> = Vec::new();
        let mut file_infos: Vec<RawKv> = Vec::new();
        for folder_id in &folder_ids {
            let mut device_ids: Vec<DeviceId> =
                cluster.folder_devices(folder_id).copied().collect();
            device_ids.sort();
            for device in device_ids {
                let Some(info) = cluster.folder_info(folder_id, &device) else {
                    continue;
                };
                let fi_key = alloc(info.db_key);
                folder_infos.push((
                    fi_key.to_be_bytes().to_vec(),
                    info.to_record().encode_to_vec(),
                ));
                let mut names: Vec<&str> = info.files().map(|f| f.name.as_str()).collect();
                names.sort_unstable();
                for name in names {
                    let file = info.file(name).unwrap();
                    let file_key = alloc(file.db_key);
                    file_infos.push((
                        file_key.to_be_bytes().to_vec(),
                        file.to_record(fi_key).encode_to_vec(),
                    ));
                }
            }
        }

        let mut ignored_devices: Vec<RawKv> = cluster
            .ignored_devices()
            .iter()
            .map(|(id, name)| {
                (
                    id.as_bytes().to_vec(),
                    IgnoredDeviceRecord { name: name.clone() }.encode_to_vec(),
                )
            })
            .collect();
        ignored_devices.sort();

        let mut ignored_folders: Vec<RawKv> = cluster
            .ignored_folders()
            .iter()
            .map(|(id, label)| {
                (
                    id.as_bytes().to_vec(),
                    IgnoredFolderRecord {
                        label: label.clone(),
                    }
                    .encode_to_vec(),
                )
            })
            .collect();
        ignored_folders.sort();

        let unknown_folders: Vec<RawKv> = cluster
            .unknown_folders()
            .iter()
            .map(|u| {
                let mut key = u.id.as_bytes().to_vec();
                key.extend_from_slice(u.device.as_bytes());
                let record = UnknownFolderRecord {
                    id: u.id.clone(),
                    label: u.label.clone(),
                    device: u.device.as_bytes().to_vec(),
                    index_id: u.index_id,
                };
                (key, record.encode_to_vec())
            })
            .collect();

        Self {
            parts: vec![
                LoadPart::Devices(devices),
                LoadPart::Blocks(blocks),
                LoadPart::Folders(folders),
                LoadPart::FolderInfos(folder_infos),
                LoadPart::FileInfos(file_infos),
                LoadPart::IgnoredDevices(ignored_devices),
                LoadPart::IgnoredFolders(ignored_folders),
                LoadPart::UnknownFolders(unknown_folders),
                LoadPart::Close,
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::ClusterDiff;
    use spindrift_types::bep;
    use spindrift_types::records::FolderRecord;

    const MY_ID: &str = "KHQNO2S-5QSILRK-YX4JZZ4-7L77APM-QNVGZJT-EKU7IFI-PNEPBMY-4MXFMQD";
    const PEER_ID: &str = "VUV42CZ-IQD5A37-RPEBPM4-VVQK6E4-6WSKC7B-PVJQHHD-4PZD44V-ENC6WAZ";

    fn populated_cluster() -> Cluster {
        let my_id: DeviceId = MY_ID.parse().unwrap();
        let peer_id: DeviceId = PEER_ID.parse().unwrap();
        let mut cluster = Cluster::new(Device::new(my_id, "my-device"));
        cluster.add_device(Device::new(peer_id, "peer-device"));
        cluster
            .apply(&ClusterDiff::create_folder(FolderRecord {
                id: "1234-5678".into(),
                label: "my-label".into(),
                path: "/tmp/x".into(),
                ..Default::default()
            }))
            .unwrap();
        cluster
            .apply(&ClusterDiff::share_folder(peer_id, "1234-5678"))
            .unwrap();
        cluster
            .apply(&ClusterDiff::local_update(
                "1234-5678",
                bep::FileInfo {
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
                },
            ))
            .unwrap();
        cluster
            .apply(&ClusterDiff::add_ignored_folder("junk", "junk-label"))
            .unwrap();
        cluster
    }

    fn load_into_fresh(load: &LoadCluster) -> Cluster {
        let my_id: DeviceId = MY_ID.parse().unwrap();
        let mut fresh = Cluster::new(Device::new(my_id, "my-device"));
        fresh
            .apply(&ClusterDiff::LoadCluster(load.clone()))
            .unwrap();
        fresh
    }

    #[test]
    fn snapshot_load_roundtrip_is_stable() {
        let original = populated_cluster();
        let first = load_into_fresh(&LoadCluster::snapshot(&original));
        let second = load_into_fresh(&LoadCluster::snapshot(&first));
        assert_eq!(first, second);
    }

    #[test]
    fn loaded_cluster_restores_entities_and_links() {
        let original = populated_cluster();
        let loaded = load_into_fresh(&LoadCluster::snapshot(&original));

        let my_id: DeviceId = MY_ID.parse().unwrap();
        let peer_id: DeviceId = PEER_ID.parse().unwrap();
        assert!(loaded.device(&peer_id).is_some());
        assert!(loaded.folder("1234-5678").is_some());
        assert!(loaded.folder_info("1234-5678", &peer_id).is_some());

        let file = loaded.file("1234-5678", &my_id, "a.txt").unwrap();
        assert_eq!(file.size, 5);
        assert!(file.is_complete());
        assert!(file.db_key != 0);

        // every block referenced by a file is resolvable in the block map
        let block = loaded.block(&[7; 32]).unwrap();
        assert_eq!(block.ref_count(), 1);
        assert!(block.local_source().is_some());
        assert_eq!(loaded.ignored_folders().get("junk").unwrap(), "junk-label");
    }

    #[test]
    fn dangling_file_info_is_a_db_error() {
        let load = LoadCluster {
            parts: vec![LoadPart::FileInfos(vec![(
                1u64.to_be_bytes().to_vec(),
                FileInfoRecord {
                    folder_info: 42,
                    name: "orphan".into(),
                    ..Default::default()
                }
                .encode_to_vec(),
            )])],
        };
        let my_id: DeviceId = MY_ID.parse().unwrap();
        let mut fresh = Cluster::new(Device::new(my_id, "my-device"));
        let err = fresh.apply(&ClusterDiff::LoadCluster(load)).unwrap_err();
        assert!(matches!(err, SyncError::Db(_)));
        assert!(fresh.is_tainted(), "db failures taint the cluster");
    }
}

//! Translation of applied diffs into logical storage operations.
//!
//! The coordinator runs [`serialize_diff`] on its strand with the post-apply
//! cluster and ships the resulting [`DbOp`]s to the [`crate::DbActor`], which
//! resolves logical identities to physical keys (allocating sequence numbers
//! where needed) and batches the writes.

use prost::Message as _;

use spindrift_model::diff::{
    AddIgnoredDevice, AddIgnoredFolder, CloneFile, ClusterDiff, ClusterUpdate, ClusterVisitor,
    CreateFolder, FinishFile, InvalidateFile, LocalUpdate, RemovePeer, ShareFolder, UnshareFolder,
    UpdateFolder, UpdatePeer,
};
use spindrift_model::{Cluster, BlockHash};
use spindrift_types::records::{
    FileInfoRecord, IgnoredDeviceRecord, IgnoredFolderRecord, UnknownFolderRecord,
};
use spindrift_types::{DeviceId, SyncError};

/// A storage operation with logical identity; the actor resolves keys.
#[derive(Debug, Clone, PartialEq)]
pub enum DbOp {
    /// Upsert a device record.
    PutDevice(DeviceId, Vec<u8>),
    /// Remove a device record.
    DelDevice(DeviceId),
    /// Upsert a folder record.
    PutFolder(String, Vec<u8>),
    /// Upsert a folder-info record for (folder, device).
    PutFolderInfo {
        /// Folder id.
        folder: String,
        /// Owning device.
        device: DeviceId,
        /// Encoded record; the actor fills nothing in.
        value: Vec<u8>,
    },
    /// Remove a folder-info and every file record under it.
    DelFolderInfo {
        /// Folder id.
        folder: String,
        /// Owning device.
        device: DeviceId,
    },
    /// Upsert a file record under its folder-info's key.
    PutFileInfo {
        /// Folder id.
        folder: String,
        /// Owning device.
        device: DeviceId,
        /// Folder-relative name.
        name: String,
        /// Record lacking the folder-info back-reference; the actor sets it.
        record: FileInfoRecord,
    },
    /// Remove a file record.
    DelFileInfo {
        /// Folder id.
        folder: String,
        /// Owning device.
        device: DeviceId,
        /// Folder-relative name.
        name: String,
    },
    /// Upsert a block record.
    PutBlock(BlockHash, Vec<u8>),
    /// Remove a garbage-collected block record.
    DelBlock(BlockHash),
    /// Upsert an ignored-device record.
    PutIgnoredDevice(DeviceId, Vec<u8>),
    /// Upsert an ignored-folder record.
    PutIgnoredFolder(String, Vec<u8>),
    /// Upsert an unknown-folder record.
    PutUnknownFolder(String, DeviceId, Vec<u8>),
}

/// Serialize one applied diff against the post-apply cluster.
pub fn serialize_diff(diff: &ClusterDiff, cluster: &Cluster) -> Result<Vec<DbOp>, SyncError> {
    let mut serializer = Serializer { ops: Vec::new() };
    diff.visit(&mut serializer, cluster)?;
    Ok(serializer.ops)
}

struct Serializer {
    ops: Vec<DbOp>,
}

impl Serializer {
    fn put_folder_info(&mut self, cluster: &Cluster, folder: &str, device: &DeviceId) {
        if let Some(info) = cluster.folder_info(folder, device) {
            self.ops.push(DbOp::PutFolderInfo {
                folder: folder.to_string(),
                device: *device,
                value: info.to_record().encode_to_vec(),
            });
        }
    }

    fn put_file(&mut self, cluster: &Cluster, folder: &str, device: &DeviceId, name: &str) {
        if let Some(file) = cluster.file(folder, device, name) {
            // the back-reference key is resolved by the actor
            self.ops.push(DbOp::PutFileInfo {
                folder: folder.to_string(),
                device: *device,
                name: name.to_string(),
                record: file.to_record(0),
            });
        }
    }

    fn put_file_blocks(&mut self, cluster: &Cluster, folder: &str, device: &DeviceId, name: &str) {
        if let Some(file) = cluster.file(folder, device, name) {
            for hash in &file.blocks {
                if let Some(block) = cluster.block(hash) {
                    self.ops
                        .push(DbOp::PutBlock(*hash, block.to_record().encode_to_vec()));
                }
            }
        }
    }

    fn del_collected_blocks(&mut self, cluster: &Cluster) {
        for hash in cluster.deleted_blocks() {
            self.ops.push(DbOp::DelBlock(*hash));
        }
    }
}

impl ClusterVisitor for Serializer {
    fn create_folder(&mut self, diff: &CreateFolder, cluster: &Cluster) -> Result<(), SyncError> {
        if let Some(folder) = cluster.folder(&diff.record.id) {
            self.ops.push(DbOp::PutFolder(
                folder.id.clone(),
                folder.to_record().encode_to_vec(),
            ));
        }
        self.put_folder_info(cluster, &diff.record.id, &cluster.local_id());
        Ok(())
    }

    fn share_folder(&mut self, diff: &ShareFolder, cluster: &Cluster) -> Result<(), SyncError> {
        self.put_folder_info(cluster, &diff.folder_id, &diff.peer);
        Ok(())
    }

    fn unshare_folder(&mut self, diff: &UnshareFolder, cluster: &Cluster) -> Result<(), SyncError> {
        self.ops.push(DbOp::DelFolderInfo {
            folder: diff.folder_id.clone(),
            device: diff.peer,
        });
        self.del_collected_blocks(cluster);
        Ok(())
    }

    fn update_peer(&mut self, diff: &UpdatePeer, cluster: &Cluster) -> Result<(), SyncError> {
        if let Some(id) = DeviceId::from_bytes(&diff.device) {
            if let Some(device) = cluster.device(&id) {
                self.ops
                    .push(DbOp::PutDevice(id, device.to_record().encode_to_vec()));
            }
        }
        Ok(())
    }

    fn remove_peer(&mut self, diff: &RemovePeer, cluster: &Cluster) -> Result<(), SyncError> {
        for folder in cluster.folders() {
            self.ops.push(DbOp::DelFolderInfo {
                folder: folder.id.clone(),
                device: diff.device,
            });
        }
        self.ops.push(DbOp::DelDevice(diff.device));
        self.del_collected_blocks(cluster);
        Ok(())
    }

    fn add_ignored_device(
        &mut self,
        diff: &AddIgnoredDevice,
        _cluster: &Cluster,
    ) -> Result<(), SyncError> {
        self.ops.push(DbOp::PutIgnoredDevice(
            diff.device,
            IgnoredDeviceRecord {
                name: diff.name.clone(),
            }
            .encode_to_vec(),
        ));
        Ok(())
    }

    fn add_ignored_folder(
        &mut self,
        diff: &AddIgnoredFolder,
        _cluster: &Cluster,
    ) -> Result<(), SyncError> {
        self.ops.push(DbOp::PutIgnoredFolder(
            diff.id.clone(),
            IgnoredFolderRecord {
                label: diff.label.clone(),
            }
            .encode_to_vec(),
        ));
        Ok(())
    }

    fn cluster_update(&mut self, diff: &ClusterUpdate, cluster: &Cluster) -> Result<(), SyncError> {
        for folder in &diff.config.folders {
            self.put_folder_info(cluster, &folder.id, &diff.device);
        }
        for unknown in cluster.unknown_folders() {
            self.ops.push(DbOp::PutUnknownFolder(
                unknown.id.clone(),
                unknown.device,
                UnknownFolderRecord {
                    id: unknown.id.clone(),
                    label: unknown.label.clone(),
                    device: unknown.device.as_bytes().to_vec(),
                    index_id: unknown.index_id,
                }
                .encode_to_vec(),
            ));
        }
        self.del_collected_blocks(cluster);
        Ok(())
    }

    fn update_folder(&mut self, diff: &UpdateFolder, cluster: &Cluster) -> Result<(), SyncError> {
        self.put_folder_info(cluster, &diff.folder_id, &diff.device);
        for wire in &diff.files {
            self.put_file(cluster, &diff.folder_id, &diff.device, &wire.name);
            self.put_file_blocks(cluster, &diff.folder_id, &diff.device, &wire.name);
        }
        self.del_collected_blocks(cluster);
        Ok(())
    }

    fn clone_file(&mut self, diff: &CloneFile, cluster: &Cluster) -> Result<(), SyncError> {
        let local = cluster.local_id();
        self.put_folder_info(cluster, &diff.folder_id, &local);
        self.put_file(cluster, &diff.folder_id, &local, &diff.name);
        Ok(())
    }

    fn local_update(&mut self, diff: &LocalUpdate, cluster: &Cluster) -> Result<(), SyncError> {
        let local = cluster.local_id();
        self.put_folder_info(cluster, &diff.folder_id, &local);
        self.put_file(cluster, &diff.folder_id, &local, &diff.file.name);
        self.put_file_blocks(cluster, &diff.folder_id, &local, &diff.file.name);
        self.del_collected_blocks(cluster);
        Ok(())
    }

    fn invalidate_file(
        &mut self,
        diff: &InvalidateFile,
        cluster: &Cluster,
    ) -> Result<(), SyncError> {
        let local = cluster.local_id();
        self.put_file(cluster, &diff.folder_id, &local, &diff.name);
        Ok(())
    }

    fn finish_file(&mut self, diff: &FinishFile, cluster: &Cluster) -> Result<(), SyncError> {
        let local = cluster.local_id();
        self.put_folder_info(cluster, &diff.folder_id, &local);
        self.put_file(cluster, &diff.folder_id, &local, &diff.name);
        Ok(())
    }

    // load_cluster came from storage; nothing to write back
}

//! Diffs originating from peer messages.

use spindrift_types::bep;
use spindrift_types::{DeviceId, SyncError};

use crate::block_info::FileKey;
use crate::cluster::{Cluster, UnknownFolder};
use crate::file_info::FileInfo;
use crate::version::Dominance;

/// Reconcile an incoming ClusterConfig from a peer.
///
/// Unknown folders are surfaced through the cluster's unknown-folder set;
/// folders not shared with the announcing devices are ignored; an index-id
/// change on a shared folder-info resets that device's view.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterUpdate {
    /// The announcing peer.
    pub device: DeviceId,
    /// Its ClusterConfig.
    pub config: bep::ClusterConfig,
}

impl ClusterUpdate {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let local_id = cluster.local_id();
        for folder in &self.config.folders {
            if cluster.ignored_folders().contains_key(&folder.id) {
                continue;
            }
            if cluster.folder(&folder.id).is_none() {
                let index_id = folder
                    .devices
                    .iter()
                    .find(|d| d.id == self.device.as_bytes())
                    .map(|d| d.index_id)
                    .unwrap_or(0);
                cluster.add_unknown_folder(UnknownFolder {
                    id: folder.id.clone(),
                    label: folder.label.clone(),
                    device: self.device,
                    index_id,
                });
                continue;
            }
            for entry in &folder.devices {
                let Some(device_id) = DeviceId::from_bytes(&entry.id) else {
                    return Err(SyncError::Decode("device id is malformed".into()));
                };
                if device_id == local_id {
                    // our own view; re-index decisions are made by the peer
                    // actor before this diff is produced
                    continue;
                }
                if !cluster.shared_with(&folder.id, &device_id) {
                    continue;
                }
                let reset_files = {
                    let info = cluster
                        .folder_info_mut(&folder.id, &device_id)
                        .expect("shared_with checked above");
                    if info.index_id != entry.index_id {
                        info.index_id = entry.index_id;
                        info.max_sequence = 0;
                        let names: Vec<String> =
                            info.files().map(|f| f.name.clone()).collect();
                        let mut dropped = Vec::with_capacity(names.len());
                        for name in names {
                            if let Some(file) = info.remove(&name) {
                                dropped.push(file);
                            }
                        }
                        dropped
                    } else {
                        Vec::new()
                    }
                };
                for file in reset_files {
                    let key = FileKey {
                        folder_id: folder.id.clone(),
                        device_id,
                        name: file.name.clone(),
                    };
                    cluster.unlink_file_blocks(&key, &file.blocks);
                }
            }
        }
        Ok(())
    }
}

/// Merge the files of a peer's Index or IndexUpdate into its folder-info.
///
/// Entries are matched by name and reconciled by vector-clock dominance,
/// with the sequence number as a tiebreak for histories that compare equal.
/// Blocks referenced by accepted versions enter the global block map;
/// blocks left unreferenced are garbage collected into the deleted set.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateFolder {
    /// The device whose view is being updated.
    pub device: DeviceId,
    /// The folder.
    pub folder_id: String,
    /// Incoming file entries.
    pub files: Vec<bep::FileInfo>,
}

impl UpdateFolder {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        if cluster.folder(&self.folder_id).is_none() {
            return Err(SyncError::UnknownFolder(self.folder_id.clone()));
        }
        if !cluster.shared_with(&self.folder_id, &self.device) {
            return Err(SyncError::Protocol(format!(
                "index for folder '{}' not shared with {}",
                self.folder_id,
                self.device.short()
            )));
        }
        let local_id = cluster.local_id();
        for wire in &self.files {
            let incoming = FileInfo::from_wire(wire)?;
            let key = FileKey {
                folder_id: self.folder_id.clone(),
                device_id: self.device,
                name: incoming.name.clone(),
            };

            let replaced = {
                let info = cluster
                    .folder_info_mut(&self.folder_id, &self.device)
                    .expect("shared_with checked above");
                let accept = match info.file(&incoming.name) {
                    None => true,
                    Some(existing) => match incoming.version.compare(&existing.version) {
                        Dominance::Greater | Dominance::Concurrent => true,
                        Dominance::Lesser => false,
                        Dominance::Equal => incoming.sequence > existing.sequence,
                    },
                };
                if !accept {
                    continue;
                }
                let previous = info.remove(&incoming.name);
                info.add(incoming.clone());
                previous
            };

            if let Some(prev) = &replaced {
                cluster.unlink_file_blocks(&key, &prev.blocks);
            }
            for (i, wire_block) in wire.blocks.iter().enumerate() {
                if let Some(hash) = incoming.blocks.get(i) {
                    cluster.insert_block(
                        *hash,
                        wire_block.size.max(0) as u32,
                        wire_block.weak_hash,
                    );
                    if let Some(block) = cluster.block_mut(hash) {
                        block.link(key.clone(), i as u32, false);
                    }
                }
            }

            // a concurrent local edit of the same name is a conflict: keep
            // both identities, mark ours invalid
            if self.device != local_id {
                let conflict = cluster
                    .file(&self.folder_id, &local_id, &incoming.name)
                    .map(|local| {
                        !local.deleted
                            && local.version.compare(&incoming.version) == Dominance::Concurrent
                    })
                    .unwrap_or(false);
                if conflict {
                    if let Some(info) = cluster.folder_info_mut(&self.folder_id, &local_id) {
                        if let Some(local) = info.file_mut(&incoming.name) {
                            local.invalid = true;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

//! The cluster: every device, folder, folder-info, file and block this
//! engine knows about. Mutated only through diffs.

use std::collections::{HashMap, HashSet};

use spindrift_types::bep;
use spindrift_types::{DeviceId, SyncError};

use crate::block_info::{BlockHash, BlockInfo, FileKey};
use crate::device::Device;
use crate::diff::{BlockDiff, ClusterDiff};
use crate::file_info::FileInfo;
use crate::folder::Folder;
use crate::folder_info::FolderInfo;

/// A folder a peer advertised that is not yet accepted locally.
#[derive(Debug, Clone, PartialEq)]
pub struct UnknownFolder {
    /// Folder id from the announcement.
    pub id: String,
    /// Label from the announcement.
    pub label: String,
    /// The announcing device.
    pub device: DeviceId,
    /// Index id the announcer assigned for itself.
    pub index_id: u64,
}

/// The in-memory model. Accessed only from the primary strand; observers
/// receive immutable diffs.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    local_id: DeviceId,
    devices: HashMap<DeviceId, Device>,
    folders: HashMap<String, Folder>,
    folder_infos: HashMap<String, HashMap<DeviceId, FolderInfo>>,
    blocks: HashMap<BlockHash, BlockInfo>,
    deleted_blocks: HashSet<BlockHash>,
    unknown_folders: Vec<UnknownFolder>,
    ignored_devices: HashMap<DeviceId, String>,
    ignored_folders: HashMap<String, String>,
    tainted: bool,
}

impl Cluster {
    /// A cluster containing only the local device.
    pub fn new(local: Device) -> Self {
        let local_id = local.id;
        let mut devices = HashMap::new();
        devices.insert(local_id, local);
        Self {
            local_id,
            devices,
            folders: HashMap::new(),
            folder_infos: HashMap::new(),
            blocks: HashMap::new(),
            deleted_blocks: HashSet::new(),
            unknown_folders: Vec::new(),
            ignored_devices: HashMap::new(),
            ignored_folders: HashMap::new(),
            tainted: false,
        }
    }

    /// Apply a cluster diff at the single mutation point. A fatal failure
    /// taints the cluster.
    pub fn apply(&mut self, diff: &ClusterDiff) -> Result<(), SyncError> {
        if self.tainted {
            return Err(SyncError::Db("cluster is tainted".into()));
        }
        match diff.apply_to(self) {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.is_fatal() {
                    self.tainted = true;
                }
                Err(e)
            }
        }
    }

    /// Apply a block diff.
    pub fn apply_block(&mut self, diff: &BlockDiff) -> Result<(), SyncError> {
        if self.tainted {
            return Err(SyncError::Db("cluster is tainted".into()));
        }
        diff.apply_to(self)
    }

    /// One-way consistency flag; observers stop writing once set.
    pub fn is_tainted(&self) -> bool {
        self.tainted
    }

    /// Mark the cluster as inconsistent.
    pub fn taint(&mut self) {
        self.tainted = true;
    }

    // --- devices ---

    /// The local device id.
    pub fn local_id(&self) -> DeviceId {
        self.local_id
    }

    /// The local device entry.
    pub fn local_device(&self) -> &Device {
        &self.devices[&self.local_id]
    }

    /// Look up a device.
    pub fn device(&self, id: &DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    /// Mutable device lookup.
    pub fn device_mut(&mut self, id: &DeviceId) -> Option<&mut Device> {
        self.devices.get_mut(id)
    }

    /// Insert or replace a device.
    pub fn add_device(&mut self, device: Device) {
        self.devices.insert(device.id, device);
    }

    /// Remove a device; the local device is never removed.
    pub fn remove_device(&mut self, id: &DeviceId) -> Option<Device> {
        if *id == self.local_id {
            return None;
        }
        self.devices.remove(id)
    }

    /// All known devices.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    // --- folders ---

    /// Look up a folder by id.
    pub fn folder(&self, id: &str) -> Option<&Folder> {
        self.folders.get(id)
    }

    /// Insert or replace a folder.
    pub fn add_folder(&mut self, folder: Folder) {
        self.folders.insert(folder.id.clone(), folder);
    }

    /// All folders.
    pub fn folders(&self) -> impl Iterator<Item = &Folder> {
        self.folders.values()
    }

    // --- folder infos ---

    /// The (folder, device) record, if the folder is shared with the device.
    pub fn folder_info(&self, folder_id: &str, device: &DeviceId) -> Option<&FolderInfo> {
        self.folder_infos.get(folder_id)?.get(device)
    }

    /// Mutable (folder, device) lookup.
    pub fn folder_info_mut(
        &mut self,
        folder_id: &str,
        device: &DeviceId,
    ) -> Option<&mut FolderInfo> {
        self.folder_infos.get_mut(folder_id)?.get_mut(device)
    }

    /// The local device's view of a folder.
    pub fn local_folder_info(&self, folder_id: &str) -> Option<&FolderInfo> {
        self.folder_info(folder_id, &self.local_id)
    }

    /// Insert a folder-info; invariant 6 makes the local one exist for every
    /// folder.
    pub fn add_folder_info(&mut self, info: FolderInfo) {
        self.folder_infos
            .entry(info.folder_id.clone())
            .or_default()
            .insert(info.device_id, info);
    }

    /// Remove a folder-info on unshare, returning it for block cleanup.
    pub fn remove_folder_info(&mut self, folder_id: &str, device: &DeviceId) -> Option<FolderInfo> {
        self.folder_infos.get_mut(folder_id)?.remove(device)
    }

    /// Devices a folder is shared with.
    pub fn folder_devices(&self, folder_id: &str) -> impl Iterator<Item = &DeviceId> {
        self.folder_infos.get(folder_id).into_iter().flat_map(|m| m.keys())
    }

    /// Whether a folder is shared with a device.
    pub fn shared_with(&self, folder_id: &str, device: &DeviceId) -> bool {
        self.folder_info(folder_id, device).is_some()
    }

    /// Folders shared with the given peer.
    pub fn folders_shared_with(&self, device: &DeviceId) -> Vec<&Folder> {
        let mut out: Vec<&Folder> = self
            .folders
            .values()
            .filter(|f| self.shared_with(&f.id, device))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// A file entry in a device's view of a folder.
    pub fn file(&self, folder_id: &str, device: &DeviceId, name: &str) -> Option<&FileInfo> {
        self.folder_info(folder_id, device)?.file(name)
    }

    // --- blocks ---

    /// Look up a block by hash.
    pub fn block(&self, hash: &BlockHash) -> Option<&BlockInfo> {
        self.blocks.get(hash)
    }

    /// Mutable block lookup.
    pub fn block_mut(&mut self, hash: &BlockHash) -> Option<&mut BlockInfo> {
        self.blocks.get_mut(hash)
    }

    /// The active block map.
    pub fn blocks(&self) -> &HashMap<BlockHash, BlockInfo> {
        &self.blocks
    }

    /// Hashes garbage-collected since load.
    pub fn deleted_blocks(&self) -> &HashSet<BlockHash> {
        &self.deleted_blocks
    }

    /// Insert a block if absent, reviving it from the deleted set if needed.
    pub fn insert_block(&mut self, hash: BlockHash, size: u32, weak_hash: u32) {
        self.deleted_blocks.remove(&hash);
        self.blocks
            .entry(hash)
            .or_insert_with(|| BlockInfo::new(hash, size, weak_hash));
    }

    /// Link every block of a file entry, inserting missing blocks using the
    /// file's derived block lengths.
    pub fn link_file_blocks(&mut self, file_key: &FileKey, file: &FileInfo) {
        for (i, hash) in file.blocks.iter().enumerate() {
            let index = i as u32;
            self.insert_block(*hash, file.block_len(index), 0);
            if let Some(block) = self.blocks.get_mut(hash) {
                block.link(file_key.clone(), index, file.is_local(index));
            }
        }
    }

    /// Unlink a file's blocks; blocks left without references are removed
    /// from the active map and recorded in the deleted set.
    pub fn unlink_file_blocks(&mut self, file_key: &FileKey, hashes: &[BlockHash]) {
        for hash in hashes {
            if let Some(block) = self.blocks.get_mut(hash) {
                block.unlink(file_key);
                if block.ref_count() == 0 {
                    self.blocks.remove(hash);
                    self.deleted_blocks.insert(*hash);
                }
            }
        }
    }

    /// Record that a block of a local file landed in local storage, on both
    /// the file entry and the block's back-link.
    pub fn mark_block_local(
        &mut self,
        folder_id: &str,
        device: &DeviceId,
        name: &str,
        index: u32,
    ) -> Result<(), SyncError> {
        let device = *device;
        let hash = {
            let info = self
                .folder_info_mut(folder_id, &device)
                .ok_or_else(|| SyncError::UnknownFolder(folder_id.to_string()))?;
            let file = info.file_mut(name).ok_or_else(|| {
                SyncError::Protocol(format!("no file '{name}' in folder '{folder_id}'"))
            })?;
            file.mark_local(index);
            file.blocks.get(index as usize).copied()
        };
        if let Some(hash) = hash {
            let key = FileKey {
                folder_id: folder_id.to_string(),
                device_id: device,
                name: name.to_string(),
            };
            if let Some(block) = self.blocks.get_mut(&hash) {
                block.mark_local(&key, index);
            }
        }
        Ok(())
    }

    // --- unknown / ignored ---

    /// Folder offers not yet accepted locally.
    pub fn unknown_folders(&self) -> &[UnknownFolder] {
        &self.unknown_folders
    }

    /// Record a folder offer, deduplicated by (id, device).
    pub fn add_unknown_folder(&mut self, unknown: UnknownFolder) {
        let exists = self
            .unknown_folders
            .iter()
            .any(|u| u.id == unknown.id && u.device == unknown.device);
        if !exists {
            self.unknown_folders.push(unknown);
        }
    }

    /// Devices whose connections are rejected.
    pub fn ignored_devices(&self) -> &HashMap<DeviceId, String> {
        &self.ignored_devices
    }

    /// Ignore a device.
    pub fn add_ignored_device(&mut self, id: DeviceId, name: String) {
        self.ignored_devices.insert(id, name);
    }

    /// Folder ids whose offers are declined.
    pub fn ignored_folders(&self) -> &HashMap<String, String> {
        &self.ignored_folders
    }

    /// Decline a folder id.
    pub fn add_ignored_folder(&mut self, id: String, label: String) {
        self.ignored_folders.insert(id, label);
    }

    // --- wire helpers ---

    /// Wire form of a file entry, with weak hashes from the block map.
    pub fn file_to_wire(
        &self,
        folder_id: &str,
        device: &DeviceId,
        name: &str,
    ) -> Option<bep::FileInfo> {
        let file = self.file(folder_id, device, name)?;
        Some(file.to_wire(|hash| self.blocks.get(hash).map(|b| b.weak_hash).unwrap_or(0)))
    }

    /// Full local index of a folder, ordered by name, for an Index message.
    pub fn index_snapshot(&self, folder_id: &str) -> Vec<bep::FileInfo> {
        let Some(info) = self.local_folder_info(folder_id) else {
            return Vec::new();
        };
        let mut names: Vec<&str> = info.files().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        names
            .into_iter()
            .filter_map(|n| self.file_to_wire(folder_id, &self.local_id, n))
            .collect()
    }

    /// The ClusterConfig announcing to `peer` every folder shared with it.
    pub fn cluster_config_for(&self, peer: &DeviceId) -> bep::ClusterConfig {
        let mut folders = Vec::new();
        for folder in self.folders_shared_with(peer) {
            let mut devices = Vec::new();
            let mut ids: Vec<&DeviceId> = self.folder_devices(&folder.id).collect();
            ids.sort();
            for id in ids {
                let Some(info) = self.folder_info(&folder.id, id) else {
                    continue;
                };
                let known = self.devices.get(id);
                devices.push(bep::Device {
                    id: id.as_bytes().to_vec(),
                    name: known.map(|d| d.name.clone()).unwrap_or_default(),
                    addresses: known.map(|d| d.addresses.clone()).unwrap_or_default(),
                    compression: known.map(|d| d.compression as i32).unwrap_or_default(),
                    cert_name: known.map(|d| d.cert_name.clone()).unwrap_or_default(),
                    max_sequence: info.max_sequence as i64,
                    introducer: known.map(|d| d.introducer).unwrap_or_default(),
                    index_id: info.index_id,
                    skip_introduction_removals: false,
                });
            }
            folders.push(bep::Folder {
                id: folder.id.clone(),
                label: folder.label.clone(),
                read_only: !folder.pull_capable(),
                ignore_permissions: folder.ignore_permissions,
                ignore_delete: false,
                disable_temp_indexes: false,
                paused: false,
                devices,
            });
        }
        bep::ClusterConfig { folders }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_info::FileKind;

    fn local() -> Device {
        Device::new(DeviceId::from_sha256([1; 32]), "local")
    }

    fn peer_id() -> DeviceId {
        DeviceId::from_sha256([2; 32])
    }

    fn file_key(name: &str, device: DeviceId) -> FileKey {
        FileKey {
            folder_id: "f".into(),
            device_id: device,
            name: name.into(),
        }
    }

    #[test]
    fn local_device_is_always_present() {
        let mut cluster = Cluster::new(local());
        assert_eq!(cluster.local_device().name, "local");
        let id = cluster.local_id();
        assert!(cluster.remove_device(&id).is_none());
        assert!(cluster.device(&id).is_some());
    }

    #[test]
    fn block_gc_moves_hashes_to_deleted_set() {
        let mut cluster = Cluster::new(local());
        let mut file = FileInfo::new("a", FileKind::File);
        file.size = 5;
        file.block_size = 5;
        file.set_blocks(vec![[9; 32]]);
        let key = file_key("a", cluster.local_id());
        cluster.link_file_blocks(&key, &file);
        assert_eq!(cluster.blocks().len(), 1);

        cluster.unlink_file_blocks(&key, &file.blocks);
        assert_eq!(cluster.blocks().len(), 0);
        assert!(cluster.deleted_blocks().contains(&[9; 32]));

        // reinsertion revives the hash
        cluster.insert_block([9; 32], 5, 0);
        assert!(!cluster.deleted_blocks().contains(&[9; 32]));
    }

    #[test]
    fn tainted_cluster_rejects_diffs() {
        let mut cluster = Cluster::new(local());
        cluster.taint();
        let diff = ClusterDiff::add_ignored_folder("x", "label");
        assert!(matches!(cluster.apply(&diff), Err(SyncError::Db(_))));
    }

    #[test]
    fn unknown_folders_deduplicate() {
        let mut cluster = Cluster::new(local());
        for _ in 0..2 {
            cluster.add_unknown_folder(UnknownFolder {
                id: "f".into(),
                label: "l".into(),
                device: peer_id(),
                index_id: 7,
            });
        }
        assert_eq!(cluster.unknown_folders().len(), 1);
    }
}

//! Block-granularity diffs, consumed by the file actor.

use spindrift_types::SyncError;

use crate::cluster::Cluster;

/// A pulled and digest-verified block to be written into the target file's
/// temporary copy at `block_index * block_size`.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendBlock {
    /// The folder.
    pub folder_id: String,
    /// Folder-relative name of the target file.
    pub name: String,
    /// Index of the block within the file.
    pub block_index: u32,
    /// Verified block bytes.
    pub data: Vec<u8>,
}

impl AppendBlock {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let local = cluster.local_id();
        cluster.mark_block_local(&self.folder_id, &local, &self.name, self.block_index)
    }
}

/// Copy a block that already exists in some local file into the target
/// file's temporary copy; no network traffic involved.
#[derive(Debug, Clone, PartialEq)]
pub struct CloneBlock {
    /// The target folder.
    pub folder_id: String,
    /// Folder-relative name of the target file.
    pub name: String,
    /// Index of the block within the target file.
    pub block_index: u32,
    /// Folder containing the source copy.
    pub source_folder_id: String,
    /// Folder-relative name of the source file.
    pub source_name: String,
    /// Index of the block within the source file.
    pub source_block_index: u32,
    /// Block length in bytes.
    pub size: u32,
}

impl CloneBlock {
    pub(crate) fn apply(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        let local = cluster.local_id();
        cluster.mark_block_local(&self.folder_id, &local, &self.name, self.block_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::diff::{BlockDiff, ClusterDiff};
    use spindrift_types::records::FolderRecord;
    use spindrift_types::{bep, DeviceId};

    fn cluster_with_file() -> Cluster {
        let mut cluster = Cluster::new(Device::new(DeviceId::from_sha256([1; 32]), "local"));
        cluster
            .apply(&ClusterDiff::create_folder(FolderRecord {
                id: "f".into(),
                label: "f".into(),
                path: "/tmp/f".into(),
                ..Default::default()
            }))
            .unwrap();
        // a local two-block entry, blocks not yet on disk
        let peer = DeviceId::from_sha256([2; 32]);
        cluster.add_device(Device::new(peer, "peer"));
        cluster
            .apply(&ClusterDiff::share_folder(peer, "f"))
            .unwrap();
        cluster
            .apply(&ClusterDiff::update_folder(
                peer,
                "f",
                vec![bep::FileInfo {
                    name: "a.bin".into(),
                    size: 10,
                    block_size: 5,
                    sequence: 1,
                    blocks: vec![
                        bep::BlockInfo {
                            offset: 0,
                            size: 5,
                            hash: vec![1; 32],
                            weak_hash: 0,
                        },
                        bep::BlockInfo {
                            offset: 5,
                            size: 5,
                            hash: vec![2; 32],
                            weak_hash: 0,
                        },
                    ],
                    ..Default::default()
                }],
            ))
            .unwrap();
        cluster
            .apply(&ClusterDiff::clone_file("f", peer, "a.bin"))
            .unwrap();
        cluster
    }

    #[test]
    fn append_marks_block_available() {
        let mut cluster = cluster_with_file();
        let local = cluster.local_id();
        cluster
            .apply_block(&BlockDiff::Append(AppendBlock {
                folder_id: "f".into(),
                name: "a.bin".into(),
                block_index: 0,
                data: vec![0; 5],
            }))
            .unwrap();
        let file = cluster.file("f", &local, "a.bin").unwrap();
        assert!(file.is_local(0));
        assert!(!file.is_local(1));
        assert!(file.is_incomplete());

        // the block map now knows a local source for hash [1; 32]
        let source = cluster.block(&[1; 32]).unwrap().local_source().unwrap();
        assert_eq!(source.file.device_id, local);
        assert_eq!(source.index, 0);
    }

    #[test]
    fn clone_marks_block_available() {
        let mut cluster = cluster_with_file();
        let local = cluster.local_id();
        cluster
            .apply_block(&BlockDiff::Clone(CloneBlock {
                folder_id: "f".into(),
                name: "a.bin".into(),
                block_index: 1,
                source_folder_id: "f".into(),
                source_name: "other.bin".into(),
                source_block_index: 0,
                size: 5,
            }))
            .unwrap();
        let file = cluster.file("f", &local, "a.bin").unwrap();
        assert!(file.is_local(1));
    }

    #[test]
    fn append_to_unknown_file_fails() {
        let mut cluster = cluster_with_file();
        let err = cluster
            .apply_block(&BlockDiff::Append(AppendBlock {
                folder_id: "f".into(),
                name: "missing.bin".into(),
                block_index: 0,
                data: vec![],
            }))
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}

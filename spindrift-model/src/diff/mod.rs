//! The diff layer: immutable change descriptions, the sole means of mutating
//! the cluster and the sole source of durable change events.
//!
//! Each diff exposes `apply_to` (the mutation, dispatched through
//! [`crate::Cluster::apply`]) and `visit` (observer fan-out). Observers
//! implement [`ClusterVisitor`] / [`BlockVisitor`]; every method defaults to
//! a no-op so an observer only writes the handlers it cares about.

mod block;
mod load;
mod modify;
mod peer;

pub use block::{AppendBlock, CloneBlock};
pub use load::{LoadCluster, LoadPart, RawKv};
pub use modify::{
    AddIgnoredDevice, AddIgnoredFolder, CloneFile, CreateFolder, FinishFile, InvalidateFile,
    LocalUpdate, RemovePeer, ShareFolder, UnshareFolder, UpdatePeer,
};
pub use peer::{ClusterUpdate, UpdateFolder};

use spindrift_types::bep;
use spindrift_types::records::{DeviceRecord, FolderRecord};
use spindrift_types::{DeviceId, SyncError};

use crate::cluster::Cluster;

/// A structural or semantic change to the cluster model.
#[derive(Debug, Clone, PartialEq)]
pub enum ClusterDiff {
    /// Create a folder locally.
    CreateFolder(CreateFolder),
    /// Share an existing folder with a peer.
    ShareFolder(ShareFolder),
    /// Stop sharing a folder with a peer.
    UnshareFolder(UnshareFolder),
    /// Insert or update a peer device.
    UpdatePeer(UpdatePeer),
    /// Forget a peer device and its folder-infos.
    RemovePeer(RemovePeer),
    /// Reject future connections from a device.
    AddIgnoredDevice(AddIgnoredDevice),
    /// Decline offers of a folder id.
    AddIgnoredFolder(AddIgnoredFolder),
    /// Reconcile a peer's ClusterConfig.
    ClusterUpdate(ClusterUpdate),
    /// Merge a peer's Index or IndexUpdate.
    UpdateFolder(UpdateFolder),
    /// Copy a peer's file entry into the local view before pulling it.
    CloneFile(CloneFile),
    /// Scanner-observed local change, tombstones included.
    LocalUpdate(LocalUpdate),
    /// Exclude a local file from synchronization.
    InvalidateFile(InvalidateFile),
    /// A pulled file is fully on disk; assign its local sequence.
    FinishFile(FinishFile),
    /// Aggregate reconstruction of the cluster from storage.
    LoadCluster(LoadCluster),
}

impl ClusterDiff {
    pub(crate) fn apply_to(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        match self {
            Self::CreateFolder(d) => d.apply(cluster),
            Self::ShareFolder(d) => d.apply(cluster),
            Self::UnshareFolder(d) => d.apply(cluster),
            Self::UpdatePeer(d) => d.apply(cluster),
            Self::RemovePeer(d) => d.apply(cluster),
            Self::AddIgnoredDevice(d) => d.apply(cluster),
            Self::AddIgnoredFolder(d) => d.apply(cluster),
            Self::ClusterUpdate(d) => d.apply(cluster),
            Self::UpdateFolder(d) => d.apply(cluster),
            Self::CloneFile(d) => d.apply(cluster),
            Self::LocalUpdate(d) => d.apply(cluster),
            Self::InvalidateFile(d) => d.apply(cluster),
            Self::FinishFile(d) => d.apply(cluster),
            Self::LoadCluster(d) => d.apply(cluster),
        }
    }

    /// Dispatch to the matching visitor method with the post-apply cluster.
    pub fn visit<V: ClusterVisitor + ?Sized>(
        &self,
        visitor: &mut V,
        cluster: &Cluster,
    ) -> Result<(), SyncError> {
        match self {
            Self::CreateFolder(d) => visitor.create_folder(d, cluster),
            Self::ShareFolder(d) => visitor.share_folder(d, cluster),
            Self::UnshareFolder(d) => visitor.unshare_folder(d, cluster),
            Self::UpdatePeer(d) => visitor.update_peer(d, cluster),
            Self::RemovePeer(d) => visitor.remove_peer(d, cluster),
            Self::AddIgnoredDevice(d) => visitor.add_ignored_device(d, cluster),
            Self::AddIgnoredFolder(d) => visitor.add_ignored_folder(d, cluster),
            Self::ClusterUpdate(d) => visitor.cluster_update(d, cluster),
            Self::UpdateFolder(d) => visitor.update_folder(d, cluster),
            Self::CloneFile(d) => visitor.clone_file(d, cluster),
            Self::LocalUpdate(d) => visitor.local_update(d, cluster),
            Self::InvalidateFile(d) => visitor.invalidate_file(d, cluster),
            Self::FinishFile(d) => visitor.finish_file(d, cluster),
            Self::LoadCluster(d) => visitor.load_cluster(d, cluster),
        }
    }

    /// Whether the persistence layer must commit its open batch after this
    /// diff, rather than waiting for the uncommitted threshold.
    pub fn force_commit(&self) -> bool {
        matches!(
            self,
            Self::CreateFolder(_)
                | Self::ShareFolder(_)
                | Self::UnshareFolder(_)
                | Self::UpdatePeer(_)
                | Self::RemovePeer(_)
                | Self::AddIgnoredDevice(_)
                | Self::AddIgnoredFolder(_)
                | Self::ClusterUpdate(_)
        )
    }

    // --- convenience constructors ---

    /// Create a folder from its record; a fresh index id is generated.
    pub fn create_folder(record: FolderRecord) -> Self {
        Self::CreateFolder(CreateFolder::new(record))
    }

    /// Share a folder with a peer under a fresh index id.
    pub fn share_folder(peer: DeviceId, folder_id: impl Into<String>) -> Self {
        Self::ShareFolder(ShareFolder::new(peer, folder_id))
    }

    /// Stop sharing a folder with a peer.
    pub fn unshare_folder(peer: DeviceId, folder_id: impl Into<String>) -> Self {
        Self::UnshareFolder(UnshareFolder {
            peer,
            folder_id: folder_id.into(),
        })
    }

    /// Insert or update a peer device from its raw digest and record.
    pub fn update_peer(device: Vec<u8>, record: DeviceRecord) -> Self {
        Self::UpdatePeer(UpdatePeer { device, record })
    }

    /// Decline offers of a folder id.
    pub fn add_ignored_folder(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self::AddIgnoredFolder(AddIgnoredFolder {
            id: id.into(),
            label: label.into(),
        })
    }

    /// Reconcile a peer's ClusterConfig.
    pub fn cluster_update(device: DeviceId, config: bep::ClusterConfig) -> Self {
        Self::ClusterUpdate(ClusterUpdate { device, config })
    }

    /// Merge files from a peer's Index or IndexUpdate.
    pub fn update_folder(
        device: DeviceId,
        folder_id: impl Into<String>,
        files: Vec<bep::FileInfo>,
    ) -> Self {
        Self::UpdateFolder(UpdateFolder {
            device,
            folder_id: folder_id.into(),
            files,
        })
    }

    /// Copy a peer's file entry into the local view.
    pub fn clone_file(
        folder_id: impl Into<String>,
        source: DeviceId,
        name: impl Into<String>,
    ) -> Self {
        Self::CloneFile(CloneFile {
            folder_id: folder_id.into(),
            source,
            name: name.into(),
        })
    }

    /// Record a scanner-observed local change.
    pub fn local_update(folder_id: impl Into<String>, file: bep::FileInfo) -> Self {
        Self::LocalUpdate(LocalUpdate {
            folder_id: folder_id.into(),
            file,
        })
    }

    /// Exclude a tainted local file from synchronization.
    pub fn invalidate_file(folder_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::InvalidateFile(InvalidateFile {
            folder_id: folder_id.into(),
            name: name.into(),
        })
    }

    /// Mark a pulled file finished.
    pub fn finish_file(folder_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::FinishFile(FinishFile {
            folder_id: folder_id.into(),
            name: name.into(),
        })
    }
}

/// Either family of diff, as submitted to the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyDiff {
    /// A cluster-level change.
    Cluster(ClusterDiff),
    /// A block-level change.
    Block(BlockDiff),
}

impl From<ClusterDiff> for AnyDiff {
    fn from(diff: ClusterDiff) -> Self {
        Self::Cluster(diff)
    }
}

impl From<BlockDiff> for AnyDiff {
    fn from(diff: BlockDiff) -> Self {
        Self::Block(diff)
    }
}

/// A diff on its way to the coordinator, with an optional apply
/// acknowledgement for senders that must not proceed before the mutation
/// lands (the controller's clone-then-iterate sequence).
#[derive(Debug)]
pub struct DiffMsg {
    /// The change to apply and fan out.
    pub diff: AnyDiff,
    /// Signalled with the apply result.
    pub ack: Option<tokio::sync::oneshot::Sender<Result<(), SyncError>>>,
}

impl DiffMsg {
    /// A fire-and-forget submission.
    pub fn publish(diff: impl Into<AnyDiff>) -> Self {
        Self {
            diff: diff.into(),
            ack: None,
        }
    }
}

/// A block-granularity change.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockDiff {
    /// A pulled block to be written into a local temp file.
    Append(AppendBlock),
    /// Copy an already-local block into a temp file.
    Clone(CloneBlock),
}

impl BlockDiff {
    pub(crate) fn apply_to(&self, cluster: &mut Cluster) -> Result<(), SyncError> {
        match self {
            Self::Append(d) => d.apply(cluster),
            Self::Clone(d) => d.apply(cluster),
        }
    }

    /// Dispatch to the matching visitor method.
    pub fn visit<V: BlockVisitor + ?Sized>(
        &self,
        visitor: &mut V,
        cluster: &Cluster,
    ) -> Result<(), SyncError> {
        match self {
            Self::Append(d) => visitor.append_block(d, cluster),
            Self::Clone(d) => visitor.clone_block(d, cluster),
        }
    }
}

/// Observer of cluster diffs. Default methods are no-ops.
pub trait ClusterVisitor {
    /// A folder was created locally.
    fn create_folder(&mut self, _diff: &CreateFolder, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// A folder was shared with a peer.
    fn share_folder(&mut self, _diff: &ShareFolder, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// A folder was unshared from a peer.
    fn unshare_folder(
        &mut self,
        _diff: &UnshareFolder,
        _cluster: &Cluster,
    ) -> Result<(), SyncError> {
        Ok(())
    }
    /// A peer device was inserted or updated.
    fn update_peer(&mut self, _diff: &UpdatePeer, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// A peer device was removed.
    fn remove_peer(&mut self, _diff: &RemovePeer, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// A device was ignored.
    fn add_ignored_device(
        &mut self,
        _diff: &AddIgnoredDevice,
        _cluster: &Cluster,
    ) -> Result<(), SyncError> {
        Ok(())
    }
    /// A folder offer was declined.
    fn add_ignored_folder(
        &mut self,
        _diff: &AddIgnoredFolder,
        _cluster: &Cluster,
    ) -> Result<(), SyncError> {
        Ok(())
    }
    /// A peer's ClusterConfig was reconciled.
    fn cluster_update(
        &mut self,
        _diff: &ClusterUpdate,
        _cluster: &Cluster,
    ) -> Result<(), SyncError> {
        Ok(())
    }
    /// A peer's index files were merged.
    fn update_folder(&mut self, _diff: &UpdateFolder, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// A peer file entry was cloned into the local view.
    fn clone_file(&mut self, _diff: &CloneFile, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// The scanner observed a local change.
    fn local_update(&mut self, _diff: &LocalUpdate, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// A local file was excluded from synchronization.
    fn invalidate_file(
        &mut self,
        _diff: &InvalidateFile,
        _cluster: &Cluster,
    ) -> Result<(), SyncError> {
        Ok(())
    }
    /// A pulled file was finished.
    fn finish_file(&mut self, _diff: &FinishFile, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// The cluster was reconstructed from storage.
    fn load_cluster(&mut self, _diff: &LoadCluster, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
}

/// Observer of block diffs. Default methods are no-ops.
pub trait BlockVisitor {
    /// A pulled block must be written to the file's temp copy.
    fn append_block(&mut self, _diff: &AppendBlock, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
    /// A local block must be copied into the file's temp copy.
    fn clone_block(&mut self, _diff: &CloneBlock, _cluster: &Cluster) -> Result<(), SyncError> {
        Ok(())
    }
}

//! The file actor: sole writer to folder filesystem paths.
//!
//! Applies block diffs to temporary files through the mapping cache, renames
//! finished pulls into place, executes the controller's immediate operations
//! (deletes, directories, symlinks, empty files) and serves block reads for
//! inbound peer requests.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use spindrift_model::diff::{
    AnyDiff, AppendBlock, BlockDiff, CloneBlock, CloneFile, ClusterDiff, DiffMsg,
};
use spindrift_model::{FileKind, SharedCluster};
use spindrift_types::SyncError;

use crate::mmap::FileCache;

/// A filesystem operation that needs no block transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum ImmediateOp {
    /// Remove the path (file or directory tree) and any temp copy.
    Delete,
    /// Create an empty file.
    CreateEmpty,
    /// Create a directory.
    CreateDir,
    /// Create a symlink.
    CreateSymlink {
        /// The link target.
        target: String,
    },
}

/// Result of a block read on behalf of a peer request.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// The requested bytes.
    Data(Vec<u8>),
    /// No such file in the folder.
    NoSuchFile,
    /// The file exists but cannot satisfy the request.
    InvalidFile,
}

/// Requests served by the file actor besides diff fan-out.
#[derive(Debug)]
pub enum FsRequest {
    /// Apply an immediate operation for a synced entry.
    Immediate {
        /// The folder.
        folder_id: String,
        /// Folder-relative name.
        name: String,
        /// The operation.
        op: ImmediateOp,
        /// Completion signal.
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
    /// Read bytes for an inbound peer request.
    ReadBlock {
        /// The folder.
        folder_id: String,
        /// Folder-relative name.
        name: String,
        /// Byte offset.
        offset: u64,
        /// Length in bytes.
        size: u32,
        /// Read the temporary copy instead of the final file.
        from_temporary: bool,
        /// Receives the outcome.
        reply: oneshot::Sender<ReadOutcome>,
    },
}

/// Notifications the supervisor and controllers listen to.
#[derive(Debug)]
pub enum FsEvent {
    /// A pulled file was flushed and renamed into place.
    FileFinished {
        /// The folder.
        folder_id: String,
        /// Folder-relative name.
        name: String,
    },
    /// An I/O failure aborted work on a file.
    FileFailed {
        /// The folder.
        folder_id: String,
        /// Folder-relative name.
        name: String,
        /// What went wrong.
        error: SyncError,
    },
}

/// Cloneable handle for immediate operations and block reads.
#[derive(Debug, Clone)]
pub struct FsHandle {
    tx: mpsc::Sender<FsRequest>,
}

impl FsHandle {
    /// Apply an immediate operation and wait for it.
    pub async fn immediate(
        &self,
        folder_id: impl Into<String>,
        name: impl Into<String>,
        op: ImmediateOp,
    ) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FsRequest::Immediate {
                folder_id: folder_id.into(),
                name: name.into(),
                op,
                reply,
            })
            .await
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Read a block of a shared file for a peer.
    pub async fn read_block(
        &self,
        folder_id: impl Into<String>,
        name: impl Into<String>,
        offset: u64,
        size: u32,
        from_temporary: bool,
    ) -> Result<ReadOutcome, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(FsRequest::ReadBlock {
                folder_id: folder_id.into(),
                name: name.into(),
                offset,
                size,
                from_temporary,
                reply,
            })
            .await
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)
    }
}

/// The actor. Subscribes to the coordinator's diff fan-out.
pub struct FileActor {
    cluster: SharedCluster,
    cache: FileCache,
    diff_rx: mpsc::UnboundedReceiver<Arc<AnyDiff>>,
    req_rx: mpsc::Receiver<FsRequest>,
    diff_tx: mpsc::Sender<DiffMsg>,
    event_tx: mpsc::Sender<FsEvent>,
}

/// Everything needed to write one block, resolved under the cluster lock.
struct WriteTarget {
    temp: PathBuf,
    final_path: PathBuf,
    size: u64,
    offset: u64,
    complete: bool,
    pull_blocks: bool,
    modified_s: i64,
    modified_ns: i32,
    permissions: u32,
    apply_permissions: bool,
}

impl FileActor {
    /// Build the actor, its handle and its diff-subscription sender.
    #[allow(clippy::type_complexity)]
    pub fn new(
        cluster: SharedCluster,
        mmap_capacity: usize,
        diff_tx: mpsc::Sender<DiffMsg>,
    ) -> (
        Self,
        FsHandle,
        mpsc::UnboundedSender<Arc<AnyDiff>>,
        mpsc::Receiver<FsEvent>,
    ) {
        let (sub_tx, diff_rx) = mpsc::unbounded_channel();
        let (req_tx, req_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(64);
        (
            Self {
                cluster,
                cache: FileCache::new(mmap_capacity),
                diff_rx,
                req_rx,
                diff_tx,
                event_tx,
            },
            FsHandle { tx: req_tx },
            sub_tx,
            event_rx,
        )
    }

    /// Actor loop. Ends when both channels close; flushes open mappings.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                diff = self.diff_rx.recv() => match diff {
                    Some(diff) => self.on_diff(&diff).await,
                    None => break,
                },
                req = self.req_rx.recv() => match req {
                    Some(req) => self.on_request(req),
                    None => break,
                },
            }
        }
        if let Err(e) = self.cache.flush_all() {
            warn!(error = %e, "flush on shutdown failed");
        }
    }

    async fn on_diff(&mut self, diff: &AnyDiff) {
        let (folder_id, name, result) = match diff {
            AnyDiff::Cluster(ClusterDiff::CloneFile(d)) => {
                (d.folder_id.clone(), d.name.clone(), self.clone_file(d))
            }
            AnyDiff::Block(BlockDiff::Append(d)) => {
                (d.folder_id.clone(), d.name.clone(), self.append_block(d).await)
            }
            AnyDiff::Block(BlockDiff::Clone(d)) => {
                (d.folder_id.clone(), d.name.clone(), self.clone_block(d).await)
            }
            _ => return,
        };
        if let Err(error) = result {
            warn!(folder = folder_id, name, error = %error, "file operation failed");
            let _ = self
                .event_tx
                .send(FsEvent::FileFailed {
                    folder_id,
                    name,
                    error,
                })
                .await;
        }
    }

    fn resolve(&self, folder_id: &str, name: &str, index: u32) -> Result<WriteTarget, SyncError> {
        let cluster = self.cluster.lock().expect("cluster lock");
        let folder = cluster
            .folder(folder_id)
            .ok_or_else(|| SyncError::UnknownFolder(folder_id.to_string()))?;
        let file = cluster
            .file(folder_id, &cluster.local_id(), name)
            .ok_or_else(|| {
                SyncError::Protocol(format!("no local entry for '{name}' in '{folder_id}'"))
            })?;
        Ok(WriteTarget {
            temp: folder.resolve_temp(name),
            final_path: folder.resolve(name),
            size: file.size,
            offset: file.block_offset(index),
            complete: file.is_complete(),
            pull_blocks: !file.deleted && file.kind == FileKind::File && file.size > 0,
            modified_s: file.modified_s,
            modified_ns: file.modified_ns,
            permissions: file.permissions,
            apply_permissions: !folder.ignore_permissions && file.permissions != 0,
        })
    }

    fn clone_file(&mut self, diff: &CloneFile) -> Result<(), SyncError> {
        let target = self.resolve(&diff.folder_id, &diff.name, 0)?;
        // deletions, directories, symlinks and empty files have no blocks
        if !target.pull_blocks {
            return Ok(());
        }
        ensure_parent(&target.temp)?;
        trace!(path = %target.temp.display(), size = target.size, "opening temp file");
        self.cache.open(&target.temp, target.size)?;
        Ok(())
    }

    async fn append_block(&mut self, diff: &AppendBlock) -> Result<(), SyncError> {
        let target = self.resolve(&diff.folder_id, &diff.name, diff.block_index)?;
        ensure_parent(&target.temp)?;
        let mapped = self.cache.open(&target.temp, target.size)?;
        mapped.write_at(target.offset, &diff.data)?;
        if target.complete {
            self.finalize(&diff.folder_id, &diff.name, &target).await?;
        }
        Ok(())
    }

    async fn clone_block(&mut self, diff: &CloneBlock) -> Result<(), SyncError> {
        let target = self.resolve(&diff.folder_id, &diff.name, diff.block_index)?;
        let source = {
            let cluster = self.cluster.lock().expect("cluster lock");
            let folder = cluster
                .folder(&diff.source_folder_id)
                .ok_or_else(|| SyncError::UnknownFolder(diff.source_folder_id.clone()))?;
            let final_path = folder.resolve(&diff.source_name);
            if final_path.exists() {
                final_path
            } else {
                folder.resolve_temp(&diff.source_name)
            }
        };
        let source_file = cluster_file_offset(&self.cluster, diff)?;
        let data = read_exact_at(&source, source_file, diff.size as usize)?;

        ensure_parent(&target.temp)?;
        let mapped = self.cache.open(&target.temp, target.size)?;
        mapped.write_at(target.offset, &data)?;
        if target.complete {
            self.finalize(&diff.folder_id, &diff.name, &target).await?;
        }
        Ok(())
    }

    async fn finalize(
        &mut self,
        folder_id: &str,
        name: &str,
        target: &WriteTarget,
    ) -> Result<(), SyncError> {
        if let Some(mapped) = self.cache.remove(&target.temp) {
            mapped.flush()?;
        }
        debug!(from = %target.temp.display(), to = %target.final_path.display(), "renaming finished pull");
        std::fs::rename(&target.temp, &target.final_path)
            .map_err(|e| SyncError::io(format!("renaming {}", target.temp.display()), e))?;
        if target.modified_s != 0 {
            let mtime =
                filetime::FileTime::from_unix_time(target.modified_s, target.modified_ns as u32);
            filetime::set_file_mtime(&target.final_path, mtime).map_err(|e| {
                SyncError::io(format!("setting mtime of {}", target.final_path.display()), e)
            })?;
        }
        #[cfg(unix)]
        if target.apply_permissions {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &target.final_path,
                std::fs::Permissions::from_mode(target.permissions),
            )
            .map_err(|e| {
                SyncError::io(
                    format!("setting permissions of {}", target.final_path.display()),
                    e,
                )
            })?;
        }
        self.diff_tx
            .send(DiffMsg::publish(ClusterDiff::finish_file(folder_id, name)))
            .await
            .map_err(|_| SyncError::Cancelled)?;
        let _ = self
            .event_tx
            .send(FsEvent::FileFinished {
                folder_id: folder_id.to_string(),
                name: name.to_string(),
            })
            .await;
        Ok(())
    }

    fn on_request(&mut self, req: FsRequest) {
        match req {
            FsRequest::Immediate {
                folder_id,
                name,
                op,
                reply,
            } => {
                let _ = reply.send(self.immediate(&folder_id, &name, op));
            }
            FsRequest::ReadBlock {
                folder_id,
                name,
                offset,
                size,
                from_temporary,
                reply,
            } => {
                let _ = reply.send(self.read_block(&folder_id, &name, offset, size, from_temporary));
            }
        }
    }

    fn immediate(&mut self, folder_id: &str, name: &str, op: ImmediateOp) -> Result<(), SyncError> {
        let (path, temp) = {
            let cluster = self.cluster.lock().expect("cluster lock");
            let folder = cluster
                .folder(folder_id)
                .ok_or_else(|| SyncError::UnknownFolder(folder_id.to_string()))?;
            (folder.resolve(name), folder.resolve_temp(name))
        };
        match op {
            ImmediateOp::Delete => {
                self.cache.remove(&temp);
                if temp.exists() {
                    let _ = std::fs::remove_file(&temp);
                }
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                        .map_err(|e| SyncError::io(format!("removing {}", path.display()), e))?;
                } else if path.exists() || path.is_symlink() {
                    std::fs::remove_file(&path)
                        .map_err(|e| SyncError::io(format!("removing {}", path.display()), e))?;
                }
                Ok(())
            }
            ImmediateOp::CreateEmpty => {
                ensure_parent(&path)?;
                std::fs::File::create(&path)
                    .map(|_| ())
                    .map_err(|e| SyncError::io(format!("creating {}", path.display()), e))
            }
            ImmediateOp::CreateDir => std::fs::create_dir_all(&path)
                .map_err(|e| SyncError::io(format!("creating {}", path.display()), e)),
            ImmediateOp::CreateSymlink { target } => {
                ensure_parent(&path)?;
                if path.is_symlink() || path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
                #[cfg(unix)]
                {
                    std::os::unix::fs::symlink(&target, &path).map_err(|e| {
                        SyncError::io(format!("symlinking {}", path.display()), e)
                    })
                }
                #[cfg(not(unix))]
                {
                    let _ = target;
                    Err(SyncError::io(
                        format!("symlinking {}", path.display()),
                        std::io::Error::new(std::io::ErrorKind::Unsupported, "no symlinks"),
                    ))
                }
            }
        }
    }

    fn read_block(
        &mut self,
        folder_id: &str,
        name: &str,
        offset: u64,
        size: u32,
        from_temporary: bool,
    ) -> ReadOutcome {
        let path = {
            let cluster = self.cluster.lock().expect("cluster lock");
            let Some(folder) = cluster.folder(folder_id) else {
                return ReadOutcome::NoSuchFile;
            };
            let invalid = cluster
                .file(folder_id, &cluster.local_id(), name)
                .map(|f| f.invalid)
                .unwrap_or(false);
            if invalid {
                return ReadOutcome::InvalidFile;
            }
            if from_temporary {
                folder.resolve_temp(name)
            } else {
                folder.resolve(name)
            }
        };
        if !path.exists() {
            return ReadOutcome::NoSuchFile;
        }
        match read_exact_at(&path, offset, size as usize) {
            Ok(data) => ReadOutcome::Data(data),
            Err(_) => ReadOutcome::InvalidFile,
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SyncError::io(format!("creating {}", parent.display()), e))?;
        }
    }
    Ok(())
}

fn read_exact_at(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>, SyncError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| SyncError::io(format!("opening {}", path.display()), e))?;
    file.seek(SeekFrom::Start(offset))
        .map_err(|e| SyncError::io(format!("seeking {}", path.display()), e))?;
    let mut data = vec![0u8; len];
    file.read_exact(&mut data)
        .map_err(|e| SyncError::io(format!("reading {}", path.display()), e))?;
    Ok(data)
}

fn cluster_file_offset(cluster: &SharedCluster, diff: &CloneBlock) -> Result<u64, SyncError> {
    let cluster = cluster.lock().expect("cluster lock");
    let local = cluster.local_id();
    let file = cluster
        .file(&diff.source_folder_id, &local, &diff.source_name)
        .ok_or_else(|| {
            SyncError::Protocol(format!(
                "clone source '{}' has no local entry",
                diff.source_name
            ))
        })?;
    Ok(file.block_offset(diff.source_block_index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hasher::sha256;
    use spindrift_model::{Cluster, Device};
    use spindrift_types::records::FolderRecord;
    use spindrift_types::{bep, DeviceId};
    use std::sync::Mutex;

    struct Fixture {
        cluster: SharedCluster,
        handle: FsHandle,
        sub_tx: mpsc::UnboundedSender<Arc<AnyDiff>>,
        event_rx: mpsc::Receiver<FsEvent>,
        diff_rx: mpsc::Receiver<DiffMsg>,
    }

    fn peer_id() -> DeviceId {
        DeviceId::from_sha256([2; 32])
    }

    fn fixture(root: &Path) -> Fixture {
        let my_id = DeviceId::from_sha256([1; 32]);
        let mut cluster = Cluster::new(Device::new(my_id, "local"));
        cluster.add_device(Device::new(peer_id(), "peer"));
        cluster
            .apply(&ClusterDiff::create_folder(FolderRecord {
                id: "1234-5678".into(),
                label: "my-label".into(),
                path: root.to_string_lossy().into_owned(),
                ..Default::default()
            }))
            .unwrap();
        cluster
            .apply(&ClusterDiff::share_folder(peer_id(), "1234-5678"))
            .unwrap();
        let cluster: SharedCluster = Arc::new(Mutex::new(cluster));
        let (diff_tx, diff_rx) = mpsc::channel(64);
        let (actor, handle, sub_tx, event_rx) = FileActor::new(cluster.clone(), 2, diff_tx);
        tokio::spawn(actor.run());
        Fixture {
            cluster,
            handle,
            sub_tx,
            event_rx,
            diff_rx,
        }
    }

    /// Apply a diff to the cluster, then fan it out to the file actor the
    /// way the coordinator does.
    async fn submit(fx: &Fixture, diff: AnyDiff) {
        {
            let mut cluster = fx.cluster.lock().unwrap();
            match &diff {
                AnyDiff::Cluster(d) => cluster.apply(d).unwrap(),
                AnyDiff::Block(d) => cluster.apply_block(d).unwrap(),
            }
        }
        fx.sub_tx.send(Arc::new(diff)).unwrap();
    }

    fn announce_single_block_file(fx: &Fixture) {
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
                hash: sha256(b"12345").to_vec(),
                weak_hash: 0,
            }],
            ..Default::default()
        };
        fx.cluster
            .lock()
            .unwrap()
            .apply(&ClusterDiff::update_folder(peer_id(), "1234-5678", vec![wire]))
            .unwrap();
    }

    #[tokio::test]
    async fn single_block_file_lands_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());
        announce_single_block_file(&fx);

        submit(
            &fx,
            AnyDiff::Cluster(ClusterDiff::clone_file("1234-5678", peer_id(), "q.txt")),
        )
        .await;
        submit(
            &fx,
            AnyDiff::Block(BlockDiff::Append(AppendBlock {
                folder_id: "1234-5678".into(),
                name: "q.txt".into(),
                block_index: 0,
                data: b"12345".to_vec(),
            })),
        )
        .await;

        match fx.event_rx.recv().await.unwrap() {
            FsEvent::FileFinished { name, .. } => assert_eq!(name, "q.txt"),
            other => panic!("unexpected event {other:?}"),
        }

        let path = dir.path().join("q.txt");
        assert!(path.exists());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"12345");
        assert!(!dir.path().join("q.txt.spindrift-tmp").exists());

        // the finish-file ack reached the coordinator channel
        match fx.diff_rx.recv().await.unwrap().diff {
            AnyDiff::Cluster(ClusterDiff::FinishFile(d)) => assert_eq!(d.name, "q.txt"),
            other => panic!("unexpected diff {other:?}"),
        }
    }

    #[tokio::test]
    async fn clone_block_copies_from_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut fx = fixture(dir.path());

        // a local file already holds the block content
        std::fs::write(dir.path().join("seed.txt"), "12345").unwrap();
        fx.cluster
            .lock()
            .unwrap()
            .apply(&ClusterDiff::local_update(
                "1234-5678",
                bep::FileInfo {
                    name: "seed.txt".into(),
                    size: 5,
                    block_size: 5,
                    blocks: vec![bep::BlockInfo {
                        offset: 0,
                        size: 5,
                        hash: sha256(b"12345").to_vec(),
                        weak_hash: 0,
                    }],
                    ..Default::default()
                },
            ))
            .unwrap();
        announce_single_block_file(&fx);

        submit(
            &fx,
            AnyDiff::Cluster(ClusterDiff::clone_file("1234-5678", peer_id(), "q.txt")),
        )
        .await;
        submit(
            &fx,
            AnyDiff::Block(BlockDiff::Clone(CloneBlock {
                folder_id: "1234-5678".into(),
                name: "q.txt".into(),
                block_index: 0,
                source_folder_id: "1234-5678".into(),
                source_name: "seed.txt".into(),
                source_block_index: 0,
                size: 5,
            })),
        )
        .await;

        assert!(matches!(
            fx.event_rx.recv().await.unwrap(),
            FsEvent::FileFinished { .. }
        ));
        assert_eq!(std::fs::read(dir.path().join("q.txt")).unwrap(), b"12345");
    }

    #[tokio::test]
    async fn immediate_ops_create_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path());

        fx.handle
            .immediate("1234-5678", "sub", ImmediateOp::CreateDir)
            .await
            .unwrap();
        assert!(dir.path().join("sub").is_dir());

        fx.handle
            .immediate("1234-5678", "sub/empty.txt", ImmediateOp::CreateEmpty)
            .await
            .unwrap();
        assert_eq!(
            std::fs::metadata(dir.path().join("sub/empty.txt")).unwrap().len(),
            0
        );

        fx.handle
            .immediate("1234-5678", "sub/empty.txt", ImmediateOp::Delete)
            .await
            .unwrap();
        assert!(!dir.path().join("sub/empty.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn immediate_symlink_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path());
        fx.handle
            .immediate(
                "1234-5678",
                "link",
                ImmediateOp::CreateSymlink {
                    target: "q.txt".into(),
                },
            )
            .await
            .unwrap();
        let link = dir.path().join("link");
        assert!(link.is_symlink());
        assert_eq!(std::fs::read_link(&link).unwrap().to_string_lossy(), "q.txt");
    }

    #[tokio::test]
    async fn read_block_serves_and_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let fx = fixture(dir.path());
        std::fs::write(dir.path().join("served.txt"), "abcdef").unwrap();

        let outcome = fx
            .handle
            .read_block("1234-5678", "served.txt", 2, 3, false)
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::Data(b"cde".to_vec()));

        let outcome = fx
            .handle
            .read_block("1234-5678", "nope.txt", 0, 1, false)
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::NoSuchFile);

        let outcome = fx
            .handle
            .read_block("1234-5678", "served.txt", 4, 10, false)
            .await
            .unwrap();
        assert_eq!(outcome, ReadOutcome::InvalidFile, "short read is invalid");
    }
}

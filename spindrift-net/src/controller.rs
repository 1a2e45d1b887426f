//! Per-peer pull scheduling.
//!
//! The controller walks the peer's file set through the model iterators and
//! decides, block by block, between applying immediately (directories,
//! symlinks, deletions, empty files), cloning from local data, and
//! requesting from the peer. It keeps a bounded window of in-flight
//! requests and submits writes for a file strictly in block-index order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use spindrift_fs::{FsHandle, HasherPool, ImmediateOp};
use spindrift_model::diff::{AppendBlock, BlockDiff, CloneBlock, ClusterDiff, DiffMsg};
use spindrift_model::iterator::{
    classify, BlockAction, BlockIterator, BlockPull, FileIterator, PullClass, PullFile,
};
use spindrift_model::{BlockHash, Dominance, SharedCluster};
use spindrift_types::bep;
use spindrift_types::{DeviceId, SyncError};

/// Messages driving the controller.
#[derive(Debug)]
pub enum ControllerMsg {
    /// The peer is online or its index changed; look for work.
    Ready,
    /// A block response arrived from the peer.
    Response(bep::Response),
    /// The file actor failed on a file; abandon it.
    FileFailed {
        /// The folder.
        folder_id: String,
        /// Folder-relative name.
        name: String,
    },
    /// The peer disconnected; cancel in-flight work, keep temp files.
    PeerGone,
}

/// Cloneable handle to a controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerMsg>,
}

impl ControllerHandle {
    /// Kick the scheduler.
    pub async fn ready(&self) {
        let _ = self.tx.send(ControllerMsg::Ready).await;
    }

    /// Deliver a block response.
    pub async fn response(&self, response: bep::Response) {
        let _ = self.tx.send(ControllerMsg::Response(response)).await;
    }

    /// Report a failed file.
    pub async fn file_failed(&self, folder_id: impl Into<String>, name: impl Into<String>) {
        let _ = self
            .tx
            .send(ControllerMsg::FileFailed {
                folder_id: folder_id.into(),
                name: name.into(),
            })
            .await;
    }

    /// Report the peer's disconnect.
    pub async fn peer_gone(&self) {
        let _ = self.tx.send(ControllerMsg::PeerGone).await;
    }
}

/// What the plan holds for one block index of the current file.
#[derive(Debug)]
enum Planned {
    /// Already on disk at the target location.
    Skip,
    /// Copy from local data.
    Clone(BlockPull),
    /// Requested from the peer; waiting for bytes.
    Requested,
    /// Bytes arrived and verified; ready to write in order.
    Arrived(Vec<u8>),
}

/// The per-peer pull scheduler.
pub struct Controller {
    peer: DeviceId,
    cluster: SharedCluster,
    diff_tx: mpsc::Sender<DiffMsg>,
    fs: FsHandle,
    hasher: Arc<HasherPool>,
    request_tx: mpsc::Sender<bep::Request>,
    window: usize,
    request_timeout: Duration,
    rx: mpsc::Receiver<ControllerMsg>,

    file_iter: FileIterator,
    block_iter: Option<BlockIterator>,
    current: Option<PullFile>,
    plan: BTreeMap<u32, Planned>,
    write_cursor: u32,
    in_flight: HashMap<i32, (u32, BlockHash)>,
    next_id: i32,
}

impl Controller {
    /// Build a controller for `peer` with an in-flight window derived from
    /// the hasher pool size.
    pub fn new(
        peer: DeviceId,
        cluster: SharedCluster,
        diff_tx: mpsc::Sender<DiffMsg>,
        fs: FsHandle,
        hasher: Arc<HasherPool>,
        request_tx: mpsc::Sender<bep::Request>,
        request_timeout: Duration,
    ) -> (Self, ControllerHandle) {
        let window = hasher.threads() * 2;
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                peer,
                cluster,
                diff_tx,
                fs,
                hasher,
                request_tx,
                window,
                request_timeout,
                rx,
                file_iter: FileIterator::new(peer),
                block_iter: None,
                current: None,
                plan: BTreeMap::new(),
                write_cursor: 0,
                in_flight: HashMap::new(),
                next_id: 0,
            },
            ControllerHandle { tx },
        )
    }

    /// Actor loop. A silent peer with requests in flight is abandoned after
    /// the request timeout; temp files stay for resumption.
    pub async fn run(mut self) {
        info!(peer = %self.peer.short(), "controller started");
        loop {
            let msg = if self.in_flight.is_empty() {
                self.rx.recv().await
            } else {
                match tokio::time::timeout(self.request_timeout, self.rx.recv()).await {
                    Ok(msg) => msg,
                    Err(_) => {
                        warn!(
                            peer = %self.peer.short(),
                            outstanding = self.in_flight.len(),
                            "block requests timed out"
                        );
                        self.abandon();
                        continue;
                    }
                }
            };
            let Some(msg) = msg else { break };
            let result = match msg {
                ControllerMsg::Ready => {
                    self.file_iter.reset();
                    self.pump().await
                }
                ControllerMsg::Response(response) => self.on_response(response).await,
                ControllerMsg::FileFailed { folder_id, name } => {
                    if self.is_current(&folder_id, &name) {
                        warn!(folder = folder_id, name, "file failed, abandoning pull");
                        self.abandon();
                    }
                    self.pump().await
                }
                ControllerMsg::PeerGone => {
                    debug!(peer = %self.peer.short(), "peer gone, cancelling in-flight pulls");
                    self.abandon();
                    Ok(())
                }
            };
            if let Err(e) = result {
                if matches!(e, SyncError::Cancelled) {
                    break;
                }
                warn!(peer = %self.peer.short(), error = %e, "controller error");
            }
        }
        info!(peer = %self.peer.short(), "controller stopped");
    }

    fn is_current(&self, folder_id: &str, name: &str) -> bool {
        self.current
            .as_ref()
            .map(|c| c.folder_id == folder_id && c.name == name)
            .unwrap_or(false)
    }

    fn abandon(&mut self) {
        self.current = None;
        self.block_iter = None;
        self.plan.clear();
        self.in_flight.clear();
        self.write_cursor = 0;
    }

    async fn submit(&self, diff: impl Into<spindrift_model::diff::AnyDiff>) -> Result<(), SyncError> {
        let (ack, rx) = tokio::sync::oneshot::channel();
        self.diff_tx
            .send(DiffMsg {
                diff: diff.into(),
                ack: Some(ack),
            })
            .await
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    async fn publish(&self, diff: impl Into<spindrift_model::diff::AnyDiff>) -> Result<(), SyncError> {
        self.diff_tx
            .send(DiffMsg::publish(diff))
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Drive scheduling until the window is full or nothing is left.
    async fn pump(&mut self) -> Result<(), SyncError> {
        loop {
            if self.current.is_none() && !self.next_file().await? {
                return Ok(());
            }
            self.issue_requests().await?;
            self.flush_writes().await?;

            let drained = self
                .block_iter
                .as_ref()
                .map(|it| it.exhausted())
                .unwrap_or(true);
            if drained && self.plan.is_empty() && self.in_flight.is_empty() {
                // every write for this file has been submitted; the file
                // actor finishes it when the last block lands
                self.current = None;
                self.block_iter = None;
                self.write_cursor = 0;
                continue;
            }
            return Ok(());
        }
    }

    /// Select the next file; immediate entries are applied on the spot.
    /// Returns false when the peer has nothing more for us.
    async fn next_file(&mut self) -> Result<bool, SyncError> {
        loop {
            let (target, class, needs_clone) = {
                let cluster = self.cluster.lock().expect("cluster lock");
                let Some(target) = self.file_iter.next(&cluster) else {
                    return Ok(false);
                };
                let Some(remote) = cluster.file(&target.folder_id, &self.peer, &target.name)
                else {
                    continue;
                };
                let class = classify(remote);
                let needs_clone = match cluster.file(
                    &target.folder_id,
                    &cluster.local_id(),
                    &target.name,
                ) {
                    // an equal-version incomplete local copy resumes as-is
                    Some(local) => {
                        !(local.version.compare(&remote.version) == Dominance::Equal
                            && local.is_incomplete())
                    }
                    None => true,
                };
                (target, class, needs_clone)
            };

            if needs_clone {
                self.submit(ClusterDiff::clone_file(
                    target.folder_id.clone(),
                    self.peer,
                    target.name.clone(),
                ))
                .await?;
            }

            match class {
                PullClass::Blocks => {
                    trace!(folder = target.folder_id, name = target.name, "pulling blocks");
                    let cluster = self.cluster.lock().expect("cluster lock");
                    self.block_iter =
                        BlockIterator::new(&cluster, &target.folder_id, &target.name);
                    drop(cluster);
                    self.write_cursor = 0;
                    self.current = Some(target);
                    return Ok(true);
                }
                immediate => {
                    self.apply_immediate(&target, immediate).await?;
                    // immediate entries finish right here; move on
                }
            }
        }
    }

    async fn apply_immediate(
        &mut self,
        target: &PullFile,
        class: PullClass,
    ) -> Result<(), SyncError> {
        let op = match class {
            PullClass::Delete => ImmediateOp::Delete,
            PullClass::CreateEmpty => ImmediateOp::CreateEmpty,
            PullClass::CreateDir => ImmediateOp::CreateDir,
            PullClass::CreateSymlink { target } => ImmediateOp::CreateSymlink { target },
            PullClass::Blocks => unreachable!("blocks are not immediate"),
        };
        debug!(folder = target.folder_id, name = target.name, ?op, "applying immediately");
        self.fs
            .immediate(target.folder_id.clone(), target.name.clone(), op)
            .await?;
        self.submit(ClusterDiff::finish_file(
            target.folder_id.clone(),
            target.name.clone(),
        ))
        .await
    }

    /// Walk the block iterator, planning writes and issuing requests while
    /// the window has slack.
    async fn issue_requests(&mut self) -> Result<(), SyncError> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        loop {
            if self.in_flight.len() >= self.window {
                return Ok(());
            }
            let pull = {
                let cluster = self.cluster.lock().expect("cluster lock");
                match self.block_iter.as_mut() {
                    Some(iter) => iter.next(&cluster),
                    None => None,
                }
            };
            let Some(pull) = pull else {
                return Ok(());
            };
            match &pull.action {
                BlockAction::Skip => {
                    self.plan.insert(pull.index, Planned::Skip);
                }
                BlockAction::Clone { .. } => {
                    self.plan.insert(pull.index, Planned::Clone(pull));
                }
                BlockAction::Request => {
                    self.next_id = self.next_id.wrapping_add(1);
                    let id = self.next_id;
                    self.in_flight.insert(id, (pull.index, pull.hash));
                    self.plan.insert(pull.index, Planned::Requested);
                    trace!(
                        id,
                        folder = current.folder_id,
                        name = current.name,
                        index = pull.index,
                        "requesting block"
                    );
                    self.request_tx
                        .send(bep::Request {
                            id,
                            folder: current.folder_id.clone(),
                            name: current.name.clone(),
                            offset: pull.offset as i64,
                            size: pull.size as i32,
                            hash: pull.hash.to_vec(),
                            from_temporary: false,
                        })
                        .await
                        .map_err(|_| SyncError::Cancelled)?;
                }
            }
        }
    }

    /// Submit writes strictly in block-index order.
    async fn flush_writes(&mut self) -> Result<(), SyncError> {
        let Some(current) = self.current.clone() else {
            return Ok(());
        };
        loop {
            match self.plan.first_key_value() {
                Some((index, _)) if *index == self.write_cursor => {}
                _ => return Ok(()),
            }
            if matches!(
                self.plan.get(&self.write_cursor),
                Some(Planned::Requested)
            ) {
                // bytes not here yet; later blocks wait their turn
                return Ok(());
            }
            let planned = self.plan.remove(&self.write_cursor).expect("checked above");
            match planned {
                Planned::Skip => {}
                Planned::Clone(pull) => {
                    let BlockAction::Clone {
                        source_folder_id,
                        source_name,
                        source_index,
                    } = pull.action
                    else {
                        unreachable!("planned clone holds a clone action")
                    };
                    self.publish(BlockDiff::Clone(CloneBlock {
                        folder_id: current.folder_id.clone(),
                        name: current.name.clone(),
                        block_index: pull.index,
                        source_folder_id,
                        source_name,
                        source_block_index: source_index,
                        size: pull.size,
                    }))
                    .await?;
                }
                Planned::Arrived(data) => {
                    self.publish(BlockDiff::Append(AppendBlock {
                        folder_id: current.folder_id.clone(),
                        name: current.name.clone(),
                        block_index: self.write_cursor,
                        data,
                    }))
                    .await?;
                }
                Planned::Requested => unreachable!("checked above"),
            }
            self.write_cursor += 1;
        }
    }

    async fn on_response(&mut self, response: bep::Response) -> Result<(), SyncError> {
        let Some((index, hash)) = self.in_flight.remove(&response.id) else {
            warn!(id = response.id, "response for unknown request id");
            return Ok(());
        };
        let Some(current) = self.current.clone() else {
            return Ok(());
        };

        let code = bep::ErrorCode::try_from(response.code).unwrap_or(bep::ErrorCode::Generic);
        if code != bep::ErrorCode::NoError {
            warn!(
                folder = current.folder_id,
                name = current.name,
                ?code,
                "peer refused block request"
            );
            self.abandon();
            return self.pump().await;
        }

        match self.hasher.validate(response.data.clone(), &hash).await {
            Ok(()) => {
                self.plan.insert(index, Planned::Arrived(response.data));
                self.pump().await
            }
            Err(SyncError::DigestMismatch(_)) => {
                warn!(
                    folder = current.folder_id,
                    name = current.name,
                    index,
                    "digest mismatch, invalidating file"
                );
                self.submit(ClusterDiff::invalidate_file(
                    current.folder_id.clone(),
                    current.name.clone(),
                ))
                .await?;
                self.abandon();
                self.pump().await
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindrift_fs::{sha256, FileActor};
    use spindrift_model::diff::AnyDiff;
    use spindrift_model::{Cluster, Device};
    use spindrift_types::records::FolderRecord;
    use std::path::Path;
    use std::sync::Mutex;

    fn local_id() -> DeviceId {
        DeviceId::from_sha256([1; 32])
    }

    fn peer_id() -> DeviceId {
        DeviceId::from_sha256([2; 32])
    }

    struct Rig {
        cluster: SharedCluster,
        handle: ControllerHandle,
        request_rx: mpsc::Receiver<bep::Request>,
    }

    /// A miniature coordinator: applies diffs in order, acks, and fans out
    /// to the file actor the way the daemon does.
    fn spawn_coordinator(
        cluster: SharedCluster,
        mut rx: mpsc::Receiver<DiffMsg>,
        fs_sub: mpsc::UnboundedSender<Arc<AnyDiff>>,
    ) {
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let result = {
                    let mut cluster = cluster.lock().unwrap();
                    match &msg.diff {
                        AnyDiff::Cluster(d) => cluster.apply(d),
                        AnyDiff::Block(d) => cluster.apply_block(d),
                    }
                };
                let fatal = result.is_err();
                if let Some(ack) = msg.ack {
                    let _ = ack.send(result);
                }
                if !fatal {
                    let _ = fs_sub.send(Arc::new(msg.diff));
                }
            }
        });
    }

    fn rig(root: &Path) -> Rig {
        let mut cluster = Cluster::new(Device::new(local_id(), "local"));
        cluster.add_device(Device::new(peer_id(), "peer"));
        cluster
            .apply(&ClusterDiff::create_folder(FolderRecord {
                id: "f".into(),
                label: "f".into(),
                path: root.to_string_lossy().into_owned(),
                ..Default::default()
            }))
            .unwrap();
        cluster
            .apply(&ClusterDiff::share_folder(peer_id(), "f"))
            .unwrap();
        let cluster: SharedCluster = Arc::new(Mutex::new(cluster));

        let (diff_tx, diff_rx) = mpsc::channel(128);
        let (file_actor, fs_handle, fs_sub, _events) =
            FileActor::new(cluster.clone(), 4, diff_tx.clone());
        tokio::spawn(file_actor.run());
        spawn_coordinator(cluster.clone(), diff_rx, fs_sub);

        let (request_tx, request_rx) = mpsc::channel(32);
        let (controller, handle) = Controller::new(
            peer_id(),
            cluster.clone(),
            diff_tx,
            fs_handle,
            Arc::new(HasherPool::new(2)),
            request_tx,
            Duration::from_secs(30),
        );
        tokio::spawn(controller.run());
        Rig {
            cluster,
            handle,
            request_rx,
        }
    }

    fn announce(cluster: &SharedCluster, name: &str, content: &[&[u8]]) {
        let block_size = 5;
        let blocks: Vec<bep::BlockInfo> = content
            .iter()
            .enumerate()
            .map(|(i, data)| bep::BlockInfo {
                offset: (i * block_size) as i64,
                size: data.len() as i32,
                hash: sha256(data).to_vec(),
                weak_hash: 0,
            })
            .collect();
        let size: i64 = content.iter().map(|d| d.len() as i64).sum();
        let wire = bep::FileInfo {
            name: name.into(),
            size,
            block_size: block_size as i32,
            sequence: 1,
            version: Some(bep::Vector {
                counters: vec![bep::Counter { id: 9, value: 1 }],
            }),
            blocks,
            ..Default::default()
        };
        cluster
            .lock()
            .unwrap()
            .apply(&ClusterDiff::update_folder(peer_id(), "f", vec![wire]))
            .unwrap();
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn single_block_pull_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(dir.path());
        announce(&rig.cluster, "q.txt", &[b"12345"]);

        rig.handle.ready().await;
        let request = rig.request_rx.recv().await.unwrap();
        assert_eq!(request.folder, "f");
        assert_eq!(request.name, "q.txt");
        assert_eq!(request.offset, 0);
        assert_eq!(request.size, 5);
        assert_eq!(request.hash, sha256(b"12345").to_vec());

        rig.handle
            .response(bep::Response {
                id: request.id,
                data: b"12345".to_vec(),
                code: bep::ErrorCode::NoError as i32,
            })
            .await;

        let path = dir.path().join("q.txt");
        wait_for("file to land", || path.exists()).await;
        assert_eq!(std::fs::read(&path).unwrap(), b"12345");
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);

        // the finished file carries a fresh local sequence
        wait_for("sequence assignment", || {
            let cluster = rig.cluster.lock().unwrap();
            cluster
                .file("f", &local_id(), "q.txt")
                .map(|f| f.sequence > 0)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn corrupted_response_invalidates_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(dir.path());
        announce(&rig.cluster, "q.txt", &[b"12345"]);

        rig.handle.ready().await;
        let request = rig.request_rx.recv().await.unwrap();
        rig.handle
            .response(bep::Response {
                id: request.id,
                data: b"99999".to_vec(),
                code: bep::ErrorCode::NoError as i32,
            })
            .await;

        wait_for("file invalidation", || {
            let cluster = rig.cluster.lock().unwrap();
            cluster
                .file("f", &local_id(), "q.txt")
                .map(|f| f.invalid)
                .unwrap_or(false)
        })
        .await;
        assert!(!dir.path().join("q.txt").exists());
    }

    #[tokio::test]
    async fn local_block_is_cloned_not_requested() {
        let dir = tempfile::tempdir().unwrap();
        let mut rig = rig(dir.path());

        // seed a local file holding block "12345"
        std::fs::write(dir.path().join("seed.txt"), "12345").unwrap();
        rig.cluster
            .lock()
            .unwrap()
            .apply(&ClusterDiff::local_update(
                "f",
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

        // the peer's file shares its first block with seed.txt
        announce(&rig.cluster, "two.txt", &[b"12345", b"abcde"]);
        rig.handle.ready().await;

        // only the second block goes over the wire
        let request = rig.request_rx.recv().await.unwrap();
        assert_eq!(request.offset, 5);
        rig.handle
            .response(bep::Response {
                id: request.id,
                data: b"abcde".to_vec(),
                code: bep::ErrorCode::NoError as i32,
            })
            .await;

        let path = dir.path().join("two.txt");
        wait_for("file to land", || path.exists()).await;
        assert_eq!(std::fs::read(&path).unwrap(), b"12345abcde");
        assert!(rig.request_rx.try_recv().is_err(), "no further requests");
    }

    #[tokio::test]
    async fn deletion_is_applied_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let rig = rig(dir.path());

        // the local model knows about doomed.txt, which exists on disk
        std::fs::write(dir.path().join("doomed.txt"), "bye").unwrap();
        rig.cluster
            .lock()
            .unwrap()
            .apply(&ClusterDiff::local_update(
                "f",
                bep::FileInfo {
                    name: "doomed.txt".into(),
                    size: 3,
                    block_size: 5,
                    blocks: vec![bep::BlockInfo {
                        offset: 0,
                        size: 3,
                        hash: sha256(b"bye").to_vec(),
                        weak_hash: 0,
                    }],
                    ..Default::default()
                },
            ))
            .unwrap();

        // the peer sends a dominating tombstone
        let tombstone = {
            let cluster = rig.cluster.lock().unwrap();
            let local = cluster.file("f", &local_id(), "doomed.txt").unwrap();
            let mut version = local.version.clone();
            version.update(peer_id().short_id());
            bep::FileInfo {
                name: "doomed.txt".into(),
                deleted: true,
                sequence: 1,
                version: Some(version.to_wire()),
                ..Default::default()
            }
        };
        rig.cluster
            .lock()
            .unwrap()
            .apply(&ClusterDiff::update_folder(peer_id(), "f", vec![tombstone]))
            .unwrap();

        rig.handle.ready().await;
        let path = dir.path().join("doomed.txt");
        wait_for("deletion", || !path.exists()).await;
    }
}

//! The persistence actor: exclusive owner of the sled environment.

use std::collections::HashMap;
use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use spindrift_model::diff::{LoadCluster, LoadPart, RawKv};
use spindrift_types::records::FileInfoRecord;
use spindrift_types::{DeviceId, SyncError};

use prost::Message as _;

use crate::keys;
use crate::ops::DbOp;
use crate::DB_VERSION;

/// Commands accepted by the [`DbActor`].
#[derive(Debug)]
pub enum DbCommand {
    /// Queue operations from one diff; commit per the policy.
    Ops {
        /// Resolved storage operations.
        ops: Vec<DbOp>,
        /// Commit the open batch immediately.
        force_commit: bool,
        /// Optional acknowledgement.
        reply: Option<oneshot::Sender<Result<(), SyncError>>>,
    },
    /// Read the whole store into a load aggregate.
    Load {
        /// Receives the aggregate or the failure.
        reply: oneshot::Sender<Result<LoadCluster, SyncError>>,
    },
    /// The cluster is tainted: acknowledge writes without performing them.
    Taint,
    /// Force-commit and stop.
    Shutdown {
        /// Acknowledged once the final commit lands.
        reply: oneshot::Sender<Result<(), SyncError>>,
    },
}

/// Cloneable handle to the persistence actor.
#[derive(Debug, Clone)]
pub struct DbHandle {
    tx: mpsc::Sender<DbCommand>,
}

impl DbHandle {
    /// Queue operations without waiting for the write.
    pub async fn apply(&self, ops: Vec<DbOp>, force_commit: bool) -> Result<(), SyncError> {
        self.tx
            .send(DbCommand::Ops {
                ops,
                force_commit,
                reply: None,
            })
            .await
            .map_err(|_| SyncError::Db("persistence actor is gone".into()))
    }

    /// Queue operations and wait until they are committed or refused.
    pub async fn apply_acked(&self, ops: Vec<DbOp>, force_commit: bool) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DbCommand::Ops {
                ops,
                force_commit,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SyncError::Db("persistence actor is gone".into()))?;
        rx.await
            .map_err(|_| SyncError::Db("persistence actor dropped the reply".into()))?
    }

    /// Request the load aggregate.
    pub async fn load_cluster(&self) -> Result<LoadCluster, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DbCommand::Load { reply })
            .await
            .map_err(|_| SyncError::Db("persistence actor is gone".into()))?;
        rx.await
            .map_err(|_| SyncError::Db("persistence actor dropped the reply".into()))?
    }

    /// Stop persisting: the cluster is tainted.
    pub async fn taint(&self) {
        let _ = self.tx.send(DbCommand::Taint).await;
    }

    /// Force-commit and stop the actor.
    pub async fn shutdown(&self) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(DbCommand::Shutdown { reply })
            .await
            .map_err(|_| SyncError::Db("persistence actor is gone".into()))?;
        rx.await
            .map_err(|_| SyncError::Db("persistence actor dropped the reply".into()))?
    }
}

/// The actor. Create with [`DbActor::open`], then drive with `run`.
#[derive(Debug)]
pub struct DbActor {
    db: sled::Db,
    rx: mpsc::Receiver<DbCommand>,
    batch: sled::Batch,
    uncommitted: usize,
    threshold: usize,
    tainted: bool,
    folder_info_keys: HashMap<(String, DeviceId), u64>,
    file_keys: HashMap<(u64, String), u64>,
}

fn db_err(e: sled::Error) -> SyncError {
    SyncError::Db(e.to_string())
}

impl DbActor {
    /// Open (or create) the environment, run migrations, and load the key
    /// maps. `threshold` is the number of non-critical diffs tolerated in the
    /// open batch before a commit.
    pub fn open(path: &Path, threshold: usize) -> Result<(Self, DbHandle), SyncError> {
        let db = sled::open(path).map_err(db_err)?;
        migrate(&db)?;

        let mut folder_info_keys = HashMap::new();
        for item in db.scan_prefix([keys::FOLDER_INFO]) {
            let (key, value) = item.map_err(db_err)?;
            let seq = parse_seq_key(&key)?;
            let record = spindrift_types::records::FolderInfoRecord::decode(value.as_ref())?;
            let device = DeviceId::from_bytes(&record.device)
                .ok_or_else(|| SyncError::Db("folder-info has a malformed device".into()))?;
            folder_info_keys.insert((record.folder, device), seq);
        }
        let mut file_keys = HashMap::new();
        for item in db.scan_prefix([keys::FILE_INFO]) {
            let (key, value) = item.map_err(db_err)?;
            let seq = parse_seq_key(&key)?;
            let record = FileInfoRecord::decode(value.as_ref())?;
            file_keys.insert((record.folder_info, record.name), seq);
        }
        debug!(
            folder_infos = folder_info_keys.len(),
            files = file_keys.len(),
            "environment open"
        );

        let (tx, rx) = mpsc::channel(256);
        Ok((
            Self {
                db,
                rx,
                batch: sled::Batch::default(),
                uncommitted: 0,
                threshold: threshold.max(1),
                tainted: false,
                folder_info_keys,
                file_keys,
            },
            DbHandle { tx },
        ))
    }

    /// Actor loop. Commits the open batch on shutdown or channel close.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                DbCommand::Ops {
                    ops,
                    force_commit,
                    reply,
                } => {
                    let result = if self.tainted {
                        // taint: report success, write nothing
                        Ok(())
                    } else {
                        self.queue(ops, force_commit)
                    };
                    if let Err(e) = &result {
                        warn!(error = %e, "write failed");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                DbCommand::Load { reply } => {
                    let _ = reply.send(self.load());
                }
                DbCommand::Taint => {
                    warn!("cluster tainted; persistence disabled");
                    self.tainted = true;
                }
                DbCommand::Shutdown { reply } => {
                    let result = self.final_commit();
                    let _ = reply.send(result);
                    return;
                }
            }
        }
        if let Err(e) = self.final_commit() {
            warn!(error = %e, "final commit failed");
        }
    }

    fn final_commit(&mut self) -> Result<(), SyncError> {
        if !self.tainted {
            self.commit()?;
        }
        self.db.flush().map_err(db_err)?;
        Ok(())
    }

    fn next_key(&self) -> Result<u64, SyncError> {
        // generate_id is monotone from zero; shift so keys are never zero
        Ok(self.db.generate_id().map_err(db_err)? + 1)
    }

    fn folder_info_key(&mut self, folder: &str, device: &DeviceId) -> Result<u64, SyncError> {
        if let Some(key) = self.folder_info_keys.get(&(folder.to_string(), *device)) {
            return Ok(*key);
        }
        let key = self.next_key()?;
        self.folder_info_keys
            .insert((folder.to_string(), *device), key);
        Ok(key)
    }

    fn file_key(&mut self, fi_key: u64, name: &str) -> Result<u64, SyncError> {
        if let Some(key) = self.file_keys.get(&(fi_key, name.to_string())) {
            return Ok(*key);
        }
        let key = self.next_key()?;
        self.file_keys.insert((fi_key, name.to_string()), key);
        Ok(key)
    }

    fn queue(&mut self, ops: Vec<DbOp>, force_commit: bool) -> Result<(), SyncError> {
        for op in ops {
            self.queue_one(op)?;
        }
        self.uncommitted += 1;
        if force_commit || self.uncommitted >= self.threshold {
            self.commit()?;
        }
        Ok(())
    }

    fn queue_one(&mut self, op: DbOp) -> Result<(), SyncError> {
        match op {
            DbOp::PutDevice(id, value) => self.batch.insert(keys::device(&id), value),
            DbOp::DelDevice(id) => self.batch.remove(keys::device(&id)),
            DbOp::PutFolder(id, value) => self.batch.insert(keys::folder(&id), value),
            DbOp::PutFolderInfo {
                folder,
                device,
                value,
            } => {
                let key = self.folder_info_key(&folder, &device)?;
                self.batch.insert(keys::folder_info(key), value);
            }
            DbOp::DelFolderInfo { folder, device } => {
                if let Some(fi_key) = self.folder_info_keys.remove(&(folder, device)) {
                    self.batch.remove(keys::folder_info(fi_key));
                    let doomed: Vec<u64> = self
                        .file_keys
                        .iter()
                        .filter(|((fik, _), _)| *fik == fi_key)
                        .map(|(_, key)| *key)
                        .collect();
                    self.file_keys.retain(|(fik, _), _| *fik != fi_key);
                    for key in doomed {
                        self.batch.remove(keys::file_info(key));
                    }
                }
            }
            DbOp::PutFileInfo {
                folder,
                device,
                name,
                mut record,
            } => {
                let fi_key = self.folder_info_key(&folder, &device)?;
                let key = self.file_key(fi_key, &name)?;
                record.folder_info = fi_key;
                self.batch.insert(keys::file_info(key), record.encode_to_vec());
            }
            DbOp::DelFileInfo {
                folder,
                device,
                name,
            } => {
                let fi_key = self.folder_info_key(&folder, &device)?;
                if let Some(key) = self.file_keys.remove(&(fi_key, name)) {
                    self.batch.remove(keys::file_info(key));
                }
            }
            DbOp::PutBlock(hash, value) => self.batch.insert(keys::block(&hash), value),
            DbOp::DelBlock(hash) => self.batch.remove(keys::block(&hash)),
            DbOp::PutIgnoredDevice(id, value) => {
                self.batch.insert(keys::ignored_device(&id), value)
            }
            DbOp::PutIgnoredFolder(id, value) => {
                self.batch.insert(keys::ignored_folder(&id), value)
            }
            DbOp::PutUnknownFolder(id, device, value) => {
                self.batch.insert(keys::unknown_folder(&id, &device), value)
            }
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), SyncError> {
        if self.uncommitted == 0 {
            return Ok(());
        }
        trace!(diffs = self.uncommitted, "committing batch");
        let batch = std::mem::take(&mut self.batch);
        self.db.apply_batch(batch).map_err(db_err)?;
        self.uncommitted = 0;
        Ok(())
    }

    fn scan(&self, prefix: u8) -> Result<Vec<RawKv>, SyncError> {
        let mut out = Vec::new();
        for item in self.db.scan_prefix([prefix]) {
            let (key, value) = item.map_err(db_err)?;
            out.push((key[1..].to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn load(&self) -> Result<LoadCluster, SyncError> {
        let parts = vec![
            LoadPart::Devices(self.scan(keys::DEVICE)?),
            LoadPart::Blocks(self.scan(keys::BLOCK_INFO)?),
            LoadPart::Folders(self.scan(keys::FOLDER)?),
            LoadPart::FolderInfos(self.scan(keys::FOLDER_INFO)?),
            LoadPart::FileInfos(self.scan(keys::FILE_INFO)?),
            LoadPart::IgnoredDevices(self.scan(keys::IGNORED_DEVICE)?),
            LoadPart::IgnoredFolders(self.scan(keys::IGNORED_FOLDER)?),
            LoadPart::UnknownFolders(self.scan(keys::UNKNOWN_FOLDER)?),
            LoadPart::Close,
        ];
        Ok(LoadCluster { parts })
    }
}

fn parse_seq_key(key: &[u8]) -> Result<u64, SyncError> {
    let body: [u8; 8] = key
        .get(1..9)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| SyncError::Db(format!("sequence key has length {}", key.len())))?;
    Ok(u64::from_be_bytes(body))
}

/// Check the schema version and run pending migrations in order.
fn migrate(db: &sled::Db) -> Result<(), SyncError> {
    let version_key = keys::misc("db_version");
    let stored = match db.get(&version_key).map_err(db_err)? {
        None => 0,
        Some(raw) => {
            let bytes: [u8; 4] = raw
                .as_ref()
                .try_into()
                .map_err(|_| SyncError::Db("db_version value has the wrong size".into()))?;
            u32::from_be_bytes(bytes)
        }
    };
    if stored > DB_VERSION {
        return Err(SyncError::VersionMismatch {
            expected: DB_VERSION,
            got: stored,
        });
    }
    if stored < DB_VERSION {
        debug!(from = stored, to = DB_VERSION, "migrating schema");
        let mut batch = sled::Batch::default();
        // version 0 -> 1: stamp the schema version
        batch.insert(version_key, DB_VERSION.to_be_bytes().as_slice());
        db.apply_batch(batch).map_err(db_err)?;
        db.flush().map_err(db_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::serialize_diff;
    use spindrift_model::diff::ClusterDiff;
    use spindrift_model::{Cluster, Device};
    use spindrift_types::bep;
    use spindrift_types::records::FolderRecord;

    fn local_id() -> DeviceId {
        DeviceId::from_sha256([1; 32])
    }

    fn fresh_cluster() -> Cluster {
        Cluster::new(Device::new(local_id(), "local"))
    }

    #[tokio::test]
    async fn version_is_stamped_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (_actor, _handle) = DbActor::open(dir.path(), 10).unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let raw = db.get(keys::misc("db_version")).unwrap().unwrap();
        assert_eq!(raw.as_ref(), DB_VERSION.to_be_bytes().as_slice());
    }

    #[tokio::test]
    async fn future_version_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            db.insert(keys::misc("db_version"), 99u32.to_be_bytes().as_slice())
                .unwrap();
            db.flush().unwrap();
        }
        let err = DbActor::open(dir.path(), 10).unwrap_err();
        assert!(matches!(err, SyncError::VersionMismatch { got: 99, .. }));
    }

    #[tokio::test]
    async fn diffs_survive_a_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = fresh_cluster();

        {
            let (actor, handle) = DbActor::open(dir.path(), 10).unwrap();
            let task = tokio::spawn(actor.run());

            for diff in [
                ClusterDiff::create_folder(FolderRecord {
                    id: "1234-5678".into(),
                    label: "my-label".into(),
                    path: "/tmp/x".into(),
                    ..Default::default()
                }),
                ClusterDiff::local_update(
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
                ),
            ] {
                cluster.apply(&diff).unwrap();
                let ops = serialize_diff(&diff, &cluster).unwrap();
                handle.apply_acked(ops, diff.force_commit()).await.unwrap();
            }
            handle.shutdown().await.unwrap();
            task.await.unwrap();
        }

        let (actor, handle) = DbActor::open(dir.path(), 10).unwrap();
        let task = tokio::spawn(actor.run());
        let load = handle.load_cluster().await.unwrap();

        let mut restored = fresh_cluster();
        restored
            .apply(&ClusterDiff::LoadCluster(load))
            .unwrap();

        let folder = restored.folder("1234-5678").unwrap();
        assert_eq!(folder.label, "my-label");
        let file = restored
            .file("1234-5678", &local_id(), "a.txt")
            .unwrap();
        assert_eq!(file.size, 5);
        assert!(file.is_complete());
        assert_eq!(file.sequence, 1);
        assert_eq!(restored.blocks().len(), 1);
        let fi = restored.local_folder_info("1234-5678").unwrap();
        assert_eq!(fi.max_sequence, 1);
        assert_ne!(fi.index_id, 0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn finished_pull_version_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let peer = DeviceId::from_sha256([2; 32]);
        let mut cluster = fresh_cluster();
        cluster.add_device(Device::new(peer, "peer"));

        {
            let (actor, handle) = DbActor::open(dir.path(), 10).unwrap();
            let task = tokio::spawn(actor.run());

            for diff in [
                ClusterDiff::create_folder(FolderRecord {
                    id: "1234-5678".into(),
                    label: "my-label".into(),
                    path: "/tmp/x".into(),
                    ..Default::default()
                }),
                ClusterDiff::share_folder(peer, "1234-5678"),
                ClusterDiff::update_folder(
                    peer,
                    "1234-5678",
                    vec![bep::FileInfo {
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
                    }],
                ),
                ClusterDiff::clone_file("1234-5678", peer, "q.txt"),
            ] {
                cluster.apply(&diff).unwrap();
                let ops = serialize_diff(&diff, &cluster).unwrap();
                handle.apply_acked(ops, diff.force_commit()).await.unwrap();
            }

            // the pulled block lands; availability travels with the
            // finish-file record
            cluster
                .mark_block_local("1234-5678", &local_id(), "q.txt", 0)
                .unwrap();
            let finish = ClusterDiff::finish_file("1234-5678", "q.txt");
            cluster.apply(&finish).unwrap();
            let ops = serialize_diff(&finish, &cluster).unwrap();
            handle.apply_acked(ops, finish.force_commit()).await.unwrap();

            handle.shutdown().await.unwrap();
            task.await.unwrap();
        }

        let (actor, handle) = DbActor::open(dir.path(), 10).unwrap();
        let task = tokio::spawn(actor.run());
        let load = handle.load_cluster().await.unwrap();

        let mut restored = fresh_cluster();
        restored.apply(&ClusterDiff::LoadCluster(load)).unwrap();

        let file = restored
            .file("1234-5678", &local_id(), "q.txt")
            .unwrap();
        assert!(file.is_complete());
        assert!(file.sequence > 0);
        assert_eq!(
            file.version.counter(local_id().short_id()),
            1,
            "the reloaded record carries the new local version"
        );
        assert_eq!(file.version.counter(9), 1, "origin history is retained");

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn threshold_batches_non_critical_diffs() {
        let dir = tempfile::tempdir().unwrap();
        let (actor, handle) = DbActor::open(dir.path(), 3).unwrap();
        let task = tokio::spawn(actor.run());

        // two non-critical writes stay in the open batch
        for _ in 0..2 {
            handle
                .apply_acked(
                    vec![DbOp::PutBlock([9; 32], vec![])],
                    false,
                )
                .await
                .unwrap();
        }
        // a force-commit diff lands everything
        handle
            .apply_acked(
                vec![DbOp::PutIgnoredFolder("junk".into(), vec![])],
                true,
            )
            .await
            .unwrap();

        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let db = sled::open(dir.path()).unwrap();
        assert!(db.get(keys::block(&[9; 32])).unwrap().is_some());
        assert!(db.get(keys::ignored_folder("junk")).unwrap().is_some());
    }

    #[tokio::test]
    async fn tainted_actor_acknowledges_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let (actor, handle) = DbActor::open(dir.path(), 1).unwrap();
        let task = tokio::spawn(actor.run());

        handle.taint().await;
        handle
            .apply_acked(vec![DbOp::PutBlock([5; 32], vec![])], true)
            .await
            .unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let db = sled::open(dir.path()).unwrap();
        assert!(db.get(keys::block(&[5; 32])).unwrap().is_none());
    }
}

//! The scan actor: runs folder scans and turns findings into diffs.

use std::path::Path;
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use spindrift_model::diff::{AnyDiff, ClusterDiff, DiffMsg};
use spindrift_model::SharedCluster;
use spindrift_types::bep;
use spindrift_types::block::{block_count, block_size_for};
use spindrift_types::SyncError;

use crate::hasher::HasherPool;
use crate::scan_task::{ScanOutcome, ScanTask};

/// Commands accepted by the [`ScanActor`].
#[derive(Debug)]
pub enum ScanCommand {
    /// Scan one folder to completion.
    Scan {
        /// The folder id.
        folder_id: String,
        /// Optional completion acknowledgement.
        reply: Option<oneshot::Sender<Result<(), SyncError>>>,
    },
}

/// Cloneable handle to the scan actor.
#[derive(Debug, Clone)]
pub struct ScanHandle {
    tx: mpsc::Sender<ScanCommand>,
}

impl ScanHandle {
    /// Scan a folder and wait for it to finish.
    pub async fn scan(&self, folder_id: impl Into<String>) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ScanCommand::Scan {
                folder_id: folder_id.into(),
                reply: Some(reply),
            })
            .await
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    /// Queue a folder scan without waiting.
    pub async fn request_scan(&self, folder_id: impl Into<String>) -> Result<(), SyncError> {
        self.tx
            .send(ScanCommand::Scan {
                folder_id: folder_id.into(),
                reply: None,
            })
            .await
            .map_err(|_| SyncError::Cancelled)
    }
}

/// Walks folder roots and reconciles on-disk state with the model by
/// emitting local-update diffs.
pub struct ScanActor {
    cluster: SharedCluster,
    hasher: Arc<HasherPool>,
    diff_tx: mpsc::Sender<DiffMsg>,
    rx: mpsc::Receiver<ScanCommand>,
}

impl ScanActor {
    /// Build the actor and its handle.
    pub fn new(
        cluster: SharedCluster,
        hasher: Arc<HasherPool>,
        diff_tx: mpsc::Sender<DiffMsg>,
    ) -> (Self, ScanHandle) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                cluster,
                hasher,
                diff_tx,
                rx,
            },
            ScanHandle { tx },
        )
    }

    /// Actor loop: scans run one at a time, in request order.
    pub async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                ScanCommand::Scan { folder_id, reply } => {
                    let result = self.scan_folder(&folder_id).await;
                    if let Err(e) = &result {
                        warn!(folder = folder_id, error = %e, "scan failed");
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
            }
        }
    }

    async fn scan_folder(&self, folder_id: &str) -> Result<(), SyncError> {
        let mut task = {
            let cluster = self.cluster.lock().expect("cluster lock");
            ScanTask::new(&cluster, folder_id)
                .ok_or_else(|| SyncError::UnknownFolder(folder_id.to_string()))?
        };
        info!(folder = folder_id, root = %task.root().display(), "scanning");

        let mut updates = 0usize;
        loop {
            match task.advance() {
                ScanOutcome::Continue => {}
                ScanOutcome::Done => break,
                ScanOutcome::Unchanged(_) => {}
                ScanOutcome::Incomplete(name) => {
                    debug!(folder = folder_id, name, "partial pull found, will resume");
                }
                ScanOutcome::ChangedMeta(name) => {
                    let path = task.root().join(&name);
                    self.emit_file_update(folder_id, &path, &name).await?;
                    updates += 1;
                }
                ScanOutcome::New { path, name } => {
                    self.emit_file_update(folder_id, &path, &name).await?;
                    updates += 1;
                }
                ScanOutcome::SymlinkChanged { name, target } => {
                    let wire = bep::FileInfo {
                        name: name.clone(),
                        r#type: bep::FileInfoType::Symlink as i32,
                        symlink_target: target,
                        ..Default::default()
                    };
                    self.emit(folder_id, wire).await?;
                    updates += 1;
                }
                ScanOutcome::Errors(errors) => {
                    for e in errors {
                        warn!(path = %e.path.display(), error = %e.error, "scan i/o error");
                    }
                }
            }
        }

        for name in task.missing() {
            debug!(folder = folder_id, name, "recorded file is gone, tombstoning");
            let wire = bep::FileInfo {
                name,
                deleted: true,
                ..Default::default()
            };
            self.emit(folder_id, wire).await?;
            updates += 1;
        }
        info!(folder = folder_id, updates, "scan finished");
        Ok(())
    }

    async fn emit_file_update(
        &self,
        folder_id: &str,
        path: &Path,
        name: &str,
    ) -> Result<(), SyncError> {
        let meta = std::fs::symlink_metadata(path)
            .map_err(|e| SyncError::io(format!("stat {}", path.display()), e))?;
        let size = meta.len();
        let block_size = block_size_for(size);
        let blocks = self.hash_blocks(path, size, block_size).await?;
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok());
        let wire = bep::FileInfo {
            name: name.to_string(),
            r#type: bep::FileInfoType::File as i32,
            size: size as i64,
            block_size: block_size as i32,
            modified_s: modified.map(|d| d.as_secs() as i64).unwrap_or(0),
            modified_ns: modified.map(|d| d.subsec_nanos() as i32).unwrap_or(0),
            permissions: permissions_of(&meta),
            blocks,
            ..Default::default()
        };
        self.emit(folder_id, wire).await
    }

    async fn hash_blocks(
        &self,
        path: &Path,
        size: u64,
        block_size: u32,
    ) -> Result<Vec<bep::BlockInfo>, SyncError> {
        let count = block_count(size, block_size);
        let mut blocks = Vec::with_capacity(count as usize);
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| SyncError::io(format!("opening {}", path.display()), e))?;
        for index in 0..count {
            let offset = index * block_size as u64;
            let len = (size - offset).min(block_size as u64) as usize;
            let mut data = vec![0u8; len];
            file.read_exact(&mut data)
                .await
                .map_err(|e| SyncError::io(format!("reading {}", path.display()), e))?;
            let digest = self.hasher.digest(data).await?;
            blocks.push(bep::BlockInfo {
                offset: offset as i64,
                size: len as i32,
                hash: digest.hash.to_vec(),
                weak_hash: digest.weak,
            });
        }
        Ok(blocks)
    }

    async fn emit(&self, folder_id: &str, wire: bep::FileInfo) -> Result<(), SyncError> {
        self.diff_tx
            .send(DiffMsg::publish(ClusterDiff::local_update(folder_id, wire)))
            .await
            .map_err(|_| SyncError::Cancelled)
    }
}

fn permissions_of(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o7777
    }
    #[cfg(not(unix))]
    {
        let _ = meta;
        0
    }
}

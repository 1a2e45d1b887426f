//! Hasher pool: block digests on dedicated worker threads.
//!
//! The scanner and the controller both hand blocks here so the primary
//! strand never does bulk SHA-256 work. Requests are balanced onto the
//! worker with the fewest outstanding jobs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tracing::trace;

use spindrift_types::block::weak_hash;
use spindrift_types::SyncError;

/// Strong and weak digest of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDigest {
    /// SHA-256 of the block.
    pub hash: [u8; 32],
    /// Adler-style rolling hash.
    pub weak: u32,
}

/// SHA-256 of a byte slice; the synchronous path for small validations.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

struct Job {
    data: Vec<u8>,
    reply: oneshot::Sender<BlockDigest>,
}

struct Worker {
    tx: mpsc::Sender<Job>,
    outstanding: Arc<AtomicUsize>,
}

/// A fixed set of digest worker threads.
pub struct HasherPool {
    workers: Vec<Worker>,
}

impl HasherPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let workers = (0..threads.max(1))
            .map(|i| {
                let (tx, rx) = mpsc::channel::<Job>();
                let outstanding = Arc::new(AtomicUsize::new(0));
                let counter = outstanding.clone();
                thread::Builder::new()
                    .name(format!("hasher-{i}"))
                    .spawn(move || {
                        while let Ok(job) = rx.recv() {
                            let digest = BlockDigest {
                                hash: sha256(&job.data),
                                weak: weak_hash(&job.data),
                            };
                            counter.fetch_sub(1, Ordering::Relaxed);
                            let _ = job.reply.send(digest);
                        }
                    })
                    .expect("spawning hasher thread");
                Worker { tx, outstanding }
            })
            .collect();
        Self { workers }
    }

    /// Number of worker threads.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Digest a block on the least-loaded worker.
    pub async fn digest(&self, data: Vec<u8>) -> Result<BlockDigest, SyncError> {
        let worker = self
            .workers
            .iter()
            .min_by_key(|w| w.outstanding.load(Ordering::Relaxed))
            .expect("pool has at least one worker");
        worker.outstanding.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        worker
            .tx
            .send(Job { data, reply })
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)
    }

    /// Digest `data` and compare against the expected block hash.
    pub async fn validate(&self, data: Vec<u8>, expected: &[u8; 32]) -> Result<(), SyncError> {
        let digest = self.digest(data).await?;
        if digest.hash != *expected {
            trace!("block digest mismatch");
            return Err(SyncError::DigestMismatch(
                "block content does not match its advertised hash".into(),
            ));
        }
        Ok(())
    }
}

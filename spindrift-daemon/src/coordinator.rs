//! The coordinator: single apply point and diff broker.
//!
//! Every produced diff arrives here, is applied to the cluster in arrival
//! order, serialized for the persistence actor, and fanned out to the
//! subscribed actors (file actor, peer actors). Order is preserved per
//! subscriber. A fatal apply failure taints the cluster, tells persistence
//! to stop writing, and triggers supervised shutdown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, trace, warn};

use spindrift_db::{serialize_diff, DbHandle};
use spindrift_model::diff::{AnyDiff, DiffMsg};
use spindrift_model::SharedCluster;

/// Shared registry of fan-out subscribers; peers join and leave at runtime.
#[derive(Clone, Default)]
pub struct SubscriberSet {
    inner: Arc<std::sync::Mutex<Vec<mpsc::UnboundedSender<Arc<AnyDiff>>>>>,
}

impl SubscriberSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; it sees every diff applied from now on.
    pub fn add(&self, sub: mpsc::UnboundedSender<Arc<AnyDiff>>) {
        self.inner.lock().expect("subscriber lock").push(sub);
    }

    fn snapshot(&self) -> Vec<mpsc::UnboundedSender<Arc<AnyDiff>>> {
        let mut subs = self.inner.lock().expect("subscriber lock");
        subs.retain(|s| !s.is_closed());
        subs.clone()
    }
}

/// The diff broker. Build, subscribe, then run.
pub struct Coordinator {
    cluster: SharedCluster,
    rx: mpsc::Receiver<DiffMsg>,
    db: Option<DbHandle>,
    subscribers: SubscriberSet,
    fatal_tx: mpsc::Sender<String>,
}

impl Coordinator {
    /// Build the coordinator and its submission sender.
    pub fn new(
        cluster: SharedCluster,
        db: Option<DbHandle>,
        subscribers: SubscriberSet,
        fatal_tx: mpsc::Sender<String>,
    ) -> (Self, mpsc::Sender<DiffMsg>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                cluster,
                rx,
                db,
                subscribers,
                fatal_tx,
            },
            tx,
        )
    }

    /// Broker loop. Ends when every submission sender is gone.
    pub async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            let DiffMsg { diff, ack } = msg;

            let (result, tainted) = {
                let mut cluster = self.cluster.lock().expect("cluster lock");
                let result = match &diff {
                    AnyDiff::Cluster(d) => cluster.apply(d),
                    AnyDiff::Block(d) => cluster.apply_block(d),
                };
                (result, cluster.is_tainted())
            };

            let applied = result.is_ok();
            if let Err(e) = &result {
                warn!(error = %e, "diff apply failed");
            }

            // ack before fan-out: a submitter waiting on the ack must be
            // free to drain its own subscription channel
            if let Some(ack) = ack {
                let _ = ack.send(result);
            }

            if tainted {
                error!("cluster is tainted; requesting shutdown");
                if let Some(db) = &self.db {
                    db.taint().await;
                }
                let _ = self.fatal_tx.send("cluster tainted".into()).await;
                continue;
            }
            if !applied {
                continue;
            }

            if let Some(db) = &self.db {
                if let AnyDiff::Cluster(cluster_diff) = &diff {
                    let ops = {
                        let cluster = self.cluster.lock().expect("cluster lock");
                        serialize_diff(cluster_diff, &cluster)
                    };
                    match ops {
                        Ok(ops) if !ops.is_empty() => {
                            if let Err(e) = db.apply(ops, cluster_diff.force_commit()).await {
                                warn!(error = %e, "persistence submission failed");
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "diff serialization failed"),
                    }
                }
            }

            let subs = self.subscribers.snapshot();
            trace!(subscribers = subs.len(), "fanning out");
            let shared = Arc::new(diff);
            for sub in subs {
                let _ = sub.send(shared.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindrift_model::diff::ClusterDiff;
    use spindrift_model::{Cluster, Device};
    use spindrift_types::records::FolderRecord;
    use spindrift_types::DeviceId;
    use std::sync::Mutex;

    fn shared_cluster() -> SharedCluster {
        Arc::new(Mutex::new(Cluster::new(Device::new(
            DeviceId::from_sha256([1; 32]),
            "local",
        ))))
    }

    #[tokio::test]
    async fn diffs_apply_in_order_and_fan_out() {
        let cluster = shared_cluster();
        let (fatal_tx, _fatal_rx) = mpsc::channel(4);
        let subscribers = SubscriberSet::new();
        let (coordinator, tx) =
            Coordinator::new(cluster.clone(), None, subscribers.clone(), fatal_tx);
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        subscribers.add(sub_tx);
        tokio::spawn(coordinator.run());

        let (ack, ack_rx) = tokio::sync::oneshot::channel();
        tx.send(DiffMsg {
            diff: AnyDiff::Cluster(ClusterDiff::create_folder(FolderRecord {
                id: "f".into(),
                path: "/tmp/f".into(),
                ..Default::default()
            })),
            ack: Some(ack),
        })
        .await
        .unwrap();
        ack_rx.await.unwrap().unwrap();

        assert!(cluster.lock().unwrap().folder("f").is_some());
        let fanned = sub_rx.recv().await.unwrap();
        assert!(matches!(&*fanned, AnyDiff::Cluster(ClusterDiff::CreateFolder(_))));
    }

    #[tokio::test]
    async fn failed_diffs_are_acked_but_not_fanned_out() {
        let cluster = shared_cluster();
        let (fatal_tx, _fatal_rx) = mpsc::channel(4);
        let subscribers = SubscriberSet::new();
        let (coordinator, tx) =
            Coordinator::new(cluster.clone(), None, subscribers.clone(), fatal_tx);
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        subscribers.add(sub_tx);
        tokio::spawn(coordinator.run());

        let (ack, ack_rx) = tokio::sync::oneshot::channel();
        tx.send(DiffMsg {
            diff: AnyDiff::Cluster(ClusterDiff::share_folder(
                DeviceId::from_sha256([9; 32]),
                "no-such-folder",
            )),
            ack: Some(ack),
        })
        .await
        .unwrap();
        assert!(ack_rx.await.unwrap().is_err());
        assert!(sub_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn taint_triggers_fatal_shutdown_signal() {
        let cluster = shared_cluster();
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let (coordinator, tx) =
            Coordinator::new(cluster.clone(), None, SubscriberSet::new(), fatal_tx);
        tokio::spawn(coordinator.run());

        // a dangling load part is a db-kind failure, which taints
        tx.send(DiffMsg::publish(ClusterDiff::LoadCluster(
            spindrift_model::diff::LoadCluster {
                parts: vec![spindrift_model::diff::LoadPart::FileInfos(vec![(
                    1u64.to_be_bytes().to_vec(),
                    vec![],
                )])],
            },
        )))
        .await
        .unwrap();

        let reason = fatal_rx.recv().await.unwrap();
        assert_eq!(reason, "cluster tainted");
        assert!(cluster.lock().unwrap().is_tainted());
    }
}

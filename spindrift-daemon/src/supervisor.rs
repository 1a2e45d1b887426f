//! Daemon wiring: persistence, coordinator, filesystem actors, peer
//! connections, rescan timers and shutdown propagation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use spindrift_db::DbActor;
use spindrift_fs::{FileActor, FsHandle, HasherPool, ScanActor, ScanHandle};
use spindrift_model::diff::{AnyDiff, ClusterDiff, DiffMsg, ShareFolder};
use spindrift_model::{Cluster, Device, SharedCluster};
use spindrift_net::{Controller, PeerActor, PeerConfig, TcpTransport, Transport};
use spindrift_types::bep::Compression;
use spindrift_types::{DeviceId, ErrorKind};

use crate::config::Config;
use crate::coordinator::{Coordinator, SubscriberSet};

/// Run the daemon until interrupted or a fatal model error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let local_id = local_device_id(&config)?;
    info!(device = %local_id, name = config.device.name, "starting");

    // persistence actor owns the environment exclusively
    let (db_actor, db) = DbActor::open(&config.db.path, config.db.uncommitted_threshold)
        .with_context(|| format!("opening database at {}", config.db.path.display()))?;
    let db_task = tokio::spawn(db_actor.run());

    // reconstruct the cluster before anything else runs
    let cluster: SharedCluster = Arc::new(std::sync::Mutex::new(Cluster::new(Device::new(
        local_id,
        config.device.name.clone(),
    ))));
    let load = db.load_cluster().await.context("loading cluster")?;
    {
        let mut cluster = cluster.lock().expect("cluster lock");
        cluster
            .apply(&ClusterDiff::LoadCluster(load))
            .context("applying loaded cluster")?;
        info!(
            devices = cluster.devices().count(),
            folders = cluster.folders().count(),
            blocks = cluster.blocks().len(),
            "cluster loaded"
        );
    }

    let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
    let subscribers = SubscriberSet::new();
    let (coordinator, diff_tx) = Coordinator::new(
        cluster.clone(),
        Some(db.clone()),
        subscribers.clone(),
        fatal_tx,
    );
    tokio::spawn(coordinator.run());

    let hasher = Arc::new(HasherPool::new(config.hasher.threads));

    let (file_actor, fs_handle, fs_sub, mut fs_events) =
        FileActor::new(cluster.clone(), config.fs.mmap_cache_size, diff_tx.clone());
    subscribers.add(fs_sub);
    tokio::spawn(file_actor.run());

    let (scan_actor, scan_handle) =
        ScanActor::new(cluster.clone(), hasher.clone(), diff_tx.clone());
    tokio::spawn(scan_actor.run());

    reconcile_config(&config, &diff_tx).await?;

    // file-actor failures go to the controllers of every connected peer
    let controllers: Arc<std::sync::Mutex<Vec<spindrift_net::ControllerHandle>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    {
        let controllers = controllers.clone();
        tokio::spawn(async move {
            while let Some(event) = fs_events.recv().await {
                if let spindrift_fs::FsEvent::FileFailed {
                    folder_id, name, ..
                } = event
                {
                    let handles: Vec<_> =
                        controllers.lock().expect("controller lock").clone();
                    for handle in handles {
                        handle.file_failed(folder_id.clone(), name.clone()).await;
                    }
                }
            }
        });
    }

    spawn_rescan_timers(&config, scan_handle.clone());
    spawn_listener(&config).await?;
    spawn_dialers(
        &config,
        cluster.clone(),
        diff_tx.clone(),
        fs_handle,
        hasher,
        subscribers,
        controllers,
    )?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        reason = fatal_rx.recv() => {
            warn!(reason = reason.as_deref().unwrap_or("unknown"), "fatal error, shutting down");
        }
    }

    // final force-commit before the process exits
    db.shutdown().await.context("final database commit")?;
    db_task.await.ok();
    Ok(())
}

fn local_device_id(config: &Config) -> anyhow::Result<DeviceId> {
    match &config.device.id {
        Some(text) => text
            .parse()
            .with_context(|| format!("parsing local device id '{text}'")),
        None => {
            let mut digest = [0u8; 32];
            getrandom::getrandom(&mut digest).context("generating device id")?;
            let id = DeviceId::from_sha256(digest);
            warn!(device = %id, "no device id configured; generated an ephemeral one");
            Ok(id)
        }
    }
}

/// Bring the model in line with the configuration file: devices, folders,
/// shares and ignore lists all flow through regular diffs so they persist.
async fn reconcile_config(
    config: &Config,
    diff_tx: &mpsc::Sender<DiffMsg>,
) -> anyhow::Result<()> {
    let mut diffs: Vec<ClusterDiff> = Vec::new();
    for device in &config.devices {
        let id = device.device_id()?;
        diffs.push(ClusterDiff::update_peer(
            id.as_bytes().to_vec(),
            device.to_record(),
        ));
    }
    for folder in &config.folders {
        diffs.push(ClusterDiff::create_folder(folder.to_record()));
        for device in &folder.devices {
            let id: DeviceId = device
                .parse()
                .with_context(|| format!("parsing device id '{device}'"))?;
            diffs.push(ClusterDiff::ShareFolder(ShareFolder::new(id, &folder.id)));
        }
    }
    for ignored in &config.ignored_devices {
        let id: DeviceId = ignored
            .parse()
            .with_context(|| format!("parsing ignored device id '{ignored}'"))?;
        diffs.push(ClusterDiff::AddIgnoredDevice(
            spindrift_model::diff::AddIgnoredDevice {
                device: id,
                name: String::new(),
            },
        ));
    }
    for ignored in &config.ignored_folders {
        diffs.push(ClusterDiff::add_ignored_folder(&ignored.id, &ignored.label));
    }

    for diff in diffs {
        let (ack, rx) = tokio::sync::oneshot::channel();
        diff_tx
            .send(DiffMsg {
                diff: AnyDiff::Cluster(diff),
                ack: Some(ack),
            })
            .await
            .ok();
        if let Err(e) = rx.await.unwrap_or(Err(spindrift_types::SyncError::Cancelled)) {
            bail!("applying configuration: {e}");
        }
    }
    Ok(())
}

fn spawn_rescan_timers(config: &Config, scan: ScanHandle) {
    for folder in &config.folders {
        let folder_id = folder.id.clone();
        let interval = Duration::from_secs(folder.rescan_interval_secs.max(1) as u64);
        let scan = scan.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = scan.scan(folder_id.clone()).await {
                    warn!(folder = folder_id, error = %e, "scan failed");
                }
                tokio::time::sleep(interval).await;
            }
        });
    }
}

/// Accept loop. Inbound connections need the TLS front-end to provide the
/// authenticated certificate digest; a bare TCP connection cannot prove an
/// identity, so it is dropped with a log line.
async fn spawn_listener(config: &Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&config.net.bind_address)
        .await
        .with_context(|| format!("binding {}", config.net.bind_address))?;
    info!(address = %config.net.bind_address, "listening");
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((_, remote)) => {
                    warn!(%remote, "inbound connection without transport authentication, dropping");
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });
    Ok(())
}

/// One dial loop per configured, unpaused device with static addresses.
fn spawn_dialers(
    config: &Config,
    cluster: SharedCluster,
    diff_tx: mpsc::Sender<DiffMsg>,
    fs: FsHandle,
    hasher: Arc<HasherPool>,
    subscribers: SubscriberSet,
    controllers: Arc<std::sync::Mutex<Vec<spindrift_net::ControllerHandle>>>,
) -> anyhow::Result<()> {
    let connect_timeout = Duration::from_secs(config.net.connect_timeout_secs);
    let keepalive = Duration::from_secs(config.net.keepalive_secs);
    let request_timeout = Duration::from_secs(config.net.request_timeout_secs);
    let local_name = config.device.name.clone();

    for device in &config.devices {
        if device.paused || device.addresses.is_empty() {
            continue;
        }
        let peer_id = device.device_id()?;
        let compress = matches!(Compression::from(device.compression), Compression::Always);
        let addresses: Vec<String> = device
            .addresses
            .iter()
            .map(|a| a.trim_start_matches("tcp://").to_string())
            .collect();
        let cluster = cluster.clone();
        let diff_tx = diff_tx.clone();
        let fs = fs.clone();
        let hasher = hasher.clone();
        let subscribers = subscribers.clone();
        let controllers = controllers.clone();
        let local_name = local_name.clone();

        tokio::spawn(async move {
            let mut attempt = 0u32;
            loop {
                for address in &addresses {
                    debug!(peer = %peer_id.short(), address, "dialing");
                    match TcpTransport::connect(address, connect_timeout).await {
                        Ok(transport) => {
                            attempt = 0;
                            let (reason, kind) = run_connection(
                                peer_id,
                                Arc::new(transport),
                                &local_name,
                                keepalive,
                                request_timeout,
                                compress,
                                cluster.clone(),
                                diff_tx.clone(),
                                fs.clone(),
                                hasher.clone(),
                                &subscribers,
                                &controllers,
                            )
                            .await;
                            info!(peer = %peer_id.short(), reason, %kind, "connection ended");
                        }
                        Err(e) => {
                            debug!(peer = %peer_id.short(), address, error = %e, "dial failed");
                        }
                    }
                }
                attempt = attempt.saturating_add(1);
                tokio::time::sleep(reconnect_backoff(attempt)).await;
            }
        });
    }
    Ok(())
}

/// Wire one authenticated transport into a controller + peer actor pair and
/// drive it to completion.
#[allow(clippy::too_many_arguments)]
async fn run_connection(
    peer_id: DeviceId,
    transport: Arc<dyn Transport>,
    local_name: &str,
    keepalive: Duration,
    request_timeout: Duration,
    compress: bool,
    cluster: SharedCluster,
    diff_tx: mpsc::Sender<DiffMsg>,
    fs: FsHandle,
    hasher: Arc<HasherPool>,
    subscribers: &SubscriberSet,
    controllers: &Arc<std::sync::Mutex<Vec<spindrift_net::ControllerHandle>>>,
) -> (String, ErrorKind) {
    let (request_tx, request_rx) = mpsc::channel(64);
    let (controller, controller_handle) = Controller::new(
        peer_id,
        cluster.clone(),
        diff_tx.clone(),
        fs.clone(),
        hasher,
        request_tx,
        request_timeout,
    );
    controllers
        .lock()
        .expect("controller lock")
        .push(controller_handle.clone());
    let controller_task = tokio::spawn(controller.run());

    let peer_config = PeerConfig {
        device: peer_id,
        local_device_name: local_name.to_string(),
        keepalive,
        compress,
    };
    let (peer_actor, _peer_handle, peer_sub) = PeerActor::new(
        peer_config,
        transport,
        cluster,
        diff_tx,
        controller_handle,
        fs,
        request_rx,
    );
    subscribers.add(peer_sub);
    let outcome = peer_actor.run().await;
    controller_task.abort();
    outcome
}

/// Exponential reconnect backoff with jitter, capped at 30 seconds base.
fn reconnect_backoff(attempt: u32) -> Duration {
    let base = Duration::from_secs(2u64.pow(attempt.min(5)).min(30));
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    let jitter = Duration::from_millis(u64::from_le_bytes(bytes) % 5001);
    base + jitter
}

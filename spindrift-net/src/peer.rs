//! The peer actor: one per connected device.
//!
//! Owns the transport and the frame decoder, feeds events into the pure
//! [`Session`] machine and executes its actions: sending frames, submitting
//! diffs, serving requests through the file actor, and relaying responses to
//! the controller. Index updates for local changes are fanned in through the
//! coordinator subscription.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use spindrift_fs::{FsHandle, ReadOutcome};
use spindrift_model::diff::{AnyDiff, ClusterDiff, DiffMsg};
use spindrift_model::SharedCluster;
use spindrift_types::bep::{self, BepMessage};
use spindrift_types::wire::{encode_frame, encode_hello, FrameDecoder};
use spindrift_types::{DeviceId, ErrorKind, SyncError, CLIENT_NAME, CLIENT_VERSION};

use crate::controller::ControllerHandle;
use crate::session::{Session, SessionAction, SessionEvent};
use crate::transport::{Transport, TransportError};

/// Static parameters of one peer connection.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// The device this connection must authenticate as.
    pub device: DeviceId,
    /// Our device name for the hello.
    pub local_device_name: String,
    /// Keepalive ping interval.
    pub keepalive: Duration,
    /// Compress large payloads (peer preference is `always`).
    pub compress: bool,
}

/// Handle for shutting a peer connection down.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    shutdown_tx: mpsc::Sender<String>,
}

impl PeerHandle {
    /// Ask the peer actor to close gracefully.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        let _ = self.shutdown_tx.send(reason.into()).await;
    }
}

enum Flow {
    Continue,
    Stop(String, ErrorKind),
}

enum Exec {
    Continue,
    FollowUp(SessionEvent),
    Stop(String, ErrorKind),
}

/// The actor driving one peer connection.
pub struct PeerActor {
    config: PeerConfig,
    transport: Arc<dyn Transport>,
    session: Session,
    decoder: FrameDecoder,
    hello_done: bool,
    cluster: SharedCluster,
    diff_tx: mpsc::Sender<DiffMsg>,
    controller: ControllerHandle,
    fs: FsHandle,
    request_rx: mpsc::Receiver<bep::Request>,
    diff_rx: mpsc::UnboundedReceiver<Arc<AnyDiff>>,
    shutdown_rx: mpsc::Receiver<String>,
    last_heard: Instant,
}

impl PeerActor {
    /// Build the actor, its handle and its coordinator-subscription sender.
    #[allow(clippy::type_complexity)]
    pub fn new(
        config: PeerConfig,
        transport: Arc<dyn Transport>,
        cluster: SharedCluster,
        diff_tx: mpsc::Sender<DiffMsg>,
        controller: ControllerHandle,
        fs: FsHandle,
        request_rx: mpsc::Receiver<bep::Request>,
    ) -> (Self, PeerHandle, mpsc::UnboundedSender<Arc<AnyDiff>>) {
        let (sub_tx, diff_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);
        let session = Session::new(config.device);
        (
            Self {
                config,
                transport,
                session,
                decoder: FrameDecoder::new(),
                hello_done: false,
                cluster,
                diff_tx,
                controller,
                fs,
                request_rx,
                diff_rx,
                shutdown_rx,
                last_heard: Instant::now(),
            },
            PeerHandle { shutdown_tx },
            sub_tx,
        )
    }

    /// Drive the connection until it closes; returns the reason and kind.
    pub async fn run(mut self) -> (String, ErrorKind) {
        info!(peer = %self.config.device.short(), "peer connection starting");
        let started = SessionEvent::Started {
            peer_digest: self.transport.peer_digest(),
        };
        if let Flow::Stop(reason, kind) = self.dispatch(started).await {
            return self.teardown(reason, kind).await;
        }

        let mut keepalive = tokio::time::interval(self.config.keepalive);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            let flow = tokio::select! {
                received = self.transport.recv() => match received {
                    Ok(bytes) => {
                        self.last_heard = Instant::now();
                        self.on_bytes(&bytes).await
                    }
                    Err(TransportError::ConnectionClosed) => {
                        Flow::Stop("connection closed by peer".into(), ErrorKind::Cancelled)
                    }
                    Err(e) => Flow::Stop(e.to_string(), ErrorKind::Io),
                },
                request = self.request_rx.recv() => match request {
                    Some(request) => self.send_frame(BepMessage::Request(request)).await,
                    None => Flow::Continue,
                },
                diff = self.diff_rx.recv() => match diff {
                    Some(diff) => self.on_local_diff(&diff).await,
                    None => Flow::Continue,
                },
                reason = self.shutdown_rx.recv() => {
                    let reason = reason.unwrap_or_else(|| "shutting down".into());
                    self.dispatch(SessionEvent::ShutdownRequested { reason }).await
                }
                _ = keepalive.tick() => {
                    if self.last_heard.elapsed() > self.config.keepalive * 2 {
                        self.dispatch(SessionEvent::QuietTooLong).await
                    } else {
                        self.dispatch(SessionEvent::KeepaliveTick).await
                    }
                }
            };
            if let Flow::Stop(reason, kind) = flow {
                return self.teardown(reason, kind).await;
            }
        }
    }

    async fn teardown(&mut self, reason: String, kind: ErrorKind) -> (String, ErrorKind) {
        info!(peer = %self.config.device.short(), reason, %kind, "peer connection closing");
        let _ = self.transport.close().await;
        self.controller.peer_gone().await;
        (reason, kind)
    }

    async fn on_bytes(&mut self, bytes: &[u8]) -> Flow {
        self.decoder.push(bytes);
        if !self.hello_done {
            match self.decoder.next_hello() {
                Ok(Some(hello)) => {
                    debug!(
                        peer = %self.config.device.short(),
                        client = hello.client_name,
                        version = hello.client_version,
                        "hello received"
                    );
                    self.hello_done = true;
                    if let Flow::Stop(r, k) = self.dispatch(SessionEvent::HelloReceived(hello)).await
                    {
                        return Flow::Stop(r, k);
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(e) => return Flow::Stop(e.to_string(), e.kind()),
            }
        }
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => {
                    trace!(peer = %self.config.device.short(), r#type = ?frame.message_type(), "frame");
                    if let Flow::Stop(r, k) =
                        self.dispatch(SessionEvent::FrameReceived(frame)).await
                    {
                        return Flow::Stop(r, k);
                    }
                }
                Ok(None) => return Flow::Continue,
                Err(e) => return Flow::Stop(e.to_string(), e.kind()),
            }
        }
    }

    /// Announce a local change to this peer as an incremental IndexUpdate.
    async fn on_local_diff(&mut self, diff: &AnyDiff) -> Flow {
        if !self.session.is_online() {
            return Flow::Continue;
        }
        let (folder_id, name) = match diff {
            AnyDiff::Cluster(ClusterDiff::LocalUpdate(d)) => (&d.folder_id, &d.file.name),
            AnyDiff::Cluster(ClusterDiff::FinishFile(d)) => (&d.folder_id, &d.name),
            AnyDiff::Cluster(ClusterDiff::InvalidateFile(d)) => (&d.folder_id, &d.name),
            _ => return Flow::Continue,
        };
        let update = {
            let cluster = self.cluster.lock().expect("cluster lock");
            let shared = cluster.shared_with(folder_id, &self.config.device);
            let pushes = cluster
                .folder(folder_id)
                .map(|f| f.push_capable())
                .unwrap_or(false);
            if !(shared && pushes) {
                return Flow::Continue;
            }
            cluster
                .file_to_wire(folder_id, &cluster.local_id(), name)
                .map(|file| bep::IndexUpdate {
                    folder: folder_id.clone(),
                    files: vec![file],
                })
        };
        match update {
            Some(update) => self.send_frame(BepMessage::IndexUpdate(update)).await,
            None => Flow::Continue,
        }
    }

    /// Feed an event through the session machine, executing the resulting
    /// actions. Follow-up events (indexes-sent) are processed iteratively so
    /// the future stays finitely sized.
    async fn dispatch(&mut self, event: SessionEvent) -> Flow {
        let mut queue = std::collections::VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            for action in self.session.on_event(event) {
                match self.execute(action).await {
                    Exec::Continue => {}
                    Exec::FollowUp(event) => queue.push_back(event),
                    Exec::Stop(reason, kind) => return Flow::Stop(reason, kind),
                }
            }
        }
        Flow::Continue
    }

    fn lift(flow: Flow) -> Exec {
        match flow {
            Flow::Continue => Exec::Continue,
            Flow::Stop(reason, kind) => Exec::Stop(reason, kind),
        }
    }

    async fn execute(&mut self, action: SessionAction) -> Exec {
        match action {
            SessionAction::SendHello => {
                let hello = bep::Hello {
                    device_name: self.config.local_device_name.clone(),
                    client_name: CLIENT_NAME.into(),
                    client_version: CLIENT_VERSION.into(),
                };
                Self::lift(self.send_raw(encode_hello(&hello)).await)
            }
            SessionAction::SendClusterConfig => {
                let config = {
                    let cluster = self.cluster.lock().expect("cluster lock");
                    cluster.cluster_config_for(&self.config.device)
                };
                Self::lift(self.send_frame(BepMessage::ClusterConfig(config)).await)
            }
            SessionAction::SendIndexes => {
                let indexes: Vec<bep::Index> = {
                    let cluster = self.cluster.lock().expect("cluster lock");
                    cluster
                        .folders_shared_with(&self.config.device)
                        .iter()
                        .filter(|f| f.push_capable())
                        .map(|f| bep::Index {
                            folder: f.id.clone(),
                            files: cluster.index_snapshot(&f.id),
                        })
                        .collect()
                };
                for index in indexes {
                    debug!(
                        peer = %self.config.device.short(),
                        folder = index.folder,
                        files = index.files.len(),
                        "sending index"
                    );
                    if let Flow::Stop(r, k) = self.send_frame(BepMessage::Index(index)).await {
                        return Exec::Stop(r, k);
                    }
                }
                Exec::FollowUp(SessionEvent::IndexesSent)
            }
            SessionAction::ApplyClusterUpdate(config) => {
                let diff = ClusterDiff::cluster_update(self.config.device, config);
                match self.submit(diff).await {
                    Ok(()) => {
                        self.controller.ready().await;
                        Exec::Continue
                    }
                    Err(e) => Exec::Stop(e.to_string(), e.kind()),
                }
            }
            SessionAction::ApplyIndex { folder, files } => {
                let diff = ClusterDiff::update_folder(self.config.device, folder, files);
                match self.submit(diff).await {
                    Ok(()) => {
                        self.controller.ready().await;
                        Exec::Continue
                    }
                    Err(e) => Exec::Stop(e.to_string(), e.kind()),
                }
            }
            SessionAction::ServeRequest(request) => Self::lift(self.serve(request).await),
            SessionAction::DeliverResponse(response) => {
                self.controller.response(response).await;
                Exec::Continue
            }
            SessionAction::SendPing => {
                Self::lift(self.send_frame(BepMessage::Ping(bep::Ping {})).await)
            }
            SessionAction::SendClose { reason } => {
                // best effort; the connection is on its way down
                let _ = self
                    .transport
                    .send(&encode_frame(&BepMessage::Close(bep::Close { reason }), false))
                    .await;
                Exec::Continue
            }
            SessionAction::Close { reason, kind } => Exec::Stop(reason, kind),
        }
    }

    /// Serve an inbound block request from local storage.
    async fn serve(&mut self, request: bep::Request) -> Flow {
        let permitted = {
            let cluster = self.cluster.lock().expect("cluster lock");
            cluster.shared_with(&request.folder, &self.config.device)
        };
        let (data, code) = if !permitted {
            warn!(
                peer = %self.config.device.short(),
                folder = request.folder,
                "request for unshared folder"
            );
            (Vec::new(), bep::ErrorCode::Generic)
        } else {
            match self
                .fs
                .read_block(
                    request.folder.clone(),
                    request.name.clone(),
                    request.offset.max(0) as u64,
                    request.size.max(0) as u32,
                    request.from_temporary,
                )
                .await
            {
                Ok(ReadOutcome::Data(data)) => {
                    if !request.hash.is_empty()
                        && spindrift_fs::sha256(&data).as_slice() != request.hash.as_slice()
                    {
                        (Vec::new(), bep::ErrorCode::InvalidFile)
                    } else {
                        (data, bep::ErrorCode::NoError)
                    }
                }
                Ok(ReadOutcome::NoSuchFile) => (Vec::new(), bep::ErrorCode::NoSuchFile),
                Ok(ReadOutcome::InvalidFile) => (Vec::new(), bep::ErrorCode::InvalidFile),
                Err(_) => (Vec::new(), bep::ErrorCode::Generic),
            }
        };
        self.send_frame(BepMessage::Response(bep::Response {
            id: request.id,
            data,
            code: code as i32,
        }))
        .await
    }

    async fn submit(&self, diff: ClusterDiff) -> Result<(), SyncError> {
        let (ack, rx) = tokio::sync::oneshot::channel();
        self.diff_tx
            .send(DiffMsg {
                diff: AnyDiff::Cluster(diff),
                ack: Some(ack),
            })
            .await
            .map_err(|_| SyncError::Cancelled)?;
        rx.await.map_err(|_| SyncError::Cancelled)?
    }

    async fn send_frame(&mut self, message: BepMessage) -> Flow {
        self.send_raw(encode_frame(&message, self.config.compress))
            .await
    }

    async fn send_raw(&mut self, bytes: Vec<u8>) -> Flow {
        match self.transport.send(&bytes).await {
            Ok(()) => Flow::Continue,
            Err(e) => Flow::Stop(e.to_string(), ErrorKind::Io),
        }
    }
}

//! BEP session state machine - NO I/O, just state transitions.
//!
//! The machine consumes events (transport readiness, decoded frames, timer
//! ticks) and yields the new state plus actions for the peer actor to
//! execute (send a frame, apply a diff, close). All protocol legality checks
//! live here, which makes them unit-testable without a network.

use spindrift_model::Cluster;
use spindrift_types::bep::{self, BepMessage};
use spindrift_types::{DeviceId, ErrorKind};

/// Connection lifecycle states after the transport is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Transport connected; hello not yet exchanged.
    Handshaking,
    /// Hellos exchanged; waiting for the peer's ClusterConfig.
    HelloExchanged,
    /// ClusterConfigs exchanged; index snapshots are being sent.
    ClusterExchanged,
    /// Fully synchronized message flow.
    Online,
    /// Terminal; the peer actor tears down.
    Closing {
        /// Why the session ended.
        reason: String,
    },
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The transport is connected and reports the authenticated digest.
    Started {
        /// Certificate digest from the transport layer, when known.
        peer_digest: Option<[u8; 32]>,
    },
    /// The peer's hello arrived.
    HelloReceived(bep::Hello),
    /// A post-hello frame arrived.
    FrameReceived(BepMessage),
    /// The index snapshots queued by `SendIndexes` are on the wire.
    IndexesSent,
    /// Keepalive timer fired.
    KeepaliveTick,
    /// Nothing was heard from the peer for too long.
    QuietTooLong,
    /// Local shutdown.
    ShutdownRequested {
        /// Reason announced to the peer.
        reason: String,
    },
}

/// Instructions for the peer actor; the machine never performs I/O itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Send magic + hello.
    SendHello,
    /// Send our ClusterConfig for this peer.
    SendClusterConfig,
    /// Send full Index snapshots for mutually shared folders, then feed
    /// [`SessionEvent::IndexesSent`] back in.
    SendIndexes,
    /// Submit a cluster-update diff for the peer's ClusterConfig.
    ApplyClusterUpdate(bep::ClusterConfig),
    /// Submit an update-folder diff for an Index or IndexUpdate.
    ApplyIndex {
        /// The folder.
        folder: String,
        /// Incoming file entries.
        files: Vec<bep::FileInfo>,
    },
    /// Serve an inbound block request.
    ServeRequest(bep::Request),
    /// Hand a response to the controller.
    DeliverResponse(bep::Response),
    /// Send a keepalive ping.
    SendPing,
    /// Send a Close frame before tearing down.
    SendClose {
        /// Reason announced to the peer.
        reason: String,
    },
    /// Tear the connection down.
    Close {
        /// Why.
        reason: String,
        /// Error classification for supervision.
        kind: ErrorKind,
    },
}

/// The per-connection protocol state.
#[derive(Debug)]
pub struct Session {
    expected: DeviceId,
    state: SessionState,
}

impl Session {
    /// A session expecting to talk to `expected`.
    pub fn new(expected: DeviceId) -> Self {
        Self {
            expected,
            state: SessionState::Handshaking,
        }
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Whether the session reached the synchronized flow.
    pub fn is_online(&self) -> bool {
        matches!(self.state, SessionState::Online)
    }

    /// Whether the session is terminal.
    pub fn is_closing(&self) -> bool {
        matches!(self.state, SessionState::Closing { .. })
    }

    fn close(&mut self, reason: impl Into<String>, kind: ErrorKind) -> Vec<SessionAction> {
        let reason = reason.into();
        self.state = SessionState::Closing {
            reason: reason.clone(),
        };
        vec![SessionAction::Close { reason, kind }]
    }

    /// Process one event.
    pub fn on_event(&mut self, event: SessionEvent) -> Vec<SessionAction> {
        if self.is_closing() {
            return vec![];
        }
        match event {
            SessionEvent::Started { peer_digest } => {
                if !matches!(self.state, SessionState::Handshaking) {
                    return vec![];
                }
                match peer_digest {
                    Some(digest) if digest != *self.expected.as_bytes() => self.close(
                        format!(
                            "certificate digest does not match device {}",
                            self.expected.short()
                        ),
                        ErrorKind::AuthFailure,
                    ),
                    _ => vec![SessionAction::SendHello],
                }
            }
            SessionEvent::HelloReceived(_) => match self.state {
                SessionState::Handshaking => {
                    self.state = SessionState::HelloExchanged;
                    vec![SessionAction::SendClusterConfig]
                }
                _ => self.close("unexpected second hello", ErrorKind::ProtocolViolation),
            },
            SessionEvent::FrameReceived(frame) => self.on_frame(frame),
            SessionEvent::IndexesSent => {
                if matches!(self.state, SessionState::ClusterExchanged) {
                    self.state = SessionState::Online;
                }
                vec![]
            }
            SessionEvent::KeepaliveTick => {
                if self.is_online() {
                    vec![SessionAction::SendPing]
                } else {
                    vec![]
                }
            }
            SessionEvent::QuietTooLong => {
                let mut actions = vec![SessionAction::SendClose {
                    reason: "keepalive timeout".into(),
                }];
                actions.extend(self.close("keepalive timeout", ErrorKind::Timeout));
                actions
            }
            SessionEvent::ShutdownRequested { reason } => {
                let mut actions = vec![SessionAction::SendClose {
                    reason: reason.clone(),
                }];
                actions.extend(self.close(reason, ErrorKind::Cancelled));
                actions
            }
        }
    }

    fn on_frame(&mut self, frame: BepMessage) -> Vec<SessionAction> {
        match (&self.state, frame) {
            (SessionState::HelloExchanged, BepMessage::ClusterConfig(config)) => {
                self.state = SessionState::ClusterExchanged;
                vec![
                    SessionAction::ApplyClusterUpdate(config),
                    SessionAction::SendIndexes,
                ]
            }
            // a peer may announce folder changes at any time once online
            (SessionState::Online, BepMessage::ClusterConfig(config)) => vec![
                SessionAction::ApplyClusterUpdate(config),
                SessionAction::SendIndexes,
            ],
            (
                SessionState::ClusterExchanged | SessionState::Online,
                BepMessage::Index(bep::Index { folder, files }),
            ) => vec![SessionAction::ApplyIndex { folder, files }],
            (
                SessionState::ClusterExchanged | SessionState::Online,
                BepMessage::IndexUpdate(bep::IndexUpdate { folder, files }),
            ) => vec![SessionAction::ApplyIndex { folder, files }],
            (
                SessionState::ClusterExchanged | SessionState::Online,
                BepMessage::Request(request),
            ) => vec![SessionAction::ServeRequest(request)],
            (
                SessionState::ClusterExchanged | SessionState::Online,
                BepMessage::Response(response),
            ) => vec![SessionAction::DeliverResponse(response)],
            (_, BepMessage::Ping(_)) => vec![],
            (_, BepMessage::DownloadProgress(_)) => vec![],
            (_, BepMessage::Close(close)) => {
                let reason = if close.reason.is_empty() {
                    "closed by peer".to_string()
                } else {
                    close.reason
                };
                self.close(reason, ErrorKind::Cancelled)
            }
            (state, frame) => {
                let reason = format!(
                    "unexpected {:?} in state {:?}",
                    frame.message_type(),
                    state
                );
                self.close(reason, ErrorKind::ProtocolViolation)
            }
        }
    }
}

/// Folders in `config` whose entry about the local device carries a
/// different index id than ours: the peer considers our sequence reset and
/// needs a full re-index.
pub fn reindex_folders(
    cluster: &Cluster,
    peer: &DeviceId,
    config: &bep::ClusterConfig,
) -> Vec<String> {
    let local_id = cluster.local_id();
    let mut out = Vec::new();
    for folder in &config.folders {
        if !cluster.shared_with(&folder.id, peer) {
            continue;
        }
        let Some(local_info) = cluster.local_folder_info(&folder.id) else {
            continue;
        };
        let stale = folder
            .devices
            .iter()
            .find(|d| d.id == local_id.as_bytes())
            .map(|d| d.index_id != local_info.index_id)
            .unwrap_or(false);
        if stale {
            out.push(folder.id.clone());
        }
    }
    out
}

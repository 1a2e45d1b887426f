//! # spindrift-net
//!
//! The network side of the engine: a pluggable [`transport`], the pure BEP
//! [`session`] state machine, the peer actor that drives a connection, and
//! the per-peer controller that schedules what to pull next.

#![warn(clippy::all)]

pub mod controller;
pub mod peer;
pub mod session;
pub mod transport;

pub use controller::{Controller, ControllerHandle, ControllerMsg};
pub use peer::{PeerActor, PeerConfig, PeerHandle};
pub use session::{reindex_folders, Session, SessionAction, SessionEvent, SessionState};
pub use transport::{MockTransport, TcpTransport, Transport, TransportError};

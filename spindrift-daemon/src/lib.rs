//! # spindrift-daemon
//!
//! Configuration, the coordinator diff broker, and the supervisor wiring
//! that assembles the engine into a running peer-to-peer sync daemon.

#![warn(clippy::all)]

pub mod config;
pub mod coordinator;
pub mod supervisor;

pub use config::{Config, ConfigError};
pub use coordinator::{Coordinator, SubscriberSet};

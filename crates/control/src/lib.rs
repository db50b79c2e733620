//! Worker control plane.
//!
//! A persistent connection from a long-running worker to its agent service:
//! the worker reports lifecycle status, progress and failure, and receives
//! control actions (`ack`, `cancel`). See [`ControlDaemon`] for the entry
//! point.

pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod ipc;
pub mod status;

pub use config::ControlConfig;
pub use connection::{ConnectOptions, Connection, ConnectionState, DisconnectReason};
pub use daemon::{ControlDaemon, ControlDaemonBuilder};
pub use dispatch::ActionDispatchTable;
pub use error::{
    CodecError, ConfigError, ConnectionError, ControlError, DecodingError, SendError, StatusError,
};
pub use frame::{ControlAction, InboundFrame, WorkerReport};
pub use ipc::AgentAddress;
pub use status::{LifecycleState, StatusSnapshot, StatusTracker};

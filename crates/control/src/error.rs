//! Error types for the worker control plane.

use std::io;

use crate::status::LifecycleState;

/// Malformed frame on either side of the codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),
}

#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("frame has no parts")]
    Empty,
    #[error("frame of {size} bytes exceeds limit of {limit} bytes")]
    Oversized { size: usize, limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid agent address '{0}'")]
    InvalidAddress(String),
    #[error("worker identity must not be empty")]
    EmptyIdentity,
    #[error("invalid connection options: {0}")]
    InvalidOptions(String),
    #[error("agent at {address} unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {address} after {timeout_ms}ms")]
    Timeout { address: String, timeout_ms: u64 },
    #[error("registration failed: {0}")]
    Handshake(String),
    #[error("receive loop already started")]
    AlreadyReceiving,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Encoding(#[from] CodecError),
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum StatusError {
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Umbrella error returned by [`crate::ControlDaemon`].
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = ControlError> = std::result::Result<T, E>;

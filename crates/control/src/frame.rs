//! Typed control frames.
//!
//! Inbound frames are decoded once into an [`InboundFrame`] and matched
//! exhaustively on [`ControlAction`]; outbound frames are built from a
//! [`WorkerReport`].

use std::fmt;

use crate::error::DecodingError;
use crate::status::LifecycleState;

pub const ACTION_REGISTER: &str = "register";
pub const ACTION_STATUS: &str = "status";
pub const ACTION_PROGRESS: &str = "progress";
pub const ACTION_ACK: &str = "ack";
pub const ACTION_CANCEL: &str = "cancel";

/// Agent → worker verbs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ControlAction {
    Ack,
    Cancel,
    Custom(String),
}

impl ControlAction {
    pub fn parse(name: &str) -> Self {
        match name {
            ACTION_ACK => ControlAction::Ack,
            ACTION_CANCEL => ControlAction::Cancel,
            other => ControlAction::Custom(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ControlAction::Ack => ACTION_ACK,
            ControlAction::Cancel => ACTION_CANCEL,
            ControlAction::Custom(name) => name,
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded agent → worker frame: the action plus `parts[1..]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub action: ControlAction,
    pub args: Vec<String>,
}

impl TryFrom<Vec<String>> for InboundFrame {
    type Error = DecodingError;

    fn try_from(parts: Vec<String>) -> Result<Self, Self::Error> {
        let mut iter = parts.into_iter();
        let name = iter.next().ok_or(DecodingError::Empty)?;
        Ok(Self {
            action: ControlAction::parse(&name),
            args: iter.collect(),
        })
    }
}

/// Worker → agent frames.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    Register {
        identity: String,
        ts: u64,
        nonce: String,
        signature: String,
    },
    Status {
        state: LifecycleState,
        message: String,
    },
    Progress(f64),
}

impl WorkerReport {
    pub fn to_parts(&self) -> Vec<String> {
        match self {
            WorkerReport::Register {
                identity,
                ts,
                nonce,
                signature,
            } => vec![
                ACTION_REGISTER.to_string(),
                identity.clone(),
                ts.to_string(),
                nonce.clone(),
                signature.clone(),
            ],
            WorkerReport::Status { state, message } => vec![
                ACTION_STATUS.to_string(),
                state.as_str().to_string(),
                message.clone(),
            ],
            WorkerReport::Progress(p) => {
                vec![ACTION_PROGRESS.to_string(), canonical_fraction(*p)]
            }
        }
    }
}

/// Shortest decimal that round-trips the value: `0.5`, `0.42`, `0`, `1`.
pub fn canonical_fraction(value: f64) -> String {
    // -0.0 passes range validation but would render as "-0"
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}

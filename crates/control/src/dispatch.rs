//! Inbound action dispatch.
//!
//! Frames are decoded into an [`InboundFrame`] and matched exhaustively on
//! [`ControlAction`]; `Custom` actions fall through to a name-keyed table and
//! then to the unknown-action handler. One handler per action name, last
//! registration wins.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::error::DecodingError;
use crate::frame::{ControlAction, InboundFrame};

/// Receives `parts[1..]` of the frame.
pub type ActionHandler = Box<dyn FnMut(&[String]) + Send + 'static>;
/// Receives the action name and `parts[1..]`.
pub type UnknownActionHandler = Box<dyn FnMut(&str, &[String]) + Send + 'static>;

pub struct ActionDispatchTable {
    ack: ActionHandler,
    cancel: ActionHandler,
    custom: HashMap<String, ActionHandler>,
    unknown: UnknownActionHandler,
}

impl Default for ActionDispatchTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDispatchTable {
    pub fn new() -> Self {
        Self {
            ack: Box::new(|args: &[String]| debug!(?args, "Agent acknowledged")),
            cancel: Box::new(|_: &[String]| debug!("Cancel received with no handler installed")),
            custom: HashMap::new(),
            unknown: Box::new(|action: &str, args: &[String]| {
                warn!(%action, arg_count = args.len(), "Ignoring unknown control action")
            }),
        }
    }

    pub fn register<F>(&mut self, action: &str, handler: F)
    where
        F: FnMut(&[String]) + Send + 'static,
    {
        let handler: ActionHandler = Box::new(handler);
        match ControlAction::parse(action) {
            ControlAction::Ack => self.ack = handler,
            ControlAction::Cancel => self.cancel = handler,
            ControlAction::Custom(name) => {
                self.custom.insert(name, handler);
            }
        }
    }

    pub fn set_unknown_handler<F>(&mut self, handler: F)
    where
        F: FnMut(&str, &[String]) + Send + 'static,
    {
        self.unknown = Box::new(handler);
    }

    pub fn is_registered(&self, action: &str) -> bool {
        match ControlAction::parse(action) {
            ControlAction::Ack | ControlAction::Cancel => true,
            ControlAction::Custom(name) => self.custom.contains_key(&name),
        }
    }

    /// Decode `parts` and run the matching handler.
    pub fn dispatch(&mut self, parts: Vec<String>) -> Result<(), DecodingError> {
        let frame = InboundFrame::try_from(parts)?;
        self.dispatch_frame(&frame);
        Ok(())
    }

    pub fn dispatch_frame(&mut self, frame: &InboundFrame) {
        match &frame.action {
            ControlAction::Ack => (self.ack)(&frame.args),
            ControlAction::Cancel => (self.cancel)(&frame.args),
            ControlAction::Custom(name) => match self.custom.get_mut(name) {
                Some(handler) => handler(&frame.args),
                None => (self.unknown)(name, &frame.args),
            },
        }
    }
}

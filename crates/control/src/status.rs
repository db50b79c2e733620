use std::fmt;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StatusError;

/// Worker lifecycle: `Pending → Running → {Completed | Faulted | Cancelled}`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Pending,
    Running,
    Completed,
    Faulted,
    Cancelled,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Pending => "pending",
            LifecycleState::Running => "running",
            LifecycleState::Completed => "completed",
            LifecycleState::Faulted => "faulted",
            LifecycleState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Completed | LifecycleState::Faulted | LifecycleState::Cancelled
        )
    }

    /// Whether `self -> next` moves forward. `Faulted` is reachable from
    /// everywhere, staying put is always fine.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        if next == LifecycleState::Faulted || *self == next {
            return true;
        }
        match self {
            LifecycleState::Pending => next != LifecycleState::Pending,
            LifecycleState::Running => next.is_terminal(),
            LifecycleState::Completed | LifecycleState::Faulted | LifecycleState::Cancelled => {
                false
            }
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub state: LifecycleState,
    pub progress: f64,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

struct TrackerState {
    state: LifecycleState,
    progress: f64,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

/// Single source of truth for the worker's lifecycle state and last-known
/// progress/error. Written from the caller and from the receive loop, so
/// every field sits behind one mutex.
pub struct StatusTracker {
    inner: Mutex<TrackerState>,
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerState {
                state: LifecycleState::Pending,
                progress: 0.0,
                error_message: None,
                updated_at: Utc::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // Holders never panic mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `next`, returning the previous state.
    pub fn set_state(&self, next: LifecycleState) -> Result<LifecycleState, StatusError> {
        let mut guard = self.lock();
        let previous = guard.state;
        if !previous.can_transition_to(next) {
            return Err(StatusError::InvalidTransition {
                from: previous,
                to: next,
            });
        }
        if previous != next {
            guard.state = next;
            guard.updated_at = Utc::now();
        }
        Ok(previous)
    }

    /// Enter `Faulted` and record `message`. Always allowed.
    pub fn fault(&self, message: impl Into<String>) -> LifecycleState {
        let mut guard = self.lock();
        let previous = guard.state;
        guard.state = LifecycleState::Faulted;
        guard.error_message = Some(message.into());
        guard.updated_at = Utc::now();
        previous
    }

    pub fn set_progress(&self, progress: f64) -> Result<(), StatusError> {
        if !(0.0..=1.0).contains(&progress) {
            return Err(StatusError::InvalidArgument(format!(
                "progress must be within [0, 1], got {}",
                progress
            )));
        }
        let mut guard = self.lock();
        guard.progress = progress;
        guard.updated_at = Utc::now();
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    pub fn error_message(&self) -> Option<String> {
        self.lock().error_message.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let guard = self.lock();
        StatusSnapshot {
            state: guard.state,
            progress: guard.progress,
            error_message: guard.error_message.clone(),
            updated_at: guard.updated_at,
        }
    }
}

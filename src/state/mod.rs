//! Per-subsystem processing state.
//!
//! [`SubsystemState`] is the closed set of states a (run, subsystem) pair can
//! be in. Ledger strings only appear at the [`SubsystemState::ledger_label`] /
//! [`SubsystemState::from_ledger_label`] boundary. [`decide`] turns the
//! persisted status into the next action of the coordinator.

mod store;

pub use store::StatusStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubsystemState {
    Unprocessed,
    InProgress,
    DcsError,
    ProcessingError,
    /// Processing succeeded, some output waits in the local store.
    StoreFailed,
    Done,
    Failed,
    /// The subsystem did not take part in the run.
    Skipped,
}

impl SubsystemState {
    pub const ALL: [SubsystemState; 8] = [
        Self::Unprocessed,
        Self::InProgress,
        Self::DcsError,
        Self::ProcessingError,
        Self::StoreFailed,
        Self::Done,
        Self::Failed,
        Self::Skipped,
    ];

    pub fn ledger_label(&self) -> &'static str {
        match self {
            Self::Unprocessed => "UNPROCESSED",
            Self::InProgress => "STARTED",
            Self::DcsError => "DCSERROR",
            Self::ProcessingError => "PPERROR",
            Self::StoreFailed => "STOREFAILED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_ledger_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.ledger_label() == label)
    }

    /// Terminal states never change without an explicit reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }
}

impl fmt::Display for SubsystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ledger_label())
    }
}

/// Persisted status of one (run, subsystem) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemStatus {
    pub state: SubsystemState,
    /// Number of attempts started so far.
    pub retry_count: u32,
    /// Operators were told about the failure.
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl SubsystemStatus {
    pub fn new(state: SubsystemState, retry_count: u32) -> Self {
        Self {
            state,
            retry_count,
            notified: false,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.last_error = Some(message.into());
        self
    }

    pub fn notified(mut self, notified: bool) -> Self {
        self.notified = notified;
        self
    }
}

/// What the coordinator does next for a (run, subsystem) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Start attempt number `attempt`.
    Attempt { attempt: u32 },
    /// An earlier run must finish this subsystem first.
    Defer,
    /// Only promote the objects left in the local store.
    Reconcile,
    /// Retries are exhausted; record `Failed`.
    Fail { retry_count: u32 },
    /// Already terminal. `renotify` is set for a failure whose operator
    /// notification was never confirmed.
    Skip { state: SubsystemState, renotify: bool },
}

/// Next action for a subsystem given its persisted status.
///
/// A persisted `InProgress` means the previous attempt died with the shuttle
/// and counts as a failed attempt. `blocked_by_earlier` only holds back new
/// attempts.
pub fn decide(status: Option<&SubsystemStatus>, max_retries: u32, blocked_by_earlier: bool) -> Decision {
    let next = match status {
        None => Decision::Attempt { attempt: 1 },
        Some(status) => match status.state {
            SubsystemState::Unprocessed => Decision::Attempt {
                attempt: status.retry_count + 1,
            },
            SubsystemState::InProgress
            | SubsystemState::DcsError
            | SubsystemState::ProcessingError => {
                if status.retry_count < max_retries {
                    Decision::Attempt {
                        attempt: status.retry_count + 1,
                    }
                } else {
                    Decision::Fail {
                        retry_count: status.retry_count,
                    }
                }
            }
            SubsystemState::StoreFailed => Decision::Reconcile,
            SubsystemState::Failed => Decision::Skip {
                state: SubsystemState::Failed,
                renotify: !status.notified,
            },
            state @ (SubsystemState::Done | SubsystemState::Skipped) => Decision::Skip {
                state,
                renotify: false,
            },
        },
    };

    match next {
        Decision::Attempt { .. } if blocked_by_earlier => Decision::Defer,
        other => other,
    }
}

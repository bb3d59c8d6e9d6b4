//! Run ledger access.
//!
//! The ledger lists the runs the acquisition side has closed, their time
//! windows and free-form parameters, and carries one status string per
//! subsystem plus the `shuttle_done` flag. All writes are idempotent.

mod file;

pub use file::FileRunLedger;

use crate::core::{Result, RunNumber, TimeWindow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub number: RunNumber,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub run_type: String,
    /// Subsystems that took data; `None` means every configured subsystem.
    #[serde(default)]
    pub participants: Option<BTreeSet<String>>,
    /// Ledger status label per subsystem.
    #[serde(default)]
    pub statuses: BTreeMap<String, String>,
    #[serde(default)]
    pub shuttle_done: bool,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Run {
    pub fn new(number: RunNumber, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            number,
            start,
            end,
            run_type: String::new(),
            participants: None,
            statuses: BTreeMap::new(),
            shuttle_done: false,
            parameters: BTreeMap::new(),
        }
    }

    pub fn run_type(mut self, run_type: &str) -> Self {
        self.run_type = run_type.to_string();
        self
    }

    pub fn participant(mut self, subsystem: &str) -> Self {
        self.participants
            .get_or_insert_with(BTreeSet::new)
            .insert(subsystem.to_string());
        self
    }

    pub fn parameter(mut self, name: &str, value: &str) -> Self {
        self.parameters.insert(name.to_string(), value.to_string());
        self
    }

    /// Validated data-taking window.
    pub fn window(&self) -> Result<TimeWindow> {
        TimeWindow::new(self.start, self.end)
    }

    pub fn participates(&self, subsystem: &str) -> bool {
        self.participants
            .as_ref()
            .is_none_or(|participants| participants.contains(subsystem))
    }

    pub fn status_label(&self, subsystem: &str) -> Option<&str> {
        self.statuses.get(subsystem).map(String::as_str)
    }
}

#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Runs with `shuttle_done == false`, oldest first.
    async fn unfinished_runs(&self) -> Result<Vec<Run>>;

    async fn run(&self, number: RunNumber) -> Result<Option<Run>>;

    /// Set the status label of `subsystem`. Returns `false` when the ledger
    /// already held that label.
    async fn update_subsystem_status(&self, run: RunNumber, subsystem: &str, label: &str) -> Result<bool>;

    /// Drop the status of `subsystem` and reopen the run.
    async fn clear_subsystem_status(&self, run: RunNumber, subsystem: &str) -> Result<()>;

    async fn mark_run_done(&self, run: RunNumber) -> Result<()>;
}

use super::{Run, RunLedger};
use crate::core::{Result, RunNumber, ShuttleError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{Level, event};

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    runs: BTreeMap<RunNumber, Run>,
}

/// Run ledger kept in a single JSON document.
///
/// The document is re-read on every call so runs registered by another
/// process show up on the next pass.
pub struct FileRunLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRunLedger {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<LedgerDocument> {
        if !self.path.exists() {
            return Ok(LedgerDocument::default());
        }
        let bytes = fs::read(&self.path).await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            ShuttleError::Ledger(format!("parse ledger '{}': {}", self.path.display(), err))
        })
    }

    async fn write(&self, document: &LedgerDocument) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(document)?;
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    /// Record a closed run. Re-registering keeps the statuses already written.
    pub async fn register_run(&self, run: Run) -> Result<()> {
        run.window()?;
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        let number = run.number;
        match document.runs.get_mut(&number) {
            Some(existing) => {
                existing.start = run.start;
                existing.end = run.end;
                existing.run_type = run.run_type;
                existing.participants = run.participants;
                existing.parameters = run.parameters;
            }
            None => {
                document.runs.insert(number, run);
            }
        }
        self.write(&document).await?;
        event!(Level::DEBUG, run = number, "run registered");
        Ok(())
    }

    /// Every run, finished or not.
    pub async fn all_runs(&self) -> Result<Vec<Run>> {
        Ok(self.read().await?.runs.into_values().collect())
    }
}

#[async_trait]
impl RunLedger for FileRunLedger {
    async fn unfinished_runs(&self) -> Result<Vec<Run>> {
        let document = self.read().await?;
        Ok(document
            .runs
            .into_values()
            .filter(|run| !run.shuttle_done)
            .collect())
    }

    async fn run(&self, number: RunNumber) -> Result<Option<Run>> {
        Ok(self.read().await?.runs.remove(&number))
    }

    async fn update_subsystem_status(&self, run: RunNumber, subsystem: &str, label: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        let entry = document
            .runs
            .get_mut(&run)
            .ok_or(ShuttleError::RunNotFound(run))?;

        if entry.status_label(subsystem) == Some(label) {
            return Ok(false);
        }
        entry
            .statuses
            .insert(subsystem.to_string(), label.to_string());
        self.write(&document).await?;
        Ok(true)
    }

    async fn clear_subsystem_status(&self, run: RunNumber, subsystem: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        let entry = document
            .runs
            .get_mut(&run)
            .ok_or(ShuttleError::RunNotFound(run))?;
        entry.statuses.remove(subsystem);
        entry.shuttle_done = false;
        self.write(&document).await
    }

    async fn mark_run_done(&self, run: RunNumber) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut document = self.read().await?;
        let entry = document
            .runs
            .get_mut(&run)
            .ok_or(ShuttleError::RunNotFound(run))?;
        if entry.shuttle_done {
            return Ok(());
        }
        entry.shuttle_done = true;
        self.write(&document).await
    }
}

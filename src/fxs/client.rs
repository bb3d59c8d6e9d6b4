use super::{FileExchangeServer, FxsEntry, FxsFileRecord, FxsSystem};
use crate::core::{Result, RunNumber, ShuttleError};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tracing::{Level, event};

pub const MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// Per-attempt view of the file exchange servers for one run and subsystem.
pub struct FileExchangeClient {
    run: RunNumber,
    subsystem: String,
    servers: BTreeMap<FxsSystem, Arc<dyn FileExchangeServer>>,
    download_dir: PathBuf,
    retrieved: Vec<FxsFileRecord>,
}

impl FileExchangeClient {
    pub fn new(run: RunNumber, subsystem: &str, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            run,
            subsystem: subsystem.to_string(),
            servers: BTreeMap::new(),
            download_dir: download_dir.into(),
            retrieved: Vec::new(),
        }
    }

    pub fn with_server(mut self, system: FxsSystem, server: Arc<dyn FileExchangeServer>) -> Self {
        self.servers.insert(system, server);
        self
    }

    fn server(&self, system: FxsSystem) -> Result<&Arc<dyn FileExchangeServer>> {
        self.servers.get(&system).ok_or_else(|| {
            ShuttleError::FileExchange(format!("no {} file exchange server configured", system))
        })
    }

    pub async fn locate(
        &self,
        system: FxsSystem,
        file_id: &str,
        source: Option<&str>,
    ) -> Result<Option<FxsEntry>> {
        self.server(system)?
            .locate(self.run, &self.subsystem, file_id, source)
            .await
    }

    pub async fn sources(&self, system: FxsSystem, file_id: &str) -> Result<Vec<String>> {
        let mut sources = self
            .server(system)?
            .sources(self.run, &self.subsystem, file_id)
            .await?;
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    /// Copy `entry` into the download directory, retrying transient failures.
    pub async fn download(&self, system: FxsSystem, entry: &FxsEntry) -> Result<PathBuf> {
        let server = self.server(system)?;
        let file_name = match &entry.source {
            Some(source) => format!("{}_{}", entry.file_id, source),
            None => entry.file_id.clone(),
        };
        let destination = self
            .download_dir
            .join(system.as_str())
            .join(&self.subsystem)
            .join(sanitize(&file_name));
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut last_error = None;
        for attempt in 1..=MAX_DOWNLOAD_ATTEMPTS {
            let outcome = match server.fetch(entry, &destination).await {
                Ok(()) => verify_size(&destination, entry.size).await,
                Err(err) => Err(err),
            };
            match outcome {
                Ok(()) => return Ok(destination),
                Err(err) => {
                    event!(
                        Level::WARN,
                        system = %system,
                        file_id = %entry.file_id,
                        attempt,
                        error = %err,
                        "file exchange download failed"
                    );
                    last_error = Some(err);
                }
            }
        }

        Err(ShuttleError::FileExchange(format!(
            "download of {} '{}' failed after {} attempts: {}",
            system,
            entry.file_id,
            MAX_DOWNLOAD_ATTEMPTS,
            last_error.map(|err| err.to_string()).unwrap_or_default()
        )))
    }

    /// Locate and download a file, remembering it for `mark_consumed`.
    ///
    /// Returns `None` when the server has no such file.
    pub async fn get_file(
        &mut self,
        system: FxsSystem,
        file_id: &str,
        source: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        let Some(entry) = self.locate(system, file_id, source).await? else {
            event!(
                Level::INFO,
                system = %system,
                file_id,
                source = source.unwrap_or("-"),
                "file not found on file exchange server"
            );
            return Ok(None);
        };

        let local_path = self.download(system, &entry).await?;
        self.retrieved.push(FxsFileRecord {
            system,
            subsystem: self.subsystem.clone(),
            file_id: entry.file_id.clone(),
            source: entry.source.clone(),
            local_path: local_path.clone(),
        });
        Ok(Some(local_path))
    }

    pub fn records(&self) -> &[FxsFileRecord] {
        &self.retrieved
    }

    /// Write back the retrieval time of every file touched in this attempt.
    pub async fn mark_consumed(&mut self) -> Result<usize> {
        if self.retrieved.is_empty() {
            return Ok(0);
        }

        let mut by_system: BTreeMap<FxsSystem, Vec<FxsFileRecord>> = BTreeMap::new();
        for record in &self.retrieved {
            by_system.entry(record.system).or_default().push(record.clone());
        }

        let now = Utc::now();
        for (system, records) in &by_system {
            self.server(*system)?
                .mark_retrieved(self.run, &self.subsystem, records, now)
                .await?;
        }

        let marked = self.retrieved.len();
        self.retrieved.clear();
        Ok(marked)
    }
}

async fn verify_size(path: &std::path::Path, expected: u64) -> Result<()> {
    let actual = fs::metadata(path).await?.len();
    if actual != expected {
        return Err(ShuttleError::FileExchange(format!(
            "size mismatch for '{}': expected {} bytes, got {}",
            path.display(),
            expected,
            actual
        )));
    }
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect()
}

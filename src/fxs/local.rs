use super::{FileExchangeServer, FxsEntry, FxsFileRecord};
use crate::core::{Result, RunNumber, ShuttleError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

const CATALOG_FILE: &str = "catalog.json";

/// File exchange server backed by a directory.
///
/// Files live under `<root>/files/<run>/<subsystem>/` and the lookup table is
/// `<root>/catalog.json`. The catalog is re-read on every call so entries
/// published by another process are visible.
pub struct LocalFxsServer {
    root: PathBuf,
    catalog_lock: Mutex<()>,
}

impl LocalFxsServer {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            catalog_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    async fn read_catalog(&self) -> Result<Vec<FxsEntry>> {
        let path = self.catalog_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = fs::read(&path).await?;
        serde_json::from_slice(&bytes).map_err(|err| {
            ShuttleError::FileExchange(format!("parse catalog '{}': {}", path.display(), err))
        })
    }

    async fn write_catalog(&self, entries: &[FxsEntry]) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let path = self.catalog_path();
        let tmp_path = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(entries)?;
        fs::write(&tmp_path, json).await?;
        fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Publish a file as an upstream system would.
    pub async fn publish(
        &self,
        run: RunNumber,
        subsystem: &str,
        file_id: &str,
        source: Option<&str>,
        contents: &[u8],
    ) -> Result<FxsEntry> {
        let _guard = self.catalog_lock.lock().await;

        let file_name = match source {
            Some(source) => format!("{}_{}", file_id, source),
            None => file_id.to_string(),
        };
        let remote_path = PathBuf::from("files")
            .join(run.to_string())
            .join(subsystem)
            .join(file_name);
        let absolute = self.root.join(&remote_path);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&absolute, contents).await?;

        let entry = FxsEntry {
            run,
            subsystem: subsystem.to_string(),
            file_id: file_id.to_string(),
            source: source.map(str::to_string),
            remote_path,
            size: contents.len() as u64,
            retrieved_at: None,
        };

        let mut catalog = self.read_catalog().await?;
        catalog.retain(|existing| {
            !(existing.run == run
                && existing.subsystem == subsystem
                && existing.file_id == file_id
                && existing.source.as_deref() == source)
        });
        catalog.push(entry.clone());
        self.write_catalog(&catalog).await?;
        Ok(entry)
    }
}

#[async_trait]
impl FileExchangeServer for LocalFxsServer {
    async fn locate(
        &self,
        run: RunNumber,
        subsystem: &str,
        file_id: &str,
        source: Option<&str>,
    ) -> Result<Option<FxsEntry>> {
        let catalog = self.read_catalog().await?;
        Ok(catalog
            .into_iter()
            .find(|entry| entry.matches(run, subsystem, file_id, source)))
    }

    async fn sources(&self, run: RunNumber, subsystem: &str, file_id: &str) -> Result<Vec<String>> {
        let catalog = self.read_catalog().await?;
        Ok(catalog
            .into_iter()
            .filter(|entry| entry.matches(run, subsystem, file_id, None))
            .filter_map(|entry| entry.source)
            .collect())
    }

    async fn fetch(&self, entry: &FxsEntry, destination: &Path) -> Result<()> {
        let source = self.root.join(&entry.remote_path);
        fs::copy(&source, destination).await.map_err(|err| {
            ShuttleError::FileExchange(format!("copy '{}': {}", source.display(), err))
        })?;
        Ok(())
    }

    async fn mark_retrieved(
        &self,
        run: RunNumber,
        subsystem: &str,
        records: &[FxsFileRecord],
        at: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.catalog_lock.lock().await;
        let mut catalog = self.read_catalog().await?;
        let mut touched = 0usize;
        for entry in catalog.iter_mut() {
            let hit = records.iter().any(|record| {
                entry.matches(run, subsystem, &record.file_id, record.source.as_deref())
                    && entry.source == record.source
            });
            if hit {
                entry.retrieved_at = Some(at);
                touched += 1;
            }
        }
        if touched > 0 {
            self.write_catalog(&catalog).await?;
        }
        Ok(())
    }
}

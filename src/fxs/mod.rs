//! File exchange servers.
//!
//! Upstream systems (acquisition, slow control, trigger farm) publish
//! calibration input files keyed by run, subsystem, file id and source.
//! A plugin fetches them through [`FileExchangeClient`]; every file touched
//! during an attempt is written back as retrieved once the attempt is over.

mod client;
mod local;

pub use client::{FileExchangeClient, MAX_DOWNLOAD_ATTEMPTS};
pub use local::LocalFxsServer;

use crate::core::{Result, RunNumber};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FxsSystem {
    #[serde(rename = "DAQ")]
    Daq,
    #[serde(rename = "DCS")]
    Dcs,
    #[serde(rename = "HLT")]
    Hlt,
}

impl FxsSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daq => "DAQ",
            Self::Dcs => "DCS",
            Self::Hlt => "HLT",
        }
    }
}

impl fmt::Display for FxsSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FxsSystem {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DAQ" => Ok(Self::Daq),
            "DCS" => Ok(Self::Dcs),
            "HLT" => Ok(Self::Hlt),
            other => Err(format!("unknown file exchange system '{}'", other)),
        }
    }
}

/// Catalog row of one published file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxsEntry {
    pub run: RunNumber,
    pub subsystem: String,
    pub file_id: String,
    pub source: Option<String>,
    /// Location on the server, relative to its root.
    pub remote_path: PathBuf,
    pub size: u64,
    #[serde(default)]
    pub retrieved_at: Option<DateTime<Utc>>,
}

impl FxsEntry {
    pub fn matches(
        &self,
        run: RunNumber,
        subsystem: &str,
        file_id: &str,
        source: Option<&str>,
    ) -> bool {
        self.run == run
            && self.subsystem == subsystem
            && self.file_id == file_id
            && (source.is_none() || self.source.as_deref() == source)
    }
}

/// A file retrieved during the current attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FxsFileRecord {
    pub system: FxsSystem,
    pub subsystem: String,
    pub file_id: String,
    pub source: Option<String>,
    pub local_path: PathBuf,
}

#[async_trait]
pub trait FileExchangeServer: Send + Sync {
    async fn locate(
        &self,
        run: RunNumber,
        subsystem: &str,
        file_id: &str,
        source: Option<&str>,
    ) -> Result<Option<FxsEntry>>;

    async fn sources(&self, run: RunNumber, subsystem: &str, file_id: &str) -> Result<Vec<String>>;

    /// Copy the remote file to `destination`.
    async fn fetch(&self, entry: &FxsEntry, destination: &Path) -> Result<()>;

    async fn mark_retrieved(
        &self,
        run: RunNumber,
        subsystem: &str,
        records: &[FxsFileRecord],
        at: DateTime<Utc>,
    ) -> Result<()>;
}

//! Slow-control archive access.
//!
//! The coordinator retrieves every alias and data point a subsystem declares
//! before its plugin child is started. A failure here only ends the current
//! attempt of that subsystem.

mod client;
pub mod frame;

pub use client::ArchiveClient;

use crate::config::ArchiveEndpoint;
use crate::core::{ConditionsSample, ConditionsValueSet, ShuttleError, TimeWindow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// How a signal name is resolved by the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    Alias,
    DataPoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub signal: String,
    pub kind: SignalKind,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArchiveResponse {
    Values(Vec<ConditionsSample>),
    Rejected { code: u32, message: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArchiveError {
    /// The server understood the request and refused it.
    #[error("archive rejected '{signal}' (code {code}): {message}")]
    Rejected {
        signal: String,
        code: u32,
        message: String,
    },

    /// Connection, timeout or framing failure.
    #[error("archive transport failure talking to {address}: {message}")]
    Transport { address: String, message: String },
}

impl ArchiveError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<ArchiveError> for ShuttleError {
    fn from(err: ArchiveError) -> Self {
        ShuttleError::Archive(err.to_string())
    }
}

#[async_trait]
pub trait ConditionsArchive: Send + Sync {
    async fn fetch(
        &self,
        host: &str,
        port: u16,
        signal: &str,
        kind: SignalKind,
        window: &TimeWindow,
    ) -> std::result::Result<ConditionsValueSet, ArchiveError>;
}

/// Fetch every alias and data point of `endpoint` over `window`.
///
/// Stops at the first failing signal.
pub async fn retrieve_conditions(
    archive: &dyn ConditionsArchive,
    endpoint: &ArchiveEndpoint,
    window: &TimeWindow,
) -> std::result::Result<BTreeMap<String, ConditionsValueSet>, ArchiveError> {
    let requests = endpoint
        .aliases
        .iter()
        .map(|name| (name, SignalKind::Alias))
        .chain(
            endpoint
                .data_points
                .iter()
                .map(|name| (name, SignalKind::DataPoint)),
        );

    let mut values = BTreeMap::new();
    for (signal, kind) in requests {
        let set = archive
            .fetch(&endpoint.host, endpoint.port, signal, kind, window)
            .await?;
        values.insert(signal.clone(), set);
    }
    Ok(values)
}

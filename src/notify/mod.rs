//! Status telemetry and operator alerts.
//!
//! Delivery is best-effort: the coordinator logs a failed notification and
//! carries on.

use crate::config::NotificationPolicy;
use crate::core::{Result, RunNumber};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{Level, event};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub run: RunNumber,
    pub subsystem: String,
    pub status: String,
    pub retry_count: u32,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorAlert {
    pub run: RunNumber,
    pub subsystem: String,
    pub responsibles: Vec<String>,
    pub retry_count: u32,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish_status(&self, update: &StatusUpdate) -> Result<()>;

    /// Sent once per transition into `Failed`.
    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<()>;
}

/// Logs notifications instead of sending them anywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn publish_status(&self, update: &StatusUpdate) -> Result<()> {
        event!(
            Level::INFO,
            run = update.run,
            subsystem = %update.subsystem,
            status = %update.status,
            retry_count = update.retry_count,
            "status published"
        );
        Ok(())
    }

    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<()> {
        event!(
            Level::ERROR,
            run = alert.run,
            subsystem = %alert.subsystem,
            responsibles = %alert.responsibles.join(","),
            reason = %alert.reason,
            "subsystem failed, operators notified"
        );
        Ok(())
    }
}

/// Appends telemetry and alerts as JSON lines.
#[derive(Debug, Clone, Default)]
pub struct JsonlNotifier {
    telemetry_path: Option<PathBuf>,
    alerts_path: Option<PathBuf>,
}

impl JsonlNotifier {
    pub fn new(policy: &NotificationPolicy) -> Self {
        Self {
            telemetry_path: policy.telemetry_path.clone(),
            alerts_path: policy.alerts_path.clone(),
        }
    }

    async fn append<T: Serialize>(path: &Path, record: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for JsonlNotifier {
    async fn publish_status(&self, update: &StatusUpdate) -> Result<()> {
        match &self.telemetry_path {
            Some(path) => Self::append(path, update).await,
            None => Ok(()),
        }
    }

    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<()> {
        match &self.alerts_path {
            Some(path) => Self::append(path, alert).await,
            None => TracingNotifier.notify_operators(alert).await,
        }
    }
}

/// JSON-lines sinks when configured, log output otherwise.
pub fn from_policy(policy: &NotificationPolicy) -> Arc<dyn Notifier> {
    if policy.telemetry_path.is_none() && policy.alerts_path.is_none() {
        Arc::new(TracingNotifier)
    } else {
        Arc::new(JsonlNotifier::new(policy))
    }
}

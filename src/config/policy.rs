use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Child-process supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorPolicy {
    /// Interval between non-blocking checks of the child.
    pub poll_interval_ms: u64,
    /// Wall-clock budget of a plugin run when the subsystem sets none.
    pub default_timeout_secs: u64,
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            default_timeout_secs: 3_600,
        }
    }
}

/// Retry bounds for subsystem attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before a subsystem is marked failed for a run.
    pub max_retries: u32,
    /// Initial backoff for client-level retries in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff for client-level retries in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given (1-based) attempt.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Slow-control archive connection bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivePolicy {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Additional attempts after a transport failure.
    pub max_retries: u32,
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            request_timeout_ms: 60_000,
            max_retries: 2,
        }
    }
}

/// Where status telemetry and operator alerts go.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationPolicy {
    /// JSON-lines file receiving every published status.
    pub telemetry_path: Option<PathBuf>,
    /// JSON-lines file receiving operator alerts.
    pub alerts_path: Option<PathBuf>,
}

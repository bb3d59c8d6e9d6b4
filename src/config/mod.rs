//! Shuttle configuration.
//!
//! Loaded from a JSON document. Every policy block has a `Default`, so a
//! minimal document only needs the store roots, the ledger path and the
//! subsystem list.

mod policy;

pub use policy::{ArchivePolicy, NotificationPolicy, RetryPolicy, SupervisorPolicy};

use crate::core::{Result, ShuttleError};
use crate::fxs::FxsSystem;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Slow-control archive endpoint of one subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub data_points: Vec<String>,
}

impl ArchiveEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            aliases: Vec::new(),
            data_points: Vec::new(),
        }
    }

    pub fn alias(mut self, name: &str) -> Self {
        self.aliases.push(name.to_string());
        self
    }

    pub fn data_point(mut self, name: &str) -> Self {
        self.data_points.push(name.to_string());
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Per-subsystem processing record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubsystemConfig {
    pub name: String,

    /// Built-in plugin kind to register for this subsystem, if any
    #[serde(default)]
    pub plugin: Option<String>,

    /// Must not run before earlier unresolved runs of this subsystem
    #[serde(default)]
    pub strict_ordering: bool,

    /// Overrides `retry.max_retries`
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Overrides `supervisor.default_timeout_secs`
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub archive: Option<ArchiveEndpoint>,

    /// Operators notified when the subsystem fails for a run
    #[serde(default)]
    pub responsibles: Vec<String>,

    /// Free-form settings handed to the plugin
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

impl SubsystemConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            plugin: None,
            strict_ordering: false,
            max_retries: None,
            timeout_secs: None,
            archive: None,
            responsibles: Vec::new(),
            settings: BTreeMap::new(),
        }
    }

    pub fn plugin(mut self, kind: &str) -> Self {
        self.plugin = Some(kind.to_string());
        self
    }

    pub fn strict_ordering(mut self, strict: bool) -> Self {
        self.strict_ordering = strict;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn archive(mut self, endpoint: ArchiveEndpoint) -> Self {
        self.archive = Some(endpoint);
        self
    }

    pub fn responsible(mut self, operator: &str) -> Self {
        self.responsibles.push(operator.to_string());
        self
    }

    pub fn setting(mut self, key: &str, value: &str) -> Self {
        self.settings.insert(key.to_string(), value.to_string());
        self
    }
}

/// Roots of the three object stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorePaths {
    pub primary: PathBuf,
    pub reference: PathBuf,
    pub local: PathBuf,
}

impl StorePaths {
    pub fn under(root: &Path) -> Self {
        Self {
            primary: root.join("primary"),
            reference: root.join("reference"),
            local: root.join("local"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuttleConfig {
    /// Run ledger document
    pub ledger_path: PathBuf,

    pub stores: StorePaths,

    /// Job files and downloaded file-exchange inputs
    pub scratch_dir: PathBuf,

    /// Per-subsystem plugin and child logs
    pub log_dir: PathBuf,

    /// Pause between coordinator passes in continuous mode
    #[serde(default = "default_pass_interval_ms")]
    pub pass_interval_ms: u64,

    /// Program launched as the plugin child; defaults to the running executable
    #[serde(default)]
    pub plugin_program: Option<PathBuf>,

    #[serde(default)]
    pub supervisor: SupervisorPolicy,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub archive: ArchivePolicy,

    #[serde(default)]
    pub notifications: NotificationPolicy,

    /// Directory of each file-exchange system
    #[serde(default)]
    pub file_exchange: BTreeMap<FxsSystem, PathBuf>,

    /// Processing order of subsystems
    pub subsystems: Vec<SubsystemConfig>,
}

fn default_pass_interval_ms() -> u64 {
    60_000
}

impl ShuttleConfig {
    /// Lays out ledger, stores, scratch and logs under one root.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            ledger_path: root.join("ledger.json"),
            stores: StorePaths::under(&root.join("stores")),
            scratch_dir: root.join("scratch"),
            log_dir: root.join("logs"),
            pass_interval_ms: default_pass_interval_ms(),
            plugin_program: None,
            supervisor: SupervisorPolicy::default(),
            retry: RetryPolicy::default(),
            archive: ArchivePolicy::default(),
            notifications: NotificationPolicy::default(),
            file_exchange: BTreeMap::new(),
            subsystems: Vec::new(),
        }
    }

    /// Load and validate a JSON configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            ShuttleError::Config(format!("read config '{}': {}", path.display(), err))
        })?;
        let config = serde_json::from_slice::<Self>(&bytes).map_err(|err| {
            ShuttleError::Config(format!("parse config '{}': {}", path.display(), err))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn subsystem(mut self, subsystem: SubsystemConfig) -> Self {
        self.subsystems.push(subsystem);
        self
    }

    pub fn file_exchange(mut self, system: FxsSystem, root: impl Into<PathBuf>) -> Self {
        self.file_exchange.insert(system, root.into());
        self
    }

    pub fn plugin_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.plugin_program = Some(program.into());
        self
    }

    pub fn supervisor_poll_interval(mut self, interval: Duration) -> Self {
        self.supervisor.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.retry.max_retries = max;
        self
    }

    pub fn find_subsystem(&self, name: &str) -> Option<&SubsystemConfig> {
        self.subsystems.iter().find(|s| s.name == name)
    }

    pub fn max_retries_for(&self, subsystem: &SubsystemConfig) -> u32 {
        subsystem.max_retries.unwrap_or(self.retry.max_retries)
    }

    pub fn timeout_for(&self, subsystem: &SubsystemConfig) -> Duration {
        Duration::from_secs(
            subsystem
                .timeout_secs
                .unwrap_or(self.supervisor.default_timeout_secs),
        )
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.subsystems.is_empty() {
            return Err(ShuttleError::Config(
                "at least one subsystem must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for subsystem in &self.subsystems {
            let name = subsystem.name.trim();
            if name.is_empty() {
                return Err(ShuttleError::Config(
                    "subsystem name cannot be empty".to_string(),
                ));
            }
            if name.contains('/') || name != subsystem.name {
                return Err(ShuttleError::Config(format!(
                    "subsystem name '{}' must not contain '/' or surrounding spaces",
                    subsystem.name
                )));
            }
            if !seen.insert(name) {
                return Err(ShuttleError::Config(format!(
                    "subsystem '{}' configured twice",
                    name
                )));
            }
            if subsystem.max_retries == Some(0) {
                return Err(ShuttleError::Config(format!(
                    "subsystem '{}': max_retries must be at least 1",
                    name
                )));
            }
            if subsystem.timeout_secs == Some(0) {
                return Err(ShuttleError::Config(format!(
                    "subsystem '{}': timeout_secs must be greater than 0",
                    name
                )));
            }
            if let Some(endpoint) = &subsystem.archive {
                if endpoint.host.trim().is_empty() || endpoint.port == 0 {
                    return Err(ShuttleError::Config(format!(
                        "subsystem '{}': archive endpoint '{}' is malformed",
                        name,
                        endpoint.address()
                    )));
                }
            }
        }

        if self.retry.max_retries == 0 {
            return Err(ShuttleError::Config(
                "retry.max_retries must be at least 1".to_string(),
            ));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(ShuttleError::Config(
                "supervisor.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.supervisor.default_timeout_secs == 0 {
            return Err(ShuttleError::Config(
                "supervisor.default_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.archive.connect_timeout_ms == 0 || self.archive.request_timeout_ms == 0 {
            return Err(ShuttleError::Config(
                "archive timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

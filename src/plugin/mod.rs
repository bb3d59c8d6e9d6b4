//! Subsystem plugin contract.
//!
//! A plugin turns one run's conditions into stored calibration objects. It
//! only sees the run through [`PluginServices`], and it always runs inside a
//! supervised child process; the parent learns the outcome from the exit code.

pub mod builtin;
mod context;
mod executor;
mod job;

pub use context::{PluginContext, invoke, run_attempt};
pub use executor::{AttemptOutcome, PluginExecutor, ProcessExecutor};
pub use job::PluginJob;

use crate::config::ShuttleConfig;
use crate::core::{ConditionsValueSet, Result, RunNumber, ShuttleError, TimeWindow};
use crate::fxs::FxsSystem;
use crate::store::CommitOutcome;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use thiserror::Error;

/// Child exit code: processed and fully stored.
pub const EXIT_SUCCESS: i32 = 0;
/// Child exit code: processing failed or output was lost.
pub const EXIT_FAILURE: i32 = 1;
/// Child exit code: processed, some output went to the local fallback.
pub const EXIT_STORE_FALLBACK: i32 = 2;

/// Failure reported by a plugin's `process`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("plugin failed with code {code}: {message}")]
pub struct PluginError {
    pub code: i32,
    pub message: String,
}

impl PluginError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ShuttleError> for PluginError {
    fn from(err: ShuttleError) -> Self {
        Self::new(EXIT_FAILURE, err.to_string())
    }
}

/// Validity and annotation of one `store` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// The object becomes valid this many runs before the current one.
    pub validity_start_offset: u32,
    /// Valid until further notice instead of until the current run.
    pub infinite: bool,
    pub comment: String,
}

impl StoreOptions {
    pub fn validity_start_offset(mut self, offset: u32) -> Self {
        self.validity_start_offset = offset;
        self
    }

    pub fn infinite(mut self, infinite: bool) -> Self {
        self.infinite = infinite;
        self
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }
}

/// Everything a plugin may do besides computing.
#[async_trait]
pub trait PluginServices: Send {
    fn run(&self) -> RunNumber;

    fn subsystem(&self) -> &str;

    /// Commit a conditions object at `path` (`<SUBSYSTEM>/<Type>/<Name>`).
    async fn store(&mut self, path: &str, payload: Vec<u8>, options: StoreOptions) -> Result<CommitOutcome>;

    /// Commit to the reference store.
    async fn store_reference(
        &mut self,
        path: &str,
        payload: Vec<u8>,
        options: StoreOptions,
    ) -> Result<CommitOutcome>;

    /// Download a file-exchange input; `None` when it was not published.
    async fn get_file(
        &mut self,
        system: FxsSystem,
        file_id: &str,
        source: Option<&str>,
    ) -> Result<Option<PathBuf>>;

    async fn get_file_sources(&mut self, system: FxsSystem, file_id: &str) -> Result<Vec<String>>;

    /// Append to the subsystem log.
    fn log(&mut self, message: &str);

    fn run_parameter(&self, name: &str) -> Option<String>;

    /// Free-form setting from the subsystem configuration.
    fn setting(&self, name: &str) -> Option<String>;
}

#[async_trait]
pub trait Plugin: Send {
    fn initialize(&mut self, run: RunNumber, window: &TimeWindow);

    async fn process(
        &mut self,
        conditions: &BTreeMap<String, ConditionsValueSet>,
        services: &mut dyn PluginServices,
    ) -> std::result::Result<(), PluginError>;
}

/// Plugins by subsystem name.
///
/// Passed explicitly to the coordinator, which validates it against the
/// configuration when it is built.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subsystem: &str, plugin: Box<dyn Plugin>) -> Result<()> {
        if self.plugins.contains_key(subsystem) {
            return Err(ShuttleError::Plugin(format!(
                "a plugin is already registered for '{}'",
                subsystem
            )));
        }
        self.plugins.insert(subsystem.to_string(), plugin);
        Ok(())
    }

    pub fn contains(&self, subsystem: &str) -> bool {
        self.plugins.contains_key(subsystem)
    }

    pub fn get_mut(&mut self, subsystem: &str) -> Option<&mut Box<dyn Plugin>> {
        self.plugins.get_mut(subsystem)
    }

    pub fn subsystems(&self) -> BTreeSet<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Every registered plugin must belong to a configured subsystem.
    pub fn validate(&self, config: &ShuttleConfig) -> Result<()> {
        let mut unknown: Vec<&str> = self
            .plugins
            .keys()
            .filter(|name| config.find_subsystem(name).is_none())
            .map(String::as_str)
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        unknown.sort_unstable();
        Err(ShuttleError::Config(format!(
            "plugins registered for unconfigured subsystems: {}",
            unknown.join(", ")
        )))
    }
}

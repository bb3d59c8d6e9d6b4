use crate::core::{ConditionsValueSet, Result, RunNumber, ShuttleError, TimeWindow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Everything the child needs for one attempt.
///
/// Archive values are retrieved by the parent and travel in the job file, so
/// the child never talks to the slow-control archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginJob {
    pub run: RunNumber,
    pub subsystem: String,
    pub attempt: u32,
    pub window: TimeWindow,
    #[serde(default)]
    pub conditions: BTreeMap<String, ConditionsValueSet>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub responsible: String,
}

impl PluginJob {
    pub fn new(run: RunNumber, subsystem: &str, attempt: u32, window: TimeWindow) -> Self {
        Self {
            run,
            subsystem: subsystem.to_string(),
            attempt,
            window,
            conditions: BTreeMap::new(),
            parameters: BTreeMap::new(),
            responsible: String::new(),
        }
    }

    pub fn conditions(mut self, conditions: BTreeMap<String, ConditionsValueSet>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn parameters(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn responsible(mut self, responsible: &str) -> Self {
        self.responsible = responsible.to_string();
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|err| {
            ShuttleError::Plugin(format!("read job '{}': {}", path.display(), err))
        })?;
        let job = serde_json::from_slice::<Self>(&bytes)?;
        job.window.validate()?;
        Ok(job)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, serde_json::to_vec(self)?).await?;
        Ok(())
    }
}

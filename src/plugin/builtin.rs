//! Plugins shipped with the shuttle binary.

use super::{Plugin, PluginError, PluginRegistry, PluginServices, StoreOptions};
use crate::config::ShuttleConfig;
use crate::core::{ConditionsValueSet, Result, RunNumber, ShuttleError, TimeWindow};
use crate::fxs::FxsSystem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CONDITIONS_SUMMARY: &str = "conditions-summary";

/// Statistics of one numeric signal over the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl SignalSummary {
    pub fn of(values: &ConditionsValueSet) -> Option<Self> {
        let mut count = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        for value in values.numeric_values() {
            count += 1;
            min = min.min(value);
            max = max.max(value);
            sum += value;
        }
        (count > 0).then(|| Self {
            count,
            min,
            max,
            mean: sum / count as f64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionsSummaryReport {
    pub run: RunNumber,
    pub window: TimeWindow,
    pub signals: BTreeMap<String, SignalSummary>,
    /// Signals without a single numeric sample.
    pub empty: Vec<String>,
}

/// Summarizes every retrieved signal into `<SUBSYSTEM>/Calib/ConditionsSummary`.
///
/// With the `input_file_id` setting it also pulls every acquisition-side
/// source of that file and records their sizes in the reference store.
#[derive(Debug, Default)]
pub struct ConditionsSummaryPlugin {
    run: RunNumber,
    window: Option<TimeWindow>,
}

impl ConditionsSummaryPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    async fn store_input_sizes(
        &self,
        services: &mut dyn PluginServices,
        file_id: &str,
    ) -> std::result::Result<(), PluginError> {
        let sources = services.get_file_sources(FxsSystem::Daq, file_id).await?;
        if sources.is_empty() {
            services.log(&format!("no sources published for '{}'", file_id));
            return Ok(());
        }

        let mut sizes = BTreeMap::new();
        for source in &sources {
            let Some(path) = services
                .get_file(FxsSystem::Daq, file_id, Some(source))
                .await?
            else {
                continue;
            };
            let size = tokio::fs::metadata(&path)
                .await
                .map_err(|err| PluginError::new(1, format!("stat '{}': {}", path.display(), err)))?
                .len();
            sizes.insert(source.clone(), size);
        }

        let path = format!("{}/Ref/InputSizes", services.subsystem());
        let payload = serde_json::to_vec_pretty(&sizes).map_err(ShuttleError::from)?;
        services
            .store_reference(&path, payload, StoreOptions::default().comment(file_id))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for ConditionsSummaryPlugin {
    fn initialize(&mut self, run: RunNumber, window: &TimeWindow) {
        self.run = run;
        self.window = Some(*window);
    }

    async fn process(
        &mut self,
        conditions: &BTreeMap<String, ConditionsValueSet>,
        services: &mut dyn PluginServices,
    ) -> std::result::Result<(), PluginError> {
        let window = self
            .window
            .ok_or_else(|| PluginError::new(1, "process called before initialize"))?;

        let mut report = ConditionsSummaryReport {
            run: self.run,
            window,
            signals: BTreeMap::new(),
            empty: Vec::new(),
        };
        for (signal, values) in conditions {
            match SignalSummary::of(values) {
                Some(summary) => {
                    report.signals.insert(signal.clone(), summary);
                }
                None => report.empty.push(signal.clone()),
            }
        }
        services.log(&format!(
            "summarized {} signals ({} empty)",
            report.signals.len(),
            report.empty.len()
        ));

        let path = format!("{}/Calib/ConditionsSummary", services.subsystem());
        let payload = serde_json::to_vec_pretty(&report).map_err(ShuttleError::from)?;
        services
            .store(&path, payload, StoreOptions::default().comment("conditions summary"))
            .await?;

        if let Some(file_id) = services.setting("input_file_id") {
            self.store_input_sizes(services, &file_id).await?;
        }
        Ok(())
    }
}

/// Registry holding the built-in plugin named by each subsystem's `plugin` field.
pub fn registry_from_config(config: &ShuttleConfig) -> Result<PluginRegistry> {
    let mut registry = PluginRegistry::new();
    for subsystem in &config.subsystems {
        let Some(kind) = subsystem.plugin.as_deref() else {
            continue;
        };
        let plugin: Box<dyn Plugin> = match kind {
            CONDITIONS_SUMMARY => Box::new(ConditionsSummaryPlugin::new()),
            other => {
                return Err(ShuttleError::Config(format!(
                    "subsystem '{}': unknown plugin '{}'",
                    subsystem.name, other
                )));
            }
        };
        registry.register(&subsystem.name, plugin)?;
    }
    Ok(registry)
}

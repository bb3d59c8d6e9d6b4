//! The shuttle control loop.
//!
//! One pass walks the unfinished runs oldest first and, inside each run, the
//! configured subsystems in configuration order. Per subsystem it reads the
//! persisted status, decides what to do, does it, and persists the new status
//! before the ledger is told. A run is marked done once every registered
//! subsystem reached a terminal state.

use crate::conditions::{ConditionsArchive, retrieve_conditions};
use crate::config::{ShuttleConfig, SubsystemConfig};
use crate::core::{Result, RunNumber, ShuttleError, TimeWindow};
use crate::ledger::{Run, RunLedger};
use crate::notify::{Notifier, OperatorAlert, StatusUpdate};
use crate::plugin::{AttemptOutcome, PluginExecutor, PluginJob, PluginRegistry};
use crate::state::{Decision, StatusStore, SubsystemState, SubsystemStatus, decide};
use crate::store::ObjectStoreGateway;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{Instrument, Level, event, info_span};

/// External collaborators of the coordinator.
#[derive(Clone)]
pub struct CoordinatorServices {
    pub ledger: Arc<dyn RunLedger>,
    pub archive: Arc<dyn ConditionsArchive>,
    pub executor: Arc<dyn PluginExecutor>,
    pub gateway: ObjectStoreGateway,
    pub notifier: Arc<dyn Notifier>,
}

/// State a subsystem was left in by one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemReport {
    pub run: RunNumber,
    pub subsystem: String,
    pub state: SubsystemState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub runs_seen: usize,
    pub subsystems: Vec<SubsystemReport>,
    pub completed_runs: Vec<RunNumber>,
    /// Runs left alone because their window is malformed.
    pub skipped_runs: Vec<RunNumber>,
}

impl PassReport {
    pub fn state_of(&self, run: RunNumber, subsystem: &str) -> Option<SubsystemState> {
        self.subsystems
            .iter()
            .find(|report| report.run == run && report.subsystem == subsystem)
            .map(|report| report.state)
    }
}

pub struct RunCoordinator {
    config: ShuttleConfig,
    services: CoordinatorServices,
    statuses: StatusStore,
    registered: BTreeSet<String>,
    last_action: Mutex<String>,
}

impl RunCoordinator {
    /// Validates the configuration and the plugin registry against it.
    pub fn new(config: ShuttleConfig, services: CoordinatorServices, registry: &PluginRegistry) -> Result<Self> {
        config.validate()?;
        registry.validate(&config)?;

        let registered = registry.subsystems();
        for subsystem in &config.subsystems {
            if !registered.contains(&subsystem.name) {
                event!(
                    Level::WARN,
                    subsystem = %subsystem.name,
                    "no plugin registered, subsystem will be skipped"
                );
            }
        }

        let statuses = StatusStore::new(services.gateway.local().clone());
        Ok(Self {
            config,
            services,
            statuses,
            registered,
            last_action: Mutex::new(String::from("idle")),
        })
    }

    pub fn config(&self) -> &ShuttleConfig {
        &self.config
    }

    pub fn statuses(&self) -> &StatusStore {
        &self.statuses
    }

    pub fn last_action(&self) -> String {
        match self.last_action.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_last_action(&self, action: String) {
        match self.last_action.lock() {
            Ok(mut guard) => *guard = action,
            Err(poisoned) => *poisoned.into_inner() = action,
        }
    }

    /// One pass over every unfinished run.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let mut runs = self.services.ledger.unfinished_runs().await?;
        runs.sort_by_key(|run| run.number);
        let mut report = PassReport {
            runs_seen: runs.len(),
            ..PassReport::default()
        };

        for run in &runs {
            let span = info_span!("shuttle.run", run = run.number);
            self.process_run(run, &runs, &mut report)
                .instrument(span)
                .await;
        }

        self.set_last_action(format!(
            "pass finished: {} runs, {} completed",
            report.runs_seen,
            report.completed_runs.len()
        ));
        Ok(report)
    }

    async fn process_run(&self, run: &Run, runs: &[Run], report: &mut PassReport) {
        let window = match run.window() {
            Ok(window) => window,
            Err(err) => {
                event!(Level::ERROR, error = %err, "run skipped");
                report.skipped_runs.push(run.number);
                return;
            }
        };

        let mut all_terminal = true;
        for subsystem in &self.config.subsystems {
            if !self.registered.contains(&subsystem.name) {
                continue;
            }

            let span = info_span!("shuttle.subsystem", subsystem = %subsystem.name);
            let state = match self
                .process_subsystem(run, &window, subsystem, runs)
                .instrument(span)
                .await
            {
                Ok(state) => state,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        subsystem = %subsystem.name,
                        error = %err,
                        "subsystem step aborted"
                    );
                    all_terminal = false;
                    continue;
                }
            };

            all_terminal &= state.is_terminal();
            report.subsystems.push(SubsystemReport {
                run: run.number,
                subsystem: subsystem.name.clone(),
                state,
            });
        }

        if !all_terminal {
            return;
        }
        match self.services.ledger.mark_run_done(run.number).await {
            Ok(()) => {
                event!(Level::INFO, "run done");
                report.completed_runs.push(run.number);
            }
            Err(err) => event!(Level::ERROR, error = %err, "marking run done failed"),
        }
    }

    async fn process_subsystem(
        &self,
        run: &Run,
        window: &TimeWindow,
        subsystem: &SubsystemConfig,
        runs: &[Run],
    ) -> Result<SubsystemState> {
        let name = subsystem.name.as_str();
        let status = self.statuses.load(run.number, name).await?;

        if !run.participates(name) && !status.as_ref().is_some_and(|s| s.state.is_terminal()) {
            let retry_count = status.as_ref().map_or(0, |s| s.retry_count);
            self.transition(run.number, subsystem, SubsystemStatus::new(SubsystemState::Skipped, retry_count))
                .await?;
            return Ok(SubsystemState::Skipped);
        }

        let max_retries = self.config.max_retries_for(subsystem);
        let blocked = subsystem.strict_ordering && self.earlier_unresolved(run.number, name, runs).await?;

        match decide(status.as_ref(), max_retries, blocked) {
            Decision::Skip { state, renotify } => {
                if run.status_label(name) != Some(state.ledger_label()) {
                    event!(Level::INFO, state = %state, "correcting ledger status");
                    self.services
                        .ledger
                        .update_subsystem_status(run.number, name, state.ledger_label())
                        .await?;
                }
                if renotify {
                    if let Some(status) = status {
                        self.notify_failure(run.number, subsystem, status).await?;
                    }
                }
                Ok(state)
            }
            Decision::Defer => {
                event!(Level::INFO, "earlier run still unresolved, deferring");
                self.set_last_action(format!("run {} {}: deferred", run.number, name));
                Ok(status.map_or(SubsystemState::Unprocessed, |s| s.state))
            }
            Decision::Fail { retry_count } => {
                let reason = status
                    .and_then(|s| s.last_error)
                    .unwrap_or_else(|| "retries exhausted".to_string());
                self.discard_local_output(run.number, name).await;
                self.fail(run.number, subsystem, retry_count, reason).await?;
                Ok(SubsystemState::Failed)
            }
            Decision::Reconcile => {
                let retry_count = status.map_or(1, |s| s.retry_count);
                self.reconcile(run.number, subsystem, retry_count, runs).await
            }
            Decision::Attempt { attempt } => {
                self.attempt(run, window, subsystem, attempt, max_retries).await
            }
        }
    }

    /// Whether a run before `run` still has `subsystem` outside a terminal state.
    ///
    /// Runs with a malformed window are never processed and do not count.
    async fn earlier_unresolved(&self, run: RunNumber, subsystem: &str, runs: &[Run]) -> Result<bool> {
        let earlier_runs = runs
            .iter()
            .filter(|r| r.number < run && r.participates(subsystem) && r.window().is_ok());
        for earlier in earlier_runs {
            let status = self.statuses.load(earlier.number, subsystem).await?;
            if !status.is_some_and(|s| s.state.is_terminal()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Persist `status`, then mirror it to the ledger and telemetry.
    async fn transition(&self, run: RunNumber, subsystem: &SubsystemConfig, status: SubsystemStatus) -> Result<()> {
        self.statuses.save(run, &subsystem.name, &status).await?;
        self.services
            .ledger
            .update_subsystem_status(run, &subsystem.name, status.state.ledger_label())
            .await?;

        let update = StatusUpdate {
            run,
            subsystem: subsystem.name.clone(),
            status: status.state.ledger_label().to_string(),
            retry_count: status.retry_count,
            at: status.updated_at,
        };
        if let Err(err) = self.services.notifier.publish_status(&update).await {
            event!(Level::WARN, error = %err, "status telemetry not delivered");
        }
        Ok(())
    }

    async fn attempt(
        &self,
        run: &Run,
        window: &TimeWindow,
        subsystem: &SubsystemConfig,
        attempt: u32,
        max_retries: u32,
    ) -> Result<SubsystemState> {
        let name = subsystem.name.as_str();
        self.set_last_action(format!("run {} {}: attempt {}", run.number, name, attempt));
        event!(Level::INFO, attempt, max_retries, "starting attempt");
        self.transition(run.number, subsystem, SubsystemStatus::new(SubsystemState::InProgress, attempt))
            .await?;

        let conditions = match &subsystem.archive {
            Some(endpoint) => {
                match retrieve_conditions(self.services.archive.as_ref(), endpoint, window).await {
                    Ok(conditions) => conditions,
                    Err(err) => {
                        event!(Level::WARN, error = %err, "conditions retrieval failed");
                        return self
                            .record_error(
                                run.number,
                                subsystem,
                                SubsystemState::DcsError,
                                attempt,
                                max_retries,
                                err.to_string(),
                            )
                            .await;
                    }
                }
            }
            None => BTreeMap::new(),
        };

        let job = PluginJob::new(run.number, name, attempt, *window)
            .conditions(conditions)
            .parameters(run.parameters.clone())
            .responsible(&subsystem.responsibles.join(","));
        let timeout = self.config.timeout_for(subsystem);

        self.set_last_action(format!("run {} {}: plugin running", run.number, name));
        let outcome = match self.services.executor.execute(&job, timeout).await {
            Ok(outcome) => outcome,
            Err(err) => {
                event!(Level::ERROR, error = %err, "plugin could not be executed");
                return self
                    .record_error(
                        run.number,
                        subsystem,
                        SubsystemState::ProcessingError,
                        attempt,
                        max_retries,
                        err.to_string(),
                    )
                    .await;
            }
        };

        match outcome {
            AttemptOutcome::Success => {
                self.transition(run.number, subsystem, SubsystemStatus::new(SubsystemState::Done, attempt))
                    .await?;
                self.discard_local_output(run.number, name).await;
                Ok(SubsystemState::Done)
            }
            AttemptOutcome::StoreFallback => {
                event!(Level::WARN, "output kept in local store, reconciling on a later pass");
                self.transition(run.number, subsystem, SubsystemStatus::new(SubsystemState::StoreFailed, attempt))
                    .await?;
                Ok(SubsystemState::StoreFailed)
            }
            AttemptOutcome::Failed { code } => {
                let reason = match code {
                    Some(code) => format!("plugin exited with code {}", code),
                    None => "plugin terminated by signal".to_string(),
                };
                self.record_error(
                    run.number,
                    subsystem,
                    SubsystemState::ProcessingError,
                    attempt,
                    max_retries,
                    reason,
                )
                .await
            }
            AttemptOutcome::TimedOut { elapsed } => {
                let reason = format!("timeout after {:.1}s", elapsed.as_secs_f64());
                self.record_error(
                    run.number,
                    subsystem,
                    SubsystemState::ProcessingError,
                    attempt,
                    max_retries,
                    reason,
                )
                .await
            }
        }
    }

    /// Record a failed attempt and fail the subsystem once the bound is hit.
    async fn record_error(
        &self,
        run: RunNumber,
        subsystem: &SubsystemConfig,
        state: SubsystemState,
        attempt: u32,
        max_retries: u32,
        reason: String,
    ) -> Result<SubsystemState> {
        self.transition(run, subsystem, SubsystemStatus::new(state, attempt).error(reason.clone()))
            .await?;
        self.discard_local_output(run, &subsystem.name).await;
        if attempt < max_retries {
            return Ok(state);
        }
        self.fail(run, subsystem, attempt, reason).await?;
        Ok(SubsystemState::Failed)
    }

    /// Local output of an attempt that will not be reconciled. Best effort:
    /// reconciliation drops whatever is left here.
    async fn discard_local_output(&self, run: RunNumber, subsystem: &str) {
        if let Err(err) = self.services.gateway.discard_local(run, subsystem).await {
            event!(Level::WARN, error = %err, "local output not discarded");
        }
    }

    async fn fail(&self, run: RunNumber, subsystem: &SubsystemConfig, retry_count: u32, reason: String) -> Result<()> {
        event!(Level::ERROR, retry_count, reason = %reason, "subsystem failed");
        let status = SubsystemStatus::new(SubsystemState::Failed, retry_count).error(reason);
        self.transition(run, subsystem, status.clone()).await?;
        self.notify_failure(run, subsystem, status).await
    }

    /// Alert the operators, then remember that they were told.
    async fn notify_failure(&self, run: RunNumber, subsystem: &SubsystemConfig, status: SubsystemStatus) -> Result<()> {
        let alert = OperatorAlert {
            run,
            subsystem: subsystem.name.clone(),
            responsibles: subsystem.responsibles.clone(),
            retry_count: status.retry_count,
            reason: status.last_error.clone().unwrap_or_default(),
            raised_at: Utc::now(),
        };
        if let Err(err) = self.services.notifier.notify_operators(&alert).await {
            event!(Level::WARN, error = %err, "operator notification not delivered");
            return Ok(());
        }
        self.statuses
            .save(run, &subsystem.name, &status.notified(true))
            .await
    }

    async fn reconcile(
        &self,
        run: RunNumber,
        subsystem: &SubsystemConfig,
        retry_count: u32,
        runs: &[Run],
    ) -> Result<SubsystemState> {
        self.set_last_action(format!("run {} {}: reconciling", run, subsystem.name));
        let oldest_unresolved = !self.earlier_unresolved(run, &subsystem.name, runs).await?;
        let report = self
            .services
            .gateway
            .reconcile(run, &subsystem.name, retry_count, oldest_unresolved)
            .await?;

        event!(
            Level::INFO,
            promoted = report.promoted.len(),
            discarded = report.discarded.len(),
            deferred = report.deferred.len(),
            failed = report.failed.len(),
            "reconciliation pass"
        );

        if !report.is_complete() {
            return Ok(SubsystemState::StoreFailed);
        }
        self.transition(run, subsystem, SubsystemStatus::new(SubsystemState::Done, retry_count))
            .await?;
        Ok(SubsystemState::Done)
    }

    /// Reopen (run, subsystem): a fresh `Unprocessed` status and no ledger entry.
    pub async fn reset(&self, run: RunNumber, subsystem: &str) -> Result<()> {
        if self.config.find_subsystem(subsystem).is_none() {
            return Err(ShuttleError::Config(format!(
                "subsystem '{}' is not configured",
                subsystem
            )));
        }
        if self.services.ledger.run(run).await?.is_none() {
            return Err(ShuttleError::RunNotFound(run));
        }

        self.statuses
            .save(run, subsystem, &SubsystemStatus::new(SubsystemState::Unprocessed, 0))
            .await?;
        self.services.ledger.clear_subsystem_status(run, subsystem).await?;
        self.services.gateway.discard_local(run, subsystem).await?;
        event!(Level::INFO, run, subsystem, "subsystem reset");
        Ok(())
    }

    /// Current status of every configured subsystem for `run`.
    pub async fn run_status(&self, run: RunNumber) -> Result<Vec<(String, Option<SubsystemStatus>)>> {
        let mut statuses = Vec::with_capacity(self.config.subsystems.len());
        for subsystem in &self.config.subsystems {
            let status = self.statuses.load(run, &subsystem.name).await?;
            statuses.push((subsystem.name.clone(), status));
        }
        Ok(statuses)
    }

    /// Passes separated by the configured interval until `shutdown` resolves.
    pub async fn run_forever<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let interval = Duration::from_millis(self.config.pass_interval_ms.max(10));
        tokio::pin!(shutdown);

        loop {
            match self.run_pass().await {
                Ok(report) => event!(
                    Level::INFO,
                    runs = report.runs_seen,
                    completed = report.completed_runs.len(),
                    "pass complete"
                ),
                Err(err) => event!(Level::ERROR, error = %err, "pass failed"),
            }

            tokio::select! {
                _ = &mut shutdown => {
                    event!(Level::INFO, "shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        self.set_last_action("stopped".to_string());
        Ok(())
    }
}

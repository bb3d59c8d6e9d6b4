#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use shuttle::{
    ArchiveEndpoint, ArchiveError, AttemptOutcome, ConditionsArchive, ConditionsSample,
    ConditionsValueSet, CoordinatorServices, FileObjectStore, FileRunLedger, FxsSystem,
    LocalFxsServer, Notifier, ObjectHeader, ObjectId, ObjectPath, ObjectStore,
    ObjectStoreGateway, OperatorAlert, Plugin, PluginContext, PluginError, PluginExecutor,
    PluginJob, PluginRegistry, PluginServices, Result, Run, RunCoordinator, RunNumber,
    ShuttleConfig, ShuttleError, SignalKind, StatusUpdate, StoreOptions, StoredObject,
    SubsystemConfig, SupervisedExit, TimeWindow, Value,
};
use shuttle::fxs::FileExchangeClient;
use shuttle::plugin::run_attempt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Executors
// ============================================================================

/// Replays canned outcomes per subsystem and records every job it was given.
#[derive(Default)]
pub struct ScriptedExecutor {
    script: Mutex<HashMap<String, VecDeque<AttemptOutcome>>>,
    jobs: Mutex<Vec<PluginJob>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, subsystem: &str, outcomes: Vec<AttemptOutcome>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(subsystem.to_string(), outcomes.into());
        self
    }

    pub fn jobs(&self) -> Vec<PluginJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn jobs_for(&self, subsystem: &str) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.subsystem == subsystem)
            .count()
    }
}

#[async_trait]
impl PluginExecutor for ScriptedExecutor {
    async fn execute(&self, job: &PluginJob, _timeout: Duration) -> Result<AttemptOutcome> {
        self.jobs.lock().unwrap().push(job.clone());
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&job.subsystem)
            .and_then(|outcomes| outcomes.pop_front());
        Ok(next.unwrap_or(AttemptOutcome::Success))
    }
}

/// Runs registered plugins in the test process against a given gateway.
pub struct InProcessExecutor {
    gateway: ObjectStoreGateway,
    log_dir: std::path::PathBuf,
    download_dir: std::path::PathBuf,
    fxs: BTreeMap<FxsSystem, Arc<LocalFxsServer>>,
    settings: BTreeMap<String, BTreeMap<String, String>>,
    registry: tokio::sync::Mutex<PluginRegistry>,
    executions: AtomicUsize,
}

impl InProcessExecutor {
    pub fn new(gateway: ObjectStoreGateway, root: &std::path::Path, registry: PluginRegistry) -> Self {
        Self {
            gateway,
            log_dir: root.join("logs"),
            download_dir: root.join("downloads"),
            fxs: BTreeMap::new(),
            settings: BTreeMap::new(),
            registry: tokio::sync::Mutex::new(registry),
            executions: AtomicUsize::new(0),
        }
    }

    pub fn with_fxs(mut self, system: FxsSystem, server: Arc<LocalFxsServer>) -> Self {
        self.fxs.insert(system, server);
        self
    }

    pub fn with_settings(mut self, subsystem: &str, settings: BTreeMap<String, String>) -> Self {
        self.settings.insert(subsystem.to_string(), settings);
        self
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PluginExecutor for InProcessExecutor {
    async fn execute(&self, job: &PluginJob, _timeout: Duration) -> Result<AttemptOutcome> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let mut fxs = FileExchangeClient::new(job.run, &job.subsystem, &self.download_dir);
        for (system, server) in &self.fxs {
            fxs = fxs.with_server(*system, server.clone());
        }
        let mut context = PluginContext::new(job, self.gateway.clone(), fxs, &self.log_dir)
            .settings(self.settings.get(&job.subsystem).cloned().unwrap_or_default());

        let mut registry = self.registry.lock().await;
        let plugin = registry
            .get_mut(&job.subsystem)
            .ok_or_else(|| ShuttleError::Plugin(format!("no plugin for {}", job.subsystem)))?;
        let code = run_attempt(plugin.as_mut(), job, &mut context).await;
        Ok(AttemptOutcome::from_exit(SupervisedExit::Exited(code)))
    }
}

// ============================================================================
// Plugins
// ============================================================================

/// Stores one payload per call at `<SUBSYSTEM>/Calib/<name>`, failing the
/// first attempts of selected runs either before or after storing.
pub struct StoringPlugin {
    pub name: &'static str,
    pub infinite: bool,
    pub failures_left: HashMap<RunNumber, usize>,
    pub fail_after_store: bool,
}

impl StoringPlugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            infinite: false,
            failures_left: HashMap::new(),
            fail_after_store: false,
        }
    }

    pub fn infinite(mut self) -> Self {
        self.infinite = true;
        self
    }

    pub fn failing(mut self, run: RunNumber, times: usize) -> Self {
        self.failures_left.insert(run, times);
        self
    }

    pub fn failing_after_store(mut self, run: RunNumber, times: usize) -> Self {
        self.fail_after_store = true;
        self.failing(run, times)
    }

    fn take_failure(&mut self, run: RunNumber) -> bool {
        match self.failures_left.get_mut(&run) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Plugin for StoringPlugin {
    fn initialize(&mut self, _run: RunNumber, _window: &TimeWindow) {}

    async fn process(
        &mut self,
        conditions: &BTreeMap<String, ConditionsValueSet>,
        services: &mut dyn PluginServices,
    ) -> std::result::Result<(), PluginError> {
        if !self.fail_after_store && self.take_failure(services.run()) {
            return Err(PluginError::new(1, "fit did not converge"));
        }
        let path = format!("{}/Calib/{}", services.subsystem(), self.name);
        let payload = format!("run={} signals={}", services.run(), conditions.len()).into_bytes();
        services
            .store(&path, payload, StoreOptions::default().infinite(self.infinite))
            .await?;
        if self.fail_after_store && self.take_failure(services.run()) {
            return Err(PluginError::new(1, "quality check rejected the output"));
        }
        Ok(())
    }
}

/// Never invoked by scripted executors; only fills the registry.
pub struct NoopPlugin;

#[async_trait]
impl Plugin for NoopPlugin {
    fn initialize(&mut self, _run: RunNumber, _window: &TimeWindow) {}

    async fn process(
        &mut self,
        _conditions: &BTreeMap<String, ConditionsValueSet>,
        _services: &mut dyn PluginServices,
    ) -> std::result::Result<(), PluginError> {
        Ok(())
    }
}

pub fn noop_registry(subsystems: &[&str]) -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    for subsystem in subsystems {
        registry.register(subsystem, Box::new(NoopPlugin)).unwrap();
    }
    registry
}

// ============================================================================
// Notifier, archive and stores
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    pub statuses: Mutex<Vec<StatusUpdate>>,
    pub alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingNotifier {
    pub fn labels_for(&self, run: RunNumber, subsystem: &str) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|update| update.run == run && update.subsystem == subsystem)
            .map(|update| update.status.clone())
            .collect()
    }

    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn publish_status(&self, update: &StatusUpdate) -> Result<()> {
        self.statuses.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn notify_operators(&self, alert: &OperatorAlert) -> Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

/// Serves three samples per signal, or a transport failure while `down`.
#[derive(Default)]
pub struct StaticArchive {
    pub down: AtomicBool,
    pub requests: AtomicUsize,
}

#[async_trait]
impl ConditionsArchive for StaticArchive {
    async fn fetch(
        &self,
        host: &str,
        port: u16,
        signal: &str,
        _kind: SignalKind,
        window: &TimeWindow,
    ) -> std::result::Result<ConditionsValueSet, ArchiveError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(ArchiveError::Transport {
                address: format!("{}:{}", host, port),
                message: "connection refused".to_string(),
            });
        }
        let samples = (0..3)
            .map(|i| ConditionsSample {
                timestamp: window.start + ChronoDuration::seconds(i),
                value: Value::Float(1.0 + i as f64),
            })
            .collect();
        Ok(ConditionsValueSet::new(signal, samples))
    }
}

/// File store that can be switched offline.
pub struct SwitchableStore {
    inner: FileObjectStore,
    pub down: AtomicBool,
}

impl SwitchableStore {
    pub fn new(inner: FileObjectStore) -> Self {
        Self {
            inner,
            down: AtomicBool::new(false),
        }
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(ShuttleError::Store("primary store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for SwitchableStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, object: &StoredObject) -> Result<ObjectId> {
        self.check()?;
        self.inner.put(object).await
    }

    async fn get(&self, path: &ObjectPath, run: RunNumber) -> Result<Option<StoredObject>> {
        self.check()?;
        self.inner.get(path, run).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectHeader>> {
        self.check()?;
        self.inner.list(prefix).await
    }

    async fn load(&self, id: &ObjectId) -> Result<StoredObject> {
        self.check()?;
        self.inner.load(id).await
    }

    async fn remove(&self, id: &ObjectId) -> Result<()> {
        self.check()?;
        self.inner.remove(id).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub config: ShuttleConfig,
    pub ledger: Arc<FileRunLedger>,
    pub primary: Arc<SwitchableStore>,
    pub reference: Arc<FileObjectStore>,
    pub local: Arc<FileObjectStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub archive: Arc<StaticArchive>,
}

impl Harness {
    pub fn new(subsystems: Vec<SubsystemConfig>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ShuttleConfig::new(dir.path());
        for subsystem in subsystems {
            config = config.subsystem(subsystem);
        }

        Self {
            ledger: Arc::new(FileRunLedger::new(&config.ledger_path)),
            primary: Arc::new(SwitchableStore::new(FileObjectStore::new(
                "primary",
                &config.stores.primary,
            ))),
            reference: Arc::new(FileObjectStore::new("reference", &config.stores.reference)),
            local: Arc::new(FileObjectStore::new("local", &config.stores.local)),
            notifier: Arc::new(RecordingNotifier::default()),
            archive: Arc::new(StaticArchive::default()),
            config,
            dir,
        }
    }

    pub fn gateway(&self) -> ObjectStoreGateway {
        ObjectStoreGateway::new(self.primary.clone(), self.reference.clone(), self.local.clone())
    }

    pub async fn register(&self, run: RunNumber) {
        self.ledger.register_run(sample_run(run)).await.unwrap();
    }

    pub async fn register_run(&self, run: Run) {
        self.ledger.register_run(run).await.unwrap();
    }

    pub fn try_coordinator(
        &self,
        executor: Arc<dyn PluginExecutor>,
        registry: &PluginRegistry,
    ) -> Result<RunCoordinator> {
        let services = CoordinatorServices {
            ledger: self.ledger.clone(),
            archive: self.archive.clone(),
            executor,
            gateway: self.gateway(),
            notifier: self.notifier.clone(),
        };
        RunCoordinator::new(self.config.clone(), services, registry)
    }

    pub fn coordinator(&self, executor: Arc<dyn PluginExecutor>, registry: &PluginRegistry) -> RunCoordinator {
        self.try_coordinator(executor, registry).unwrap()
    }

    pub async fn ledger_label(&self, run: RunNumber, subsystem: &str) -> Option<String> {
        let run = shuttle::RunLedger::run(self.ledger.as_ref(), run)
            .await
            .unwrap()
            .unwrap();
        run.status_label(subsystem).map(str::to_string)
    }
}

pub fn sample_run(number: RunNumber) -> Run {
    let start = Utc.with_ymd_and_hms(2026, 5, 4, 8, 0, 0).unwrap() + ChronoDuration::hours(number as i64);
    Run::new(number, start, start + ChronoDuration::minutes(40)).parameter("beam", "pp")
}

pub fn archive_endpoint() -> ArchiveEndpoint {
    ArchiveEndpoint::new("dcs.test", 4242)
        .alias("HV_MEAN")
        .data_point("GAS_FLOW")
}

use super::{
    EXIT_FAILURE, EXIT_STORE_FALLBACK, EXIT_SUCCESS, Plugin, PluginJob, PluginRegistry,
    PluginServices, StoreOptions,
};
use crate::config::ShuttleConfig;
use crate::core::{Result, RunBound, RunNumber, ShuttleError, ValidityRange};
use crate::fxs::{FileExchangeClient, FxsSystem, LocalFxsServer};
use crate::store::{
    CommitOutcome, ObjectMetadata, ObjectPath, ObjectStoreGateway, StorageKind, StoredObject,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event};

/// Child-side services of one attempt.
///
/// Tracks whether any commit fell back to the local store or failed outright;
/// the exit code is derived from that once the plugin returns.
pub struct PluginContext {
    run: RunNumber,
    attempt: u32,
    subsystem: String,
    responsible: String,
    parameters: BTreeMap<String, String>,
    settings: BTreeMap<String, String>,
    gateway: ObjectStoreGateway,
    fxs: FileExchangeClient,
    log_path: PathBuf,
    committed: Vec<CommitOutcome>,
    store_failures: u32,
}

impl PluginContext {
    pub fn new(
        job: &PluginJob,
        gateway: ObjectStoreGateway,
        fxs: FileExchangeClient,
        log_dir: &Path,
    ) -> Self {
        Self {
            run: job.run,
            attempt: job.attempt,
            subsystem: job.subsystem.clone(),
            responsible: job.responsible.clone(),
            parameters: job.parameters.clone(),
            settings: BTreeMap::new(),
            gateway,
            fxs,
            log_path: log_dir.join(format!("{}.log", job.subsystem)),
            committed: Vec::new(),
            store_failures: 0,
        }
    }

    pub fn settings(mut self, settings: BTreeMap<String, String>) -> Self {
        self.settings = settings;
        self
    }

    /// Stores, file exchange servers and settings as configured.
    pub fn from_config(config: &ShuttleConfig, job: &PluginJob) -> Result<Self> {
        let subsystem = config.find_subsystem(&job.subsystem).ok_or_else(|| {
            ShuttleError::Config(format!("subsystem '{}' is not configured", job.subsystem))
        })?;

        let download_dir = config
            .scratch_dir
            .join("downloads")
            .join(format!("{}_{}_{}", job.subsystem, job.run, job.attempt));
        let mut fxs = FileExchangeClient::new(job.run, &job.subsystem, download_dir);
        for (system, root) in &config.file_exchange {
            fxs = fxs.with_server(*system, Arc::new(LocalFxsServer::new(root)));
        }

        Ok(Self::new(
            job,
            ObjectStoreGateway::open(&config.stores),
            fxs,
            &config.log_dir,
        )
        .settings(subsystem.settings.clone()))
    }

    pub fn committed(&self) -> &[CommitOutcome] {
        &self.committed
    }

    pub fn fallback_used(&self) -> bool {
        self.committed.iter().any(CommitOutcome::used_fallback)
    }

    pub fn store_failures(&self) -> u32 {
        self.store_failures
    }

    async fn commit(
        &mut self,
        path: &str,
        payload: Vec<u8>,
        options: StoreOptions,
        kind: StorageKind,
    ) -> Result<CommitOutcome> {
        let result = self.build_object(path, payload, &options, kind);
        let result = match result {
            Ok(object) => self.gateway.commit(&object).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(outcome) => {
                self.committed.push(outcome.clone());
                Ok(outcome)
            }
            Err(err) => {
                self.store_failures += 1;
                event!(Level::ERROR, path, error = %err, "store failed");
                Err(err)
            }
        }
    }

    fn build_object(
        &self,
        path: &str,
        payload: Vec<u8>,
        options: &StoreOptions,
        kind: StorageKind,
    ) -> Result<StoredObject> {
        let path = ObjectPath::parse(path)?;
        if path.owner() != self.subsystem {
            return Err(ShuttleError::InvalidPath(format!(
                "{} (owned by '{}', not '{}')",
                path,
                path.owner(),
                self.subsystem
            )));
        }

        let first = self.run.saturating_sub(options.validity_start_offset);
        let last = if options.infinite {
            RunBound::Infinite
        } else {
            RunBound::Finite(self.run)
        };
        let validity = ValidityRange::new(first, last)?;

        let metadata = ObjectMetadata::new(&self.subsystem, self.run, kind)
            .responsible(&self.responsible)
            .comment(&options.comment)
            .attempt(self.attempt);
        Ok(StoredObject::new(path, validity, metadata, payload))
    }

    fn append_log(&self, message: &str) -> std::io::Result<()> {
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(
            file,
            "{} run={} {}",
            Utc::now().to_rfc3339(),
            self.run,
            message
        )
    }

    /// Exit code for the parent once the plugin has returned.
    pub fn exit_code(&self, processed: bool) -> i32 {
        if !processed || self.store_failures > 0 {
            EXIT_FAILURE
        } else if self.fallback_used() {
            EXIT_STORE_FALLBACK
        } else {
            EXIT_SUCCESS
        }
    }
}

#[async_trait]
impl PluginServices for PluginContext {
    fn run(&self) -> RunNumber {
        self.run
    }

    fn subsystem(&self) -> &str {
        &self.subsystem
    }

    async fn store(&mut self, path: &str, payload: Vec<u8>, options: StoreOptions) -> Result<CommitOutcome> {
        self.commit(path, payload, options, StorageKind::Conditions).await
    }

    async fn store_reference(
        &mut self,
        path: &str,
        payload: Vec<u8>,
        options: StoreOptions,
    ) -> Result<CommitOutcome> {
        self.commit(path, payload, options, StorageKind::Reference).await
    }

    async fn get_file(
        &mut self,
        system: FxsSystem,
        file_id: &str,
        source: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        self.fxs.get_file(system, file_id, source).await
    }

    async fn get_file_sources(&mut self, system: FxsSystem, file_id: &str) -> Result<Vec<String>> {
        self.fxs.sources(system, file_id).await
    }

    fn log(&mut self, message: &str) {
        event!(Level::INFO, subsystem = %self.subsystem, run = self.run, "{}", message);
        if let Err(err) = self.append_log(message) {
            event!(
                Level::WARN,
                path = %self.log_path.display(),
                error = %err,
                "subsystem log not writable"
            );
        }
    }

    fn run_parameter(&self, name: &str) -> Option<String> {
        self.parameters.get(name).cloned()
    }

    fn setting(&self, name: &str) -> Option<String> {
        self.settings.get(name).cloned()
    }
}

/// Run one attempt of `plugin` and return the child exit code.
///
/// Files fetched from the exchange servers are marked retrieved whether the
/// plugin succeeded or not.
pub async fn run_attempt(plugin: &mut dyn Plugin, job: &PluginJob, context: &mut PluginContext) -> i32 {
    plugin.initialize(job.run, &job.window);
    let result = plugin.process(&job.conditions, context).await;

    match context.fxs.mark_consumed().await {
        Ok(0) => {}
        Ok(marked) => event!(Level::DEBUG, marked, "file exchange inputs marked retrieved"),
        Err(err) => event!(Level::WARN, error = %err, "marking file exchange inputs failed"),
    }

    let processed = match result {
        Ok(()) => true,
        Err(err) => {
            context.log(&format!("processing failed: {}", err));
            false
        }
    };

    let code = context.exit_code(processed);
    event!(
        Level::INFO,
        run = job.run,
        subsystem = %job.subsystem,
        attempt = job.attempt,
        committed = context.committed().len(),
        store_failures = context.store_failures(),
        code,
        "plugin attempt finished"
    );
    code
}

/// Child entry point: run the registered plugin of `job.subsystem`.
pub async fn invoke(config: &ShuttleConfig, registry: &mut PluginRegistry, job: &PluginJob) -> i32 {
    let mut context = match PluginContext::from_config(config, job) {
        Ok(context) => context,
        Err(err) => {
            event!(Level::ERROR, error = %err, "cannot prepare plugin context");
            return EXIT_FAILURE;
        }
    };

    let Some(plugin) = registry.get_mut(&job.subsystem) else {
        event!(
            Level::ERROR,
            subsystem = %job.subsystem,
            "no plugin registered for subsystem"
        );
        return EXIT_FAILURE;
    };

    run_attempt(plugin.as_mut(), job, &mut context).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConditionsValueSet, TimeWindow};
    use crate::plugin::PluginError;
    use chrono::Duration;
    use tempfile::{TempDir, tempdir};

    struct Writer {
        paths: Vec<&'static str>,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for Writer {
        fn initialize(&mut self, _run: RunNumber, _window: &TimeWindow) {}

        async fn process(
            &mut self,
            _conditions: &BTreeMap<String, ConditionsValueSet>,
            services: &mut dyn PluginServices,
        ) -> std::result::Result<(), PluginError> {
            for path in &self.paths {
                let _ = services
                    .store(path, b"payload".to_vec(), StoreOptions::default().validity_start_offset(2))
                    .await;
            }
            services.log("written");
            if self.fail {
                return Err(PluginError::new(3, "bad fit"));
            }
            Ok(())
        }
    }

    fn job() -> PluginJob {
        let start = Utc::now();
        let window = TimeWindow::new(start, start + Duration::minutes(5)).unwrap();
        PluginJob::new(10, "TPC", 1, window)
    }

    fn context(dir: &TempDir, job: &PluginJob) -> (PluginContext, ObjectStoreGateway) {
        let gateway = ObjectStoreGateway::open(&crate::config::StorePaths::under(dir.path()));
        let fxs = FileExchangeClient::new(job.run, &job.subsystem, dir.path().join("downloads"));
        (
            PluginContext::new(job, gateway.clone(), fxs, &dir.path().join("logs")),
            gateway,
        )
    }

    #[tokio::test]
    async fn test_successful_attempt_stores_with_offset_validity() {
        let dir = tempdir().unwrap();
        let job = job();
        let (mut context, gateway) = context(&dir, &job);
        let mut plugin = Writer {
            paths: vec!["TPC/Calib/Gain"],
            fail: false,
        };

        let code = run_attempt(&mut plugin, &job, &mut context).await;
        assert_eq!(code, EXIT_SUCCESS);

        let stored = gateway.primary().list("TPC").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id.validity, ValidityRange::new(8, RunBound::Finite(10)).unwrap());
        assert_eq!(stored[0].metadata.producer_run, 10);
        assert_eq!(stored[0].metadata.producer_attempt(), Some(1));

        let log = std::fs::read_to_string(dir.path().join("logs").join("TPC.log")).unwrap();
        assert!(log.contains("written"));
    }

    #[tokio::test]
    async fn test_foreign_path_fails_the_attempt() {
        let dir = tempdir().unwrap();
        let job = job();
        let (mut context, _) = context(&dir, &job);
        let mut plugin = Writer {
            paths: vec!["ITS/Calib/Gain"],
            fail: false,
        };

        assert_eq!(run_attempt(&mut plugin, &job, &mut context).await, EXIT_FAILURE);
        assert_eq!(context.store_failures(), 1);
    }

    #[tokio::test]
    async fn test_plugin_error_fails_the_attempt() {
        let dir = tempdir().unwrap();
        let job = job();
        let (mut context, _) = context(&dir, &job);
        let mut plugin = Writer {
            paths: vec![],
            fail: true,
        };

        assert_eq!(run_attempt(&mut plugin, &job, &mut context).await, EXIT_FAILURE);
    }

    #[test]
    fn test_exit_code_reflects_fallback() {
        let dir = tempdir().unwrap();
        let job = job();
        let (mut context, _) = context(&dir, &job);
        assert_eq!(context.exit_code(true), EXIT_SUCCESS);

        let id = crate::store::ObjectId {
            path: ObjectPath::parse("TPC/Calib/Gain").unwrap(),
            validity: ValidityRange::single(10),
            version: 1,
        };
        context.committed.push(CommitOutcome::LocalFallback(id));
        assert_eq!(context.exit_code(true), EXIT_STORE_FALLBACK);
        assert_eq!(context.exit_code(false), EXIT_FAILURE);
    }
}

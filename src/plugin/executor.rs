use super::{EXIT_STORE_FALLBACK, EXIT_SUCCESS, PluginJob};
use crate::config::ShuttleConfig;
use crate::core::Result;
use crate::supervisor::{PluginInvocation, SubprocessSupervisor, SupervisedExit};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{Level, event};
use uuid::Uuid;

/// Result of one supervised attempt as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    /// Processed, some output is waiting in the local store.
    StoreFallback,
    /// Non-zero exit; `None` when the child died from a signal.
    Failed { code: Option<i32> },
    TimedOut { elapsed: Duration },
}

impl AttemptOutcome {
    pub fn from_exit(exit: SupervisedExit) -> Self {
        match exit {
            SupervisedExit::Exited(EXIT_SUCCESS) => Self::Success,
            SupervisedExit::Exited(EXIT_STORE_FALLBACK) => Self::StoreFallback,
            SupervisedExit::Exited(code) => Self::Failed { code: Some(code) },
            SupervisedExit::Signaled => Self::Failed { code: None },
            SupervisedExit::TimedOut { elapsed } => Self::TimedOut { elapsed },
        }
    }
}

/// Runs one plugin attempt in isolation.
#[async_trait]
pub trait PluginExecutor: Send + Sync {
    async fn execute(&self, job: &PluginJob, timeout: Duration) -> Result<AttemptOutcome>;
}

/// Launches `<program> invoke --config <file> --job <file>` under the
/// subprocess supervisor.
pub struct ProcessExecutor {
    program: PathBuf,
    config_path: PathBuf,
    jobs_dir: PathBuf,
    log_dir: PathBuf,
    supervisor: SubprocessSupervisor,
}

impl ProcessExecutor {
    pub fn new(
        program: impl Into<PathBuf>,
        config_path: impl Into<PathBuf>,
        jobs_dir: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
        supervisor: SubprocessSupervisor,
    ) -> Self {
        Self {
            program: program.into(),
            config_path: config_path.into(),
            jobs_dir: jobs_dir.into(),
            log_dir: log_dir.into(),
            supervisor,
        }
    }

    /// Uses the configured plugin program, or the running executable.
    pub fn from_config(config: &ShuttleConfig, config_path: &Path) -> Result<Self> {
        let program = match &config.plugin_program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        Ok(Self::new(
            program,
            config_path,
            config.scratch_dir.join("jobs"),
            &config.log_dir,
            SubprocessSupervisor::new(Duration::from_millis(config.supervisor.poll_interval_ms)),
        ))
    }

    fn invocation(&self, job: &PluginJob, job_file: &Path) -> PluginInvocation {
        PluginInvocation::new(&self.program)
            .arg("invoke")
            .arg("--config")
            .arg(self.config_path.display().to_string())
            .arg("--job")
            .arg(job_file.display().to_string())
            .log_file(
                self.log_dir
                    .join(format!("{}_{}.child.log", job.subsystem, job.run)),
            )
    }
}

#[async_trait]
impl PluginExecutor for ProcessExecutor {
    async fn execute(&self, job: &PluginJob, timeout: Duration) -> Result<AttemptOutcome> {
        let job_file = self.jobs_dir.join(format!(
            "{}_{}_{}_{}.json",
            job.subsystem,
            job.run,
            job.attempt,
            Uuid::new_v4()
        ));
        job.save(&job_file).await?;

        let exit = self
            .supervisor
            .run(&self.invocation(job, &job_file), timeout)
            .await;

        if let Err(err) = tokio::fs::remove_file(&job_file).await {
            event!(Level::DEBUG, path = %job_file.display(), error = %err, "job file not removed");
        }

        Ok(AttemptOutcome::from_exit(exit?))
    }
}

//! Child process supervision.
//!
//! A plugin runs in its own process. The supervisor starts it, checks it
//! without blocking every poll interval and kills it once the wall-clock
//! budget is spent. The exit code is the only thing read back from the child.

use crate::core::{Result, ShuttleError};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{Instrument, Level, event, info_span};

/// Command line of one plugin child.
#[derive(Debug, Clone, Default)]
pub struct PluginInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub workdir: Option<PathBuf>,
    /// Receives the child's stdout and stderr; discarded when unset.
    pub log_file: Option<PathBuf>,
}

impl PluginInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    pub fn log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisedExit {
    Exited(i32),
    /// Terminated by a signal it did not get from us.
    Signaled,
    /// Killed after exceeding its budget.
    TimedOut { elapsed: Duration },
}

impl From<ExitStatus> for SupervisedExit {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => Self::Exited(code),
            None => Self::Signaled,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubprocessSupervisor {
    poll_interval: Duration,
}

impl Default for SubprocessSupervisor {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl SubprocessSupervisor {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn command(invocation: &PluginInvocation) -> Result<Command> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .envs(invocation.envs.iter().map(|(key, value)| (key, value)))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &invocation.workdir {
            command.current_dir(dir);
        }

        match &invocation.log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let stdout = OpenOptions::new().create(true).append(true).open(path)?;
                let stderr = stdout.try_clone()?;
                command.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        Ok(command)
    }

    /// Run `invocation` to completion or until `timeout` elapses.
    ///
    /// On timeout the child is killed and reaped before returning, so no
    /// process outlives the call.
    pub async fn run(&self, invocation: &PluginInvocation, timeout: Duration) -> Result<SupervisedExit> {
        let span = info_span!(
            "shuttle.supervise",
            program = %invocation.program.display(),
            timeout_secs = timeout.as_secs_f64()
        );

        async move {
            let mut child = Self::command(invocation)?.spawn().map_err(|err| {
                ShuttleError::Supervisor(format!(
                    "spawn '{}': {}",
                    invocation.program.display(),
                    err
                ))
            })?;
            let started = Instant::now();
            event!(Level::DEBUG, pid = child.id(), "child started");

            loop {
                if let Some(status) = child.try_wait()? {
                    let exit = SupervisedExit::from(status);
                    event!(Level::DEBUG, ?exit, "child finished");
                    return Ok(exit);
                }

                let elapsed = started.elapsed();
                if elapsed >= timeout {
                    event!(
                        Level::WARN,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "child exceeded its budget, killing"
                    );
                    child.start_kill().map_err(|err| {
                        ShuttleError::Supervisor(format!("kill child: {}", err))
                    })?;
                    child.wait().await?;
                    return Ok(SupervisedExit::TimedOut { elapsed });
                }

                tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
            }
        }
        .instrument(span)
        .await
    }
}

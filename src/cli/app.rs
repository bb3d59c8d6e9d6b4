use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use shuttle::{
    ArchiveClient, CoordinatorServices, FileRunLedger, ObjectStoreGateway, PluginJob,
    ProcessExecutor, Run, RunCoordinator, ShuttleConfig, builtin, invoke, notify,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "shuttle")]
#[command(about = "Per-run conditions processing with supervised subsystem plugins")]
pub struct Cli {
    /// Configuration document
    #[arg(long, short, global = true, default_value = "shuttle.json")]
    pub config: PathBuf,

    /// trace, debug, info, warn or error
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Process unfinished runs
    Run {
        /// Stop after a single pass
        #[arg(long)]
        once: bool,
    },
    /// Child side of a plugin attempt
    #[command(hide = true)]
    Invoke {
        #[arg(long)]
        job: PathBuf,
    },
    /// Show the status of every subsystem for a run
    Status {
        #[arg(long)]
        run: u32,
    },
    /// Reopen a subsystem of a run
    Reset {
        #[arg(long)]
        run: u32,
        #[arg(long)]
        subsystem: String,
    },
    /// Record a closed run in the ledger
    Register {
        #[arg(long)]
        run: u32,
        #[arg(long)]
        start: DateTime<Utc>,
        #[arg(long)]
        end: DateTime<Utc>,
        #[arg(long, default_value = "PHYSICS")]
        run_type: String,
        /// Participating subsystem; all configured subsystems when omitted
        #[arg(long)]
        participant: Vec<String>,
        /// Run parameter as NAME=VALUE
        #[arg(long)]
        parameter: Vec<String>,
    },
}

pub struct App {
    cli: Cli,
}

impl App {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the selected command and return the process exit code.
    pub async fn run(self) -> Result<u8> {
        let config_path = self.cli.config.clone();
        let config = ShuttleConfig::load(&config_path)
            .with_context(|| format!("Failed to load configuration '{}'", config_path.display()))?;

        match self.cli.command {
            Command::Run { once } => {
                let coordinator = build_coordinator(config, &config_path)?;
                if once {
                    let report = coordinator.run_pass().await?;
                    println!(
                        "{} runs seen, {} completed, {} skipped",
                        report.runs_seen,
                        report.completed_runs.len(),
                        report.skipped_runs.len()
                    );
                } else {
                    coordinator
                        .run_forever(async {
                            let _ = tokio::signal::ctrl_c().await;
                        })
                        .await?;
                }
                Ok(0)
            }
            Command::Invoke { job } => {
                let job = PluginJob::load(&job)
                    .with_context(|| format!("Failed to read job '{}'", job.display()))?;
                let mut registry = builtin::registry_from_config(&config)?;
                let code = invoke(&config, &mut registry, &job).await;
                Ok(u8::try_from(code).unwrap_or(1))
            }
            Command::Status { run } => {
                let coordinator = build_coordinator(config, &config_path)?;
                for (subsystem, status) in coordinator.run_status(run).await? {
                    match status {
                        Some(status) => println!(
                            "{:<12} {:<12} attempts={} notified={} {}",
                            subsystem,
                            status.state.ledger_label(),
                            status.retry_count,
                            status.notified,
                            status.last_error.unwrap_or_default()
                        ),
                        None => println!("{:<12} -", subsystem),
                    }
                }
                Ok(0)
            }
            Command::Reset { run, subsystem } => {
                let coordinator = build_coordinator(config, &config_path)?;
                coordinator.reset(run, &subsystem).await?;
                println!("run {} {} reset", run, subsystem);
                Ok(0)
            }
            Command::Register {
                run,
                start,
                end,
                run_type,
                participant,
                parameter,
            } => {
                let mut record = Run::new(run, start, end).run_type(&run_type);
                for subsystem in &participant {
                    record = record.participant(subsystem);
                }
                for pair in &parameter {
                    let (name, value) = pair
                        .split_once('=')
                        .ok_or_else(|| anyhow!("parameter '{}' is not NAME=VALUE", pair))?;
                    record = record.parameter(name, value);
                }
                FileRunLedger::new(&config.ledger_path)
                    .register_run(record)
                    .await?;
                println!("run {} registered", run);
                Ok(0)
            }
        }
    }
}

fn build_coordinator(config: ShuttleConfig, config_path: &Path) -> Result<RunCoordinator> {
    let registry = builtin::registry_from_config(&config)?;
    let services = CoordinatorServices {
        ledger: Arc::new(FileRunLedger::new(&config.ledger_path)),
        archive: Arc::new(ArchiveClient::new(config.archive.clone(), config.retry.clone())),
        executor: Arc::new(ProcessExecutor::from_config(&config, config_path)?),
        gateway: ObjectStoreGateway::open(&config.stores),
        notifier: notify::from_policy(&config.notifications),
    };
    Ok(RunCoordinator::new(config, services, &registry)?)
}

mod cli;

use crate::cli::app::{App, Cli};
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    cli::init_logging(&cli.log_level)?;
    let code = App::new(cli).run().await?;
    Ok(ExitCode::from(code))
}

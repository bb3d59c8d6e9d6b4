pub mod app;

use anyhow::{Result, anyhow};
use tracing::Level;

/// Install the stderr subscriber at `level`.
pub fn init_logging(level: &str) -> Result<()> {
    let level: Level = level
        .parse()
        .map_err(|_| anyhow!("unknown log level '{}'", level))?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("logging setup failed: {}", err))
}

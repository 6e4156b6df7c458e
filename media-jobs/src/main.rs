use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use media_jobs::cli::{self, Cli, Command};
use media_jobs::config::AppConfig;
use media_jobs::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    let config = AppConfig::from_env().context("invalid configuration")?;

    // Only the long-running worker writes a log file.
    let log_dir = match args.command {
        Command::Worker => config.log_dir.as_deref(),
        _ => None,
    };
    let logging = init_logging(log_dir).context("failed to initialise logging")?;
    if let Some(directive) = &args.log_filter {
        logging.set_filter(directive)?;
    }
    let cancel = CancellationToken::new();
    logging.start_retention_cleanup(cancel.clone());

    info!(
        version = env!("CARGO_PKG_VERSION"),
        filter = %logging.filter(),
        "media-jobs starting"
    );
    let result = cli::run(args, config).await;
    cancel.cancel();
    result.context("command failed")
}

mod cli;
mod error;
mod logging;
mod watch;

use clap::Parser;
use job_sync::SyncCoordinator;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::error::CliError;
use crate::watch::Printer;

#[tokio::main]
async fn main() {
    // .env first so clap's env fallbacks see its values; real env vars win
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    logging::init(&cli.logging.to_config()).map_err(|err| CliError::Logging(err.to_string()))?;

    let config = cli.sync_config()?;
    info!(
        target: "synth_watch",
        backend = %config.backend_url,
        prefix = %config.api_prefix,
        job_id = config.initial_job_id.as_deref().unwrap_or(""),
        "starting"
    );
    if config.initial_job_id.is_none() {
        println!("no --job-id given; listing jobs only");
    }

    let handle = SyncCoordinator::connect(config)?;
    let mut snapshots = handle.subscribe();
    let mut printer = Printer::new();

    loop {
        let lines = printer.render(&snapshots.borrow_and_update());
        for line in lines {
            println!("{line}");
        }
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    warn!(target: "synth_watch", "coordinator stopped");
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!(target: "synth_watch", "interrupt received; shutting down");
                handle.shutdown().await?;
                break;
            }
        }
    }
    Ok(())
}

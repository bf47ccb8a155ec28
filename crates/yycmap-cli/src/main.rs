use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use yycmap_sync::{build_scheduler, RefreshPipeline, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "yycmap-cli")]
#[command(about = "YYC Business License Map command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one refresh cycle and exit (non-zero on failure).
    Sync,
    /// Serve the read API; also starts the cron scheduler when enabled.
    Serve,
    /// Run the cron scheduler in the foreground until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = yycmap_sync::run_refresh_once_from_env().await?;
            println!(
                "refresh complete: run_id={} fetched={} valid={} skipped={} truncated={}",
                summary.run_id, summary.fetched, summary.valid, summary.skipped, summary.truncated
            );
        }
        Commands::Serve => {
            let pipeline = Arc::new(RefreshPipeline::new(SyncConfig::from_env())?);
            if pipeline.config().scheduler_enabled {
                let scheduler = build_scheduler(pipeline.clone()).await?;
                scheduler.start().await?;
                info!(cron = %pipeline.config().refresh_cron, "refresh scheduler started");
            }
            yycmap_web::serve(pipeline, yycmap_web::port_from_env()).await?;
        }
        Commands::Schedule => {
            let pipeline = Arc::new(RefreshPipeline::new(SyncConfig::from_env())?);
            let scheduler = build_scheduler(pipeline.clone()).await?;
            scheduler.start().await?;
            info!(cron = %pipeline.config().refresh_cron, "refresh scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    Ok(())
}

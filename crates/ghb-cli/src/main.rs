use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ghb-cli")]
#[command(about = "Garmin Health Bridge command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one migration now and print the summary
    Sync,
    /// Serve the status page and the interval scheduler
    Serve,
    /// Authenticate against every configured service and exit
    Check,
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
            let result = ghb_sync::run_sync_once_from_env().await?;
            let totals = result.totals();
            println!(
                "sync complete: run_id={} fetched={} uploaded={} skipped_duplicate={} failed={}",
                result.run_id,
                totals.fetched,
                totals.uploaded,
                totals.skipped_duplicate,
                totals.failed
            );
        }
        Commands::Serve => serve().await?,
        Commands::Check => {
            let runtime = ghb_sync::SyncRuntime::from_env().await?;
            let mut failed = false;
            for (service, outcome) in runtime.migrator.check_connectivity().await {
                match outcome {
                    Ok(()) => println!("{service}: ok"),
                    Err(err) => {
                        failed = true;
                        println!("{service}: {err}");
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn serve() -> Result<()> {
    let runtime = ghb_sync::SyncRuntime::from_env().await?;

    if let Some(mut scheduler) =
        ghb_sync::maybe_build_scheduler(runtime.migrator.clone(), &runtime.config).await?
    {
        scheduler.start().await?;
    }

    let state = ghb_web::AppState::new(runtime.migrator.clone());
    let port = runtime.config.web_port;
    let shutdown = runtime.shutdown.clone();
    info!(port, "serving status page");

    ghb_web::serve(state, port, async move {
        let _ = tokio::signal::ctrl_c().await;
        warn!("shutdown signal received; lanes stop after their in-flight record");
        let _ = shutdown.send(true);
    })
    .await
}

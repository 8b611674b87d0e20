use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lpf_sync::{connect_pipeline, maybe_build_scheduler, SyncConfig};
use lpf_web::AppState;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "lpf-cli")]
#[command(about = "Listing phone fetcher: catalog harvest, phone leases and transfers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Run the worker API, plus the scheduler when enabled.
    Serve,
    /// Run one fetch tick, or single forced steps.
    Fetch {
        #[arg(long)]
        force: bool,
        /// Forced steps to run; ignored without --force.
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Transfer one harvested record, or run the missing-post catch-up.
    Transfer {
        #[arg(long)]
        missing: bool,
        #[arg(long)]
        force: bool,
    },
    /// Refresh one stale business title.
    SweepTitles,
    /// Move the fetch cursor back to the floor or to a given id.
    ResetCursor {
        #[arg(long)]
        to: Option<i64>,
    },
    /// Print the fetch cursor.
    Cursor,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    if let Commands::Migrate = cli.command {
        let store = lpf_storage::PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        lpf_storage::migrate(store.pool())
            .await
            .context("running migrations")?;
        tracing::info!("migrations applied");
        return Ok(());
    }

    let (pipeline, _store) = connect_pipeline(&config).await?;

    match cli.command {
        Commands::Migrate => {}
        Commands::Serve => {
            let pipeline = Arc::new(pipeline);
            let scheduler = maybe_build_scheduler(pipeline.clone(), &config.scheduler).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting scheduler")?;
                tracing::info!("scheduler started");
            }
            lpf_web::serve(AppState::new(pipeline), config.web_port).await?;
        }
        Commands::Fetch { force, steps } => {
            if force {
                for _ in 0..steps.max(1) {
                    print_json(&pipeline.fetcher.step(true).await?)?;
                }
            } else {
                print_json(&pipeline.fetcher.tick().await?)?;
            }
        }
        Commands::Transfer { missing, force } => {
            if missing {
                print_json(&pipeline.transfers.transfer_missing_posts(force).await?)?;
            } else {
                print_json(&pipeline.transfers.transfer_one(force).await?)?;
            }
        }
        Commands::SweepTitles => {
            print_json(&pipeline.titles.sweep_once().await?)?;
        }
        Commands::ResetCursor { to } => {
            print_json(&pipeline.fetcher.reset(to).await?)?;
        }
        Commands::Cursor => {
            print_json(&pipeline.fetcher.status().await?)?;
        }
    }

    Ok(())
}

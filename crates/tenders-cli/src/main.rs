use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tenders_core::SyncRunStatus;
use tenders_storage::{pg, PgSyncRunTracker, SyncRunTracker};
use tenders_sync::{connect_from_config, SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "tenders-cli")]
#[command(about = "Public procurement tender index command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync against the upstream OCDS feed.
    Sync {
        /// First release date to request (YYYY-MM-DD). Defaults to the trailing window.
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last release date to request (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Apply database migrations.
    Migrate,
    /// Serve the JSON API (and the sync scheduler when enabled).
    Serve {
        #[arg(long, env = "TENDERS_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Print the stored tender count and recent sync runs.
    Status {
        #[arg(long, default_value_t = 5)]
        history: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { from: None, to: None }) {
        Commands::Sync { from, to } => {
            if let (Some(from), Some(to)) = (from, to) {
                if from > to {
                    bail!("--from {from} is after --to {to}");
                }
            }
            config.settings.date_from = from;
            config.settings.date_to = to;

            let result = tenders_sync::run_sync_once(&config).await?;
            println!(
                "sync {}: run_id={} fetched={} upserted={} duration_ms={}",
                result.status, result.run_id, result.fetched, result.upserted, result.duration_ms
            );
            match (result.status, result.error) {
                (SyncRunStatus::Error, Some(error)) => bail!("sync failed: {error}"),
                (SyncRunStatus::Error, None) => bail!("sync failed"),
                _ => {}
            }
        }
        Commands::Migrate => {
            let pool = connect_from_config(&config).await?;
            pg::migrate(&pool).await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Serve { port } => {
            tenders_web::serve(config, port).await?;
        }
        Commands::Status { history } => {
            let pool = connect_from_config(&config).await?;
            let pipeline = SyncPipeline::from_config(&config, pool.clone())?;
            let status = pipeline.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);

            let runs = PgSyncRunTracker::new(pool).history(history).await?;
            for run in runs {
                println!(
                    "#{} {} started={} fetched={} upserted={}{}",
                    run.id,
                    run.status,
                    run.started_at.to_rfc3339(),
                    run.tenders_fetched,
                    run.tenders_upserted,
                    run.error_message
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}

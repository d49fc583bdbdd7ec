use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use haily_sync::{
    prune_operation_log, DateRange, HailyService, PgReportStore, SyncConfig, Trigger,
    DEFAULT_WINDOW_DAYS,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "haily-cli")]
#[command(about = "Storm report ingestion, verification and reimport")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every date whose cadence has elapsed.
    Poll,
    /// Ingest one date, appending reports not yet stored.
    Ingest {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Compare stored counts with the live source.
    Verify {
        /// Verify a single date instead of a window.
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = DEFAULT_WINDOW_DAYS)]
        days: u32,
    },
    /// Replace one date's reports with a fresh fetch.
    Reimport {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Verify a window and reimport mismatched dates inside the polling horizon.
    Reconcile {
        #[arg(long, default_value_t = 0)]
        offset: u32,
        #[arg(long, default_value_t = 16)]
        days: u32,
    },
    /// Operation counts for the last day and stored reports by type.
    Status,
    /// Drop operation log rows past the retention period.
    Prune {
        #[arg(long)]
        retention_days: Option<u32>,
    },
    Migrate,
    Serve,
    /// Run the polling scheduler in the foreground until interrupted.
    Schedule,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Poll) {
        Commands::Poll => {
            let service = HailyService::from_config(&config).await?;
            let sweep = service.ingest.poll_due(Utc::now()).await;
            print_json(&sweep)?;
        }
        Commands::Ingest { date } => {
            let service = HailyService::from_config(&config).await?;
            let summary = service.ingest.ingest(date).await?;
            print_json(&summary)?;
        }
        Commands::Verify { date, offset, days } => {
            let service = HailyService::from_config(&config).await?;
            match date {
                Some(date) => print_json(&service.verifier.verify_date(date).await?)?,
                None => {
                    let range =
                        DateRange::window(Utc::now().date_naive(), offset, days, config.earliest_date);
                    let run = service.verifier.verify_range(range, Trigger::Manual).await?;
                    print_json(&run)?;
                }
            }
        }
        Commands::Reimport { date } => {
            let service = HailyService::from_config(&config).await?;
            let report = service.reimport.reimport(date).await?;
            println!("{}", report.message());
            print_json(&report)?;
        }
        Commands::Reconcile { offset, days } => {
            let service = HailyService::from_config(&config).await?;
            let range = DateRange::window(Utc::now().date_naive(), offset, days, config.earliest_date);
            let report = service.reconcile(range, Trigger::Manual).await?;
            print_json(&report)?;
        }
        Commands::Status => {
            let service = HailyService::from_config(&config).await?;
            print_json(&service.status().await?)?;
        }
        Commands::Prune { retention_days } => {
            let service = HailyService::from_config(&config).await?;
            let days = retention_days.unwrap_or(config.log_retention_days);
            let deleted = prune_operation_log(service.ctx.store.as_ref(), Utc::now(), days).await?;
            println!("pruned {deleted} operation log rows older than {days} days");
        }
        Commands::Migrate => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            PgReportStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve => {
            haily_web::serve_from_env().await?;
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let service = HailyService::from_config(&config).await?;
            let sched = haily_sync::maybe_build_scheduler(service, &config)
                .await?
                .context("scheduler was not built")?;
            sched.start().await?;
            info!(cron = %config.poll_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("shutting down scheduler");
        }
    }

    Ok(())
}

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use ua_storage::LocalStore;
use ua_sync::{pipeline_from_config, AppConfig, DailySchedule, LogConfig, LogRotation, Scheduler};

#[derive(Debug, Parser)]
#[command(name = "ua-cli")]
#[command(about = "Uni Analytics sync and scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every job once, then keep running them on their daily schedule.
    Run,
    /// Refresh every local table from the LMS once.
    Sync,
    /// Recompute survey availability flags once.
    Validate,
    /// Snapshot the local store and prune old snapshots once.
    Backup,
    /// Create the local store and apply its schema.
    InitDb,
}

fn init_tracing(config: &LogConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.dir)
        .with_context(|| format!("creating log directory {}", config.dir.display()))?;

    let rotation = match config.rotation {
        LogRotation::Minutely => Rotation::MINUTELY,
        LogRotation::Hourly => Rotation::HOURLY,
        LogRotation::Daily => Rotation::DAILY,
        LogRotation::Never => Rotation::NEVER,
    };
    let appender = RollingFileAppender::builder()
        .rotation(rotation)
        .filename_prefix(&config.filename)
        .max_log_files(config.retention.max(1))
        .build(&config.dir)
        .context("creating rolling log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stdout))
        .with(
            fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .context("initializing tracing")?;

    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let _guard = init_tracing(&config.log)?;
    for notice in &config.notices {
        warn!("{notice}");
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = pipeline_from_config(&config).await?;
            let schedule = DailySchedule::from_config(&config, Local::now().naive_local());
            info!(
                sync = %config.sync_at,
                validation = %config.validation_at,
                backup = %config.backup_at,
                "scheduler starting"
            );
            let mut scheduler = Scheduler::start(&pipeline, schedule, config.poll_interval).await;
            scheduler
                .run_until(&pipeline, async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "could not listen for ctrl-c; stopping");
                    }
                })
                .await;
            pipeline.store().close().await;
        }
        Commands::Sync => {
            let pipeline = pipeline_from_config(&config).await?;
            let summary = pipeline.run_sync().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Validate => {
            let pipeline = pipeline_from_config(&config).await?;
            let report = pipeline.run_validation().await?;
            println!(
                "validation complete: evaluated={} updated={} skipped={}",
                report.evaluated, report.updated, report.skipped
            );
        }
        Commands::Backup => {
            let pipeline = pipeline_from_config(&config).await?;
            let report = pipeline.run_backup().await?;
            println!(
                "backup complete: snapshot={} sha256={} pruned={}",
                report.snapshot.path.display(),
                report.snapshot.sha256,
                report.pruned.len()
            );
        }
        Commands::InitDb => {
            let store = LocalStore::open(&config.local_db_path).await?;
            println!("local store ready at {}", store.path().display());
            store.close().await;
        }
    }

    Ok(())
}

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use harvest_core::{JobId, StartParameters};
use harvest_jobs::{
    Admission, HarvestConfig, HarvestRuntime, Job, ProgressChannel, SseLineWriter, StreamEnd,
};
use harvest_storage::PgRecordStore;
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "harvest-cli")]
#[command(about = "Harvest job orchestration command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the HTTP API.
    Serve,
    /// Run one harvest and stream its frames to stdout.
    Run {
        #[arg(long, default_value = "local")]
        owner: String,
        /// Stop after this many records.
        #[arg(long)]
        limit: Option<u64>,
        targets: Vec<String>,
    },
    /// Apply database migrations.
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,harvest=debug,sqlx=warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => harvest_web::serve_from_env().await?,
        Commands::Run {
            owner,
            limit,
            targets,
        } => run_once(owner, limit, targets).await?,
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgRecordStore::connect(&url).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
    }

    Ok(())
}

async fn run_once(owner: String, limit: Option<u64>, targets: Vec<String>) -> Result<()> {
    let config = HarvestConfig::from_env()?;
    let runtime = HarvestRuntime::start(&config).await?;

    let mut params = StartParameters {
        targets,
        ..StartParameters::default()
    };
    if let Some(limit) = limit {
        params.options.insert("limit".to_string(), JsonValue::from(limit));
    }

    let job_id = JobId::for_principal(&owner, Utc::now());
    let (job, mut events) = Job::with_channel(job_id.clone(), owner, params, 64);
    match runtime.scheduler.submit(job).await? {
        Admission::Started => info!(job_id = %job_id, mode = ?config.mode, "harvest started"),
        Admission::Queued { position } => info!(job_id = %job_id, position, "harvest queued"),
    }

    let mut channel = ProgressChannel::new(
        SseLineWriter::new(tokio::io::stdout()),
        runtime.channel.clone(),
    );
    let end = tokio::select! {
        end = channel.pipe(&mut events) => end,
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job_id, "interrupted; cancelling harvest");
            runtime.scheduler.cancel(&job_id).await?;
            channel.pipe(&mut events).await
        }
    };

    runtime.shutdown().await?;
    if end != StreamEnd::Terminal {
        bail!("harvest stream ended without a terminal frame ({end:?})");
    }
    Ok(())
}

//! Job orchestration for harvest: the scheduler actor, progress streaming and
//! environment-driven wiring of the runtime.

mod progress;
mod scheduler;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use harvest_adapters::{FixtureHarvester, Harvester, HarvesterMode, PageHarvester};
use harvest_storage::{
    HttpClientConfig, HttpFetcher, MemoryRecordStore, PgRecordStore, RecordStore, WriteBehindConfig,
    WriteBehindQueue,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use progress::{
    chunk, ChannelConfig, Delivery, FrameWriter, ProgressChannel, SseLineWriter, StreamEnd,
    StreamWriteError, DEFAULT_CHUNK_DELAY, DEFAULT_CHUNK_THRESHOLD,
};
pub use scheduler::{
    Admission, CancelOutcome, ExecutionUnitError, Job, JobScheduler, SchedulerConfig,
    SchedulerError, SchedulerHandle, SchedulerStatus,
};

pub const CRATE_NAME: &str = "harvest-jobs";

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database_url: Option<String>,
    pub scheduler: SchedulerConfig,
    pub channel: ChannelConfig,
    pub write_behind: WriteBehindConfig,
    pub mode: HarvesterMode,
    pub fixture_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl HarvestConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        let scheduler = SchedulerConfig {
            max_workers: parse("HARVEST_MAX_WORKERS", 4) as usize,
            max_queue_size: parse("HARVEST_MAX_QUEUE", 20) as usize,
            cancel_timeout: Duration::from_secs(parse("HARVEST_CANCEL_TIMEOUT_SECS", 5)),
            ..SchedulerConfig::default()
        };
        let channel = ChannelConfig {
            threshold: parse("HARVEST_CHUNK_THRESHOLD", DEFAULT_CHUNK_THRESHOLD as u64) as usize,
            chunk_delay: Duration::from_millis(parse("HARVEST_CHUNK_DELAY_MS", 50)),
            monotonic: lookup("HARVEST_MONOTONIC_PROGRESS")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
        };
        let write_behind = WriteBehindConfig {
            max_concurrent: parse("HARVEST_PERSIST_CONCURRENCY", 3) as usize,
            max_retries: parse("HARVEST_PERSIST_RETRIES", 3) as u32,
            ..WriteBehindConfig::default()
        };
        let mode = match lookup("HARVEST_MODE") {
            Some(value) => value.parse().context("parsing HARVEST_MODE")?,
            None => HarvesterMode::Fixture,
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            scheduler,
            channel,
            write_behind,
            mode,
            fixture_path: lookup("HARVEST_FIXTURE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./fixtures/harvest/sample.json")),
            user_agent: lookup("HARVEST_USER_AGENT")
                .unwrap_or_else(|| "harvest-bot/0.1".to_string()),
            http_timeout_secs: parse("HARVEST_HTTP_TIMEOUT_SECS", 20),
        })
    }

    pub fn build_harvester(&self) -> Result<Arc<dyn Harvester>> {
        match self.mode {
            HarvesterMode::Fixture => {
                let harvester = FixtureHarvester::from_path(&self.fixture_path)?;
                Ok(Arc::new(harvester))
            }
            HarvesterMode::Http => {
                let fetcher = HttpFetcher::new(HttpClientConfig {
                    timeout: Duration::from_secs(self.http_timeout_secs),
                    user_agent: Some(self.user_agent.clone()),
                    ..HttpClientConfig::default()
                })?;
                Ok(Arc::new(PageHarvester::new(Arc::new(fetcher))))
            }
        }
    }

    pub async fn open_store(&self) -> Result<Arc<dyn RecordStore>> {
        match &self.database_url {
            Some(url) => {
                let store = PgRecordStore::connect(url).await?;
                info!("persisting harvested records to postgres");
                Ok(Arc::new(store))
            }
            None => {
                warn!("DATABASE_URL not set; harvested records are kept in memory only");
                Ok(Arc::new(MemoryRecordStore::new()))
            }
        }
    }
}

/// Running scheduler plus the write-behind queue it feeds.
pub struct HarvestRuntime {
    pub scheduler: SchedulerHandle,
    pub queue: WriteBehindQueue,
    pub channel: ChannelConfig,
    task: JoinHandle<()>,
}

impl HarvestRuntime {
    pub async fn start(config: &HarvestConfig) -> Result<Self> {
        let store = config.open_store().await?;
        let harvester = config.build_harvester()?;
        Ok(Self::with_parts(config, store, harvester))
    }

    pub fn with_parts(
        config: &HarvestConfig,
        store: Arc<dyn RecordStore>,
        harvester: Arc<dyn Harvester>,
    ) -> Self {
        let queue = WriteBehindQueue::start(store, config.write_behind.clone());
        let (scheduler, task) =
            JobScheduler::spawn(config.scheduler.clone(), harvester, queue.clone());
        Self {
            scheduler,
            queue,
            channel: config.channel.clone(),
            task,
        }
    }

    /// Stops the scheduler, then flushes every pending batch.
    pub async fn shutdown(self) -> Result<()> {
        if let Err(err) = self.scheduler.shutdown().await {
            warn!(error = %err, "scheduler already stopped");
        }
        self.task.await.context("joining scheduler task")?;
        match self.queue.shutdown().await {
            Ok(stats) => info!(
                persisted = stats.persisted,
                dropped = stats.dropped,
                retried = stats.retried,
                "write-behind queue drained"
            ),
            Err(err) => warn!(error = %err, "write-behind queue already closed"),
        }
        Ok(())
    }
}

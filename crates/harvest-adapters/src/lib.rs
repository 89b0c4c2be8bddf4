//! Harvester contract plus fixture-first and HTTP page implementations.
//!
//! A harvester runs inside an execution unit. It owns its parameters, talks
//! to the outside world only through [`ProgressReporter`], and must poll
//! [`HarvestContext::cancelled`] at its await points so cooperative
//! cancellation stops it promptly. Terminal events (completion, errors) are
//! produced by the scheduler from the returned `Result`; harvesters report
//! intermediate progress only, in the 0–80 band.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use harvest_core::{HarvestRecord, JobId, ProgressEvent, StartParameters};
use harvest_storage::{sha256_hex, FetchError, HttpFetcher};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "harvest-adapters";

/// Upper bound of the progress band harvesters report in; the rest is
/// reserved for result delivery.
pub const HARVEST_PROGRESS_CEILING: u8 = 80;

const MAX_BODY_CHARS: usize = 4_000;

#[derive(Debug, Error)]
pub enum HarvesterError {
    #[error("cancelled")]
    Cancelled,
    #[error("invalid start parameters: {0}")]
    InvalidParameters(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("selector error: {0}")]
    Selector(String),
    #[error("{0}")]
    Message(String),
}

/// Outbound half of an execution unit's message channel.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::Sender<ProgressEvent>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ProgressEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns `false` once nobody is listening any more.
    pub async fn report(&self, event: ProgressEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    pub async fn progress(&self, progress: u8, phase: &str, status: impl Into<String>) -> bool {
        self.report(
            ProgressEvent::at(progress.min(HARVEST_PROGRESS_CEILING))
                .with_phase(phase)
                .with_status(status),
        )
        .await
    }
}

#[derive(Debug, Clone)]
pub struct HarvestContext {
    pub job_id: JobId,
    pub reporter: ProgressReporter,
    cancel: CancellationToken,
}

impl HarvestContext {
    pub fn new(job_id: JobId, reporter: ProgressReporter, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            reporter,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Sleeps unless cancelled first.
    pub async fn pause(&self, duration: Duration) -> Result<(), HarvesterError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(HarvesterError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }
}

#[async_trait]
pub trait Harvester: Send + Sync {
    fn name(&self) -> &'static str;

    async fn harvest(
        &self,
        params: StartParameters,
        ctx: HarvestContext,
    ) -> Result<Vec<HarvestRecord>, HarvesterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvesterMode {
    Fixture,
    Http,
}

impl FromStr for HarvesterMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "fixture" => Ok(Self::Fixture),
            "http" => Ok(Self::Http),
            other => anyhow::bail!("unknown harvester mode {other:?} (expected fixture or http)"),
        }
    }
}

/// Recorded harvest session replayed page by page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub page_delay_ms: u64,
    /// Fail the replay once this many pages have been delivered.
    #[serde(default)]
    pub fail_after_pages: Option<usize>,
    pub records: Vec<HarvestRecord>,
}

fn default_page_size() -> usize {
    4
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureHarvester {
    bundle: FixtureBundle,
}

impl FixtureHarvester {
    pub fn new(bundle: FixtureBundle) -> Self {
        Self { bundle }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_fixture_bundle(path)?))
    }
}

#[async_trait]
impl Harvester for FixtureHarvester {
    fn name(&self) -> &'static str {
        "fixture"
    }

    async fn harvest(
        &self,
        params: StartParameters,
        ctx: HarvestContext,
    ) -> Result<Vec<HarvestRecord>, HarvesterError> {
        let limit = params
            .options
            .get("limit")
            .and_then(JsonValue::as_u64)
            .map(|v| v as usize)
            .unwrap_or(usize::MAX);
        let records = &self.bundle.records[..self.bundle.records.len().min(limit)];
        let page_size = self.bundle.page_size.max(1);
        let total_pages = records.len().div_ceil(page_size).max(1);
        let delay = Duration::from_millis(self.bundle.page_delay_ms);

        ctx.reporter
            .progress(5, "starting", format!("replaying {}", self.bundle.fixture_id))
            .await;

        let mut out = Vec::with_capacity(records.len());
        for (index, page) in records.chunks(page_size).enumerate() {
            if self.bundle.fail_after_pages == Some(index) {
                return Err(HarvesterError::Message(format!(
                    "fixture {} failed after {index} pages",
                    self.bundle.fixture_id
                )));
            }
            ctx.pause(delay).await?;

            out.extend(page.iter().cloned().map(|mut record| {
                record
                    .attributes
                    .insert("fixtureId".into(), JsonValue::from(self.bundle.fixture_id.clone()));
                record
            }));
            let progress = 5 + ((index + 1) * 75 / total_pages) as u8;
            let listening = ctx
                .reporter
                .progress(progress, "collecting", format!("page {}/{}", index + 1, total_pages))
                .await;
            if !listening {
                debug!(job_id = %ctx.job_id, "progress listener gone; continuing replay");
            }
        }

        Ok(out)
    }
}

/// Fetches each target URL and records its title and visible text.
#[derive(Debug, Clone)]
pub struct PageHarvester {
    fetcher: Arc<HttpFetcher>,
}

impl PageHarvester {
    pub fn new(fetcher: Arc<HttpFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Harvester for PageHarvester {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn harvest(
        &self,
        params: StartParameters,
        ctx: HarvestContext,
    ) -> Result<Vec<HarvestRecord>, HarvesterError> {
        if params.targets.is_empty() {
            return Err(HarvesterError::InvalidParameters(
                "at least one target url is required".into(),
            ));
        }

        let total = params.targets.len();
        let mut out = Vec::with_capacity(total);
        let mut failures = 0usize;

        for (index, url) in params.targets.iter().enumerate() {
            let fetched = tokio::select! {
                _ = ctx.cancelled() => return Err(HarvesterError::Cancelled),
                fetched = self.fetcher.fetch_bytes(ctx.job_id.as_str(), url) => fetched,
            };

            match fetched {
                Ok(response) => {
                    let html = String::from_utf8_lossy(&response.body);
                    out.push(page_record(&response.final_url, &html)?);
                }
                Err(err) => {
                    failures += 1;
                    warn!(job_id = %ctx.job_id, url, error = %err, "page fetch failed");
                }
            }

            let progress = 10 + ((index + 1) * 70 / total) as u8;
            ctx.reporter
                .progress(progress, "fetching", format!("{}/{} {}", index + 1, total, url))
                .await;
        }

        if out.is_empty() && failures > 0 {
            return Err(HarvesterError::Message(format!("all {failures} target fetches failed")));
        }
        Ok(out)
    }
}

/// Builds a record from a fetched HTML page. Kept synchronous: parsed
/// documents are not `Send`.
pub fn page_record(url: &str, html: &str) -> Result<HarvestRecord, HarvesterError> {
    let document = Html::parse_document(html);
    let title = select_first_text(&document, "title")?;
    let body =
        select_first_text(&document, "body")?.map(|text| truncate_chars(&text, MAX_BODY_CHARS));
    let link_count = count_matches(&document, "a[href]")?;

    let mut attributes = Map::new();
    attributes.insert("linkCount".into(), JsonValue::from(link_count));
    attributes.insert("contentHash".into(), JsonValue::from(sha256_hex(html.as_bytes())));

    Ok(HarvestRecord {
        id: url.to_string(),
        url: Some(url.to_string()),
        title,
        body,
        captured_at: Utc::now(),
        attributes,
    })
}

fn parse_selector(selector: &str) -> Result<Selector, HarvesterError> {
    Selector::parse(selector).map_err(|e| HarvesterError::Selector(format!("{selector}: {e}")))
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, HarvesterError> {
    let selector = parse_selector(selector)?;
    Ok(document
        .select(&selector)
        .next()
        .map(|node| node.text().collect::<Vec<_>>().join(" "))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty()))
}

fn count_matches(document: &Html, selector: &str) -> Result<usize, HarvesterError> {
    let selector = parse_selector(selector)?;
    Ok(document.select(&selector).count())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

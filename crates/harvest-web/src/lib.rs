//! Axum surface for harvest: start a scrape as an SSE stream, inspect and
//! cancel jobs.

mod auth;

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::{delete, post},
    Json, Router,
};
use chrono::Utc;
use harvest_core::{JobId, ProgressEvent, StartParameters};
use harvest_jobs::{
    Admission, CancelOutcome, ChannelConfig, FrameWriter, HarvestConfig, HarvestRuntime, Job,
    ProgressChannel, SchedulerError, SchedulerHandle, StreamEnd, StreamWriteError,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, info_span, warn, Instrument};

pub use auth::{AuthError, AuthProvider, BearerTokenAuth, Principal};

pub const CRATE_NAME: &str = "harvest-web";

pub const JOB_ID_HEADER: &str = "x-job-id";

const JOB_EVENT_CAPACITY: usize = 64;
const SSE_BUFFER: usize = 16;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub auth: Arc<dyn AuthProvider>,
    pub channel: ChannelConfig,
}

impl AppState {
    pub fn new(
        scheduler: SchedulerHandle,
        auth: Arc<dyn AuthProvider>,
        channel: ChannelConfig,
    ) -> Self {
        Self {
            scheduler,
            auth,
            channel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub tokens_file: PathBuf,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            port: std::env::var("HARVEST_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
            tokens_file: std::env::var("HARVEST_TOKENS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./tokens.yaml")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeStatus {
    pub active_workers: usize,
    pub queue_length: usize,
    pub active_jobs: Vec<JobId>,
    pub max_workers: usize,
    pub max_queue_size: usize,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/scrape", post(start_scrape_handler).get(scrape_status_handler))
        .route("/scrape/{job_id}", delete(cancel_scrape_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let web = WebConfig::from_env();
    let config = HarvestConfig::from_env()?;
    let auth = BearerTokenAuth::from_file(&web.tokens_file)?;
    if auth.is_empty() {
        warn!(
            path = %web.tokens_file.display(),
            "no bearer tokens configured; every request will be rejected"
        );
    }

    let runtime = HarvestRuntime::start(&config).await?;
    let state = AppState::new(runtime.scheduler.clone(), Arc::new(auth), runtime.channel.clone());

    let listener = TcpListener::bind(("0.0.0.0", web.port))
        .await
        .with_context(|| format!("binding port {}", web.port))?;
    info!(port = web.port, mode = ?config.mode, "harvest web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler failed");
            }
        })
        .await?;

    info!("shutting down");
    runtime.shutdown().await
}

/// SSE body writer; the response stream reads from the other end.
struct SseEventWriter {
    tx: Option<mpsc::Sender<Result<Event, Infallible>>>,
}

#[async_trait]
impl FrameWriter for SseEventWriter {
    async fn write_frame(&mut self, frame: &ProgressEvent) -> Result<(), StreamWriteError> {
        let tx = self.tx.as_ref().ok_or(StreamWriteError::Disconnected)?;
        let event = Event::default().data(serde_json::to_string(frame)?);
        tx.send(Ok(event)).await.map_err(|_| StreamWriteError::Disconnected)
    }

    async fn close(&mut self) {
        self.tx.take();
    }

    async fn disconnected(&mut self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending::<()>().await,
        }
    }
}

async fn start_scrape_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let principal = match state.auth.authenticate(&headers).await {
        Ok(principal) => principal,
        Err(err) => return api_error(StatusCode::UNAUTHORIZED, err.to_string()),
    };

    let params = if body.iter().all(u8::is_ascii_whitespace) {
        StartParameters::default()
    } else {
        match serde_json::from_slice::<StartParameters>(&body) {
            Ok(params) => params,
            Err(err) => {
                return api_error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid start parameters: {err}"),
                )
            }
        }
    };

    let job_id = JobId::for_principal(&principal.id, Utc::now());
    let (job, mut events) = Job::with_channel(
        job_id.clone(),
        principal.id.clone(),
        params,
        JOB_EVENT_CAPACITY,
    );
    match state.scheduler.submit(job).await {
        Ok(Admission::Started) => {
            info!(job_id = %job_id, owner_id = %principal.id, "scrape started")
        }
        Ok(Admission::Queued { position }) => {
            info!(job_id = %job_id, owner_id = %principal.id, position, "scrape queued")
        }
        Err(err) => return scheduler_error(err),
    }

    let (tx, rx) = mpsc::channel(SSE_BUFFER);
    let writer = SseEventWriter { tx: Some(tx) };
    let scheduler = state.scheduler.clone();
    let channel_config = state.channel.clone();
    let span = info_span!("scrape_stream", job_id = %job_id);
    let pump_job_id = job_id.clone();
    tokio::spawn(
        async move {
            let mut channel = ProgressChannel::new(writer, channel_config);
            match channel.pipe(&mut events).await {
                StreamEnd::Disconnected | StreamEnd::WriteFailed => {
                    info!(frames = channel.frames_written(), "client went away; cancelling job");
                    if let Err(err) = scheduler.cancel(&pump_job_id).await {
                        warn!(error = %err, "cancelling abandoned job failed");
                    }
                }
                end => debug!(?end, frames = channel.frames_written(), "scrape stream finished"),
            }
        }
        .instrument(span),
    );

    let mut response = Sse::new(ReceiverStream::new(rx)).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    if let Ok(value) = HeaderValue::from_str(job_id.as_str()) {
        response_headers.insert(JOB_ID_HEADER, value);
    }
    response
}

async fn scrape_status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scheduler.status().await {
        Ok(status) => Json(ScrapeStatus {
            active_workers: status.active_count,
            queue_length: status.queue_length,
            active_jobs: status.active_job_ids,
            max_workers: status.max_workers,
            max_queue_size: status.max_queue_size,
        })
        .into_response(),
        Err(err) => scheduler_error(err),
    }
}

async fn cancel_scrape_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(job_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let principal = match state.auth.authenticate(&headers).await {
        Ok(principal) => principal,
        Err(err) => return api_error(StatusCode::UNAUTHORIZED, err.to_string()),
    };

    let job_id = JobId::new(job_id);
    match state.scheduler.cancel_for_owner(&job_id, &principal.id).await {
        Ok(CancelOutcome::Cancelled { .. } | CancelOutcome::Dequeued | CancelOutcome::Finished) => {
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(CancelOutcome::NotOwner) => {
            api_error(StatusCode::FORBIDDEN, "job belongs to another principal")
        }
        Ok(CancelOutcome::NotFound) => api_error(StatusCode::NOT_FOUND, "job not found"),
        Err(err) => scheduler_error(err),
    }
}

fn scheduler_error(err: SchedulerError) -> Response {
    let status = match err {
        SchedulerError::DuplicateJob { .. } => StatusCode::CONFLICT,
        SchedulerError::QueueFull { .. } | SchedulerError::Closed => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    api_error(status, err.to_string())
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

//! Bounded-concurrency job scheduler.
//!
//! All bookkeeping lives in one task ([`JobScheduler::run`]). Callers talk to
//! it through a cloneable [`SchedulerHandle`]; each command carries a oneshot
//! reply. Execution units are spawned tasks that only exchange owned
//! messages with the scheduler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use harvest_adapters::{HarvestContext, Harvester, HarvesterError, ProgressReporter};
use harvest_core::{HarvestRecord, JobId, ProgressEvent, StartParameters};
use harvest_storage::WriteBehindQueue;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    pub max_queue_size: usize,
    /// How long a cancelled unit gets to stop on its own before it is aborted.
    pub cancel_timeout: Duration,
    /// Buffer between an execution unit and its supervisor.
    pub unit_channel_capacity: usize,
    pub command_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue_size: 20,
            cancel_timeout: Duration::from_secs(5),
            unit_channel_capacity: 64,
            command_capacity: 128,
        }
    }
}

/// A unit of work submitted for one owner.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub owner_id: String,
    pub params: StartParameters,
    pub sink: mpsc::Sender<ProgressEvent>,
}

impl Job {
    pub fn new(
        id: JobId,
        owner_id: impl Into<String>,
        params: StartParameters,
        sink: mpsc::Sender<ProgressEvent>,
    ) -> Self {
        Self {
            id,
            owner_id: owner_id.into(),
            params,
            sink,
        }
    }

    /// Builds a job together with the receiving end of its progress sink.
    pub fn with_channel(
        id: JobId,
        owner_id: impl Into<String>,
        params: StartParameters,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, owner_id, params, tx), rx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    /// One-based position in the queue.
    Queued { position: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The unit was stopped; `forced` when it had to be aborted.
    Cancelled { forced: bool },
    /// The unit delivered its terminal frame before the cancel took hold.
    Finished,
    /// Removed from the queue before it started.
    Dequeued,
    NotOwner,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub active_count: usize,
    pub queue_length: usize,
    pub active_job_ids: Vec<JobId>,
    pub max_workers: usize,
    pub max_queue_size: usize,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {job_id} conflicts with an active or queued job for owner {owner_id}")]
    DuplicateJob { job_id: JobId, owner_id: String },
    #[error("job queue is full ({max_queue_size} waiting)")]
    QueueFull { max_queue_size: usize },
    #[error("scheduler is shut down")]
    Closed,
}

/// Why an execution unit ended without results.
#[derive(Debug, Error)]
pub enum ExecutionUnitError {
    #[error(transparent)]
    Harvest(#[from] HarvesterError),
    #[error("execution unit crashed")]
    Crashed,
    #[error("execution unit aborted")]
    Aborted,
}

impl From<JoinError> for ExecutionUnitError {
    fn from(err: JoinError) -> Self {
        if err.is_panic() {
            Self::Crashed
        } else {
            Self::Aborted
        }
    }
}

enum Command {
    Submit {
        job: Job,
        reply: oneshot::Sender<Result<Admission, SchedulerError>>,
    },
    Cancel {
        job_id: JobId,
        owner_id: Option<String>,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Status(oneshot::Sender<SchedulerStatus>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    pub async fn submit(&self, job: Job) -> Result<Admission, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit { job, reply })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    pub async fn cancel(&self, job_id: &JobId) -> Result<CancelOutcome, SchedulerError> {
        self.send_cancel(job_id.clone(), None).await
    }

    /// Like [`cancel`](Self::cancel) but refuses jobs belonging to someone else.
    pub async fn cancel_for_owner(
        &self,
        job_id: &JobId,
        owner_id: &str,
    ) -> Result<CancelOutcome, SchedulerError> {
        self.send_cancel(job_id.clone(), Some(owner_id.to_string())).await
    }

    async fn send_cancel(
        &self,
        job_id: JobId,
        owner_id: Option<String>,
    ) -> Result<CancelOutcome, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Cancel {
                job_id,
                owner_id,
                reply,
            })
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    pub async fn status(&self) -> Result<SchedulerStatus, SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status(reply))
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Cancels every job and stops the scheduler. Later calls fail with
    /// [`SchedulerError::Closed`].
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(reply))
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }
}

/// What the supervisor saw when its unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    TerminalSent,
    Stopped,
}

struct ActiveJob {
    seq: u64,
    owner_id: String,
    sink: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
    abort: AbortHandle,
    done: oneshot::Receiver<Settled>,
    started_at: Instant,
}

#[derive(Debug)]
struct UnitExit {
    job_id: JobId,
    seq: u64,
}

pub struct JobScheduler {
    config: SchedulerConfig,
    harvester: Arc<dyn Harvester>,
    queue: WriteBehindQueue,
    commands: mpsc::Receiver<Command>,
    exit_tx: mpsc::UnboundedSender<UnitExit>,
    exits: mpsc::UnboundedReceiver<UnitExit>,
    active: HashMap<JobId, ActiveJob>,
    pending: VecDeque<Job>,
    /// Cancelled units that have not stopped yet; they still hold a slot.
    retiring: HashSet<u64>,
    next_seq: u64,
}

impl JobScheduler {
    pub fn new(
        config: SchedulerConfig,
        harvester: Arc<dyn Harvester>,
        queue: WriteBehindQueue,
    ) -> (Self, SchedulerHandle) {
        let (tx, commands) = mpsc::channel(config.command_capacity.max(1));
        let (exit_tx, exits) = mpsc::unbounded_channel();
        let scheduler = Self {
            config,
            harvester,
            queue,
            commands,
            exit_tx,
            exits,
            active: HashMap::new(),
            pending: VecDeque::new(),
            retiring: HashSet::new(),
            next_seq: 0,
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Spawns [`run`](Self::run) on the current runtime.
    pub fn spawn(
        config: SchedulerConfig,
        harvester: Arc<dyn Harvester>,
        queue: WriteBehindQueue,
    ) -> (SchedulerHandle, JoinHandle<()>) {
        let (scheduler, handle) = Self::new(config, harvester, queue);
        (handle, tokio::spawn(scheduler.run()))
    }

    pub async fn run(mut self) {
        info!(
            max_workers = self.config.max_workers,
            max_queue_size = self.config.max_queue_size,
            harvester = self.harvester.name(),
            "job scheduler started"
        );
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if let Some(reply) = self.handle(command) {
                            self.shutdown_all().await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                    None => {
                        self.shutdown_all().await;
                        break;
                    }
                },
                Some(exit) = self.exits.recv() => self.on_unit_exit(exit),
            }
        }
        self.commands.close();
        info!("job scheduler stopped");
    }

    /// Returns the reply channel when the command asks for shutdown.
    fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Submit { job, reply } => {
                let _ = reply.send(self.submit(job));
            }
            Command::Cancel {
                job_id,
                owner_id,
                reply,
            } => self.cancel(job_id, owner_id, reply),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown(reply) => return Some(reply),
        }
        None
    }

    fn live_units(&self) -> usize {
        self.active.len() + self.retiring.len()
    }

    fn submit(&mut self, job: Job) -> Result<Admission, SchedulerError> {
        let conflict = self.active.contains_key(&job.id)
            || self.active.values().any(|a| a.owner_id == job.owner_id)
            || self
                .pending
                .iter()
                .any(|q| q.id == job.id || q.owner_id == job.owner_id);
        if conflict {
            debug!(job_id = %job.id, owner_id = %job.owner_id, "rejecting duplicate job");
            return Err(SchedulerError::DuplicateJob {
                job_id: job.id,
                owner_id: job.owner_id,
            });
        }

        if self.live_units() < self.config.max_workers && self.pending.is_empty() {
            self.start(job);
            return Ok(Admission::Started);
        }

        if self.pending.len() >= self.config.max_queue_size {
            warn!(job_id = %job.id, queue_length = self.pending.len(), "job queue full");
            return Err(SchedulerError::QueueFull {
                max_queue_size: self.config.max_queue_size,
            });
        }

        let position = self.pending.len() + 1;
        deliver(
            &job.sink,
            ProgressEvent::at(0)
                .with_phase("queued")
                .with_status(format!("waiting for a worker (position {position})")),
        );
        info!(job_id = %job.id, position, "job queued");
        self.pending.push_back(job);
        Ok(Admission::Queued { position })
    }

    fn start(&mut self, job: Job) {
        let Job {
            id,
            owner_id,
            params,
            sink,
        } = job;
        let seq = self.next_seq;
        self.next_seq += 1;

        let cancel = CancellationToken::new();
        let (reporter, events) = ProgressReporter::channel(self.config.unit_channel_capacity);
        let ctx = HarvestContext::new(id.clone(), reporter, cancel.clone());
        let harvester = self.harvester.clone();
        let span = info_span!("job_unit", job_id = %id, owner_id = %owner_id);
        let unit =
            tokio::spawn(async move { harvester.harvest(params, ctx).await }.instrument(span));

        let (done_tx, done) = oneshot::channel();
        let supervisor = Supervisor {
            job_id: id.clone(),
            owner_id: owner_id.clone(),
            seq,
            sink: sink.clone(),
            cancel: cancel.clone(),
            queue: self.queue.clone(),
            done: done_tx,
            exit: self.exit_tx.clone(),
        };
        let abort = unit.abort_handle();
        tokio::spawn(supervisor.run(unit, events));

        info!(job_id = %id, owner_id = %owner_id, active = self.active.len() + 1, "job started");
        self.active.insert(
            id,
            ActiveJob {
                seq,
                owner_id,
                sink,
                cancel,
                abort,
                done,
                started_at: Instant::now(),
            },
        );
    }

    fn cancel(
        &mut self,
        job_id: JobId,
        owner_id: Option<String>,
        reply: oneshot::Sender<CancelOutcome>,
    ) {
        let owned = |job_owner: &str| owner_id.as_deref().map_or(true, |o| o == job_owner);

        if let Some(active) = self.active.get(&job_id) {
            if !owned(&active.owner_id) {
                let _ = reply.send(CancelOutcome::NotOwner);
                return;
            }
        }
        if let Some(active) = self.active.remove(&job_id) {
            self.retiring.insert(active.seq);
            let timeout = self.config.cancel_timeout;
            tokio::spawn(async move {
                let outcome = reap(job_id, active, timeout).await;
                let _ = reply.send(outcome);
            });
            return;
        }

        if let Some(index) = self.pending.iter().position(|job| job.id == job_id) {
            if !owned(&self.pending[index].owner_id) {
                let _ = reply.send(CancelOutcome::NotOwner);
                return;
            }
            if let Some(job) = self.pending.remove(index) {
                info!(job_id = %job.id, "queued job cancelled");
                deliver(&job.sink, ProgressEvent::cancelled());
            }
            let _ = reply.send(CancelOutcome::Dequeued);
            return;
        }

        let _ = reply.send(CancelOutcome::NotFound);
    }

    fn status(&self) -> SchedulerStatus {
        let mut active_job_ids: Vec<JobId> = self.active.keys().cloned().collect();
        active_job_ids.sort();
        SchedulerStatus {
            active_count: self.active.len(),
            queue_length: self.pending.len(),
            active_job_ids,
            max_workers: self.config.max_workers,
            max_queue_size: self.config.max_queue_size,
        }
    }

    fn on_unit_exit(&mut self, exit: UnitExit) {
        if self.active.get(&exit.job_id).map(|a| a.seq) == Some(exit.seq) {
            if let Some(active) = self.active.remove(&exit.job_id) {
                info!(
                    job_id = %exit.job_id,
                    elapsed_ms = active.started_at.elapsed().as_millis() as u64,
                    "job finished"
                );
            }
        } else if self.retiring.remove(&exit.seq) {
            debug!(job_id = %exit.job_id, "cancelled unit released its slot");
        }
        self.start_waiting();
    }

    fn start_waiting(&mut self) {
        while self.live_units() < self.config.max_workers {
            let Some(job) = self.pending.pop_front() else {
                break;
            };
            self.start(job);
        }
    }

    async fn shutdown_all(&mut self) {
        info!(
            active = self.active.len(),
            queued = self.pending.len(),
            "shutting down job scheduler"
        );
        for job in self.pending.drain(..) {
            deliver(&job.sink, ProgressEvent::cancelled());
        }
        let timeout = self.config.cancel_timeout;
        let mut reapers = JoinSet::new();
        for (job_id, active) in self.active.drain() {
            reapers.spawn(reap(job_id, active, timeout));
        }
        while reapers.join_next().await.is_some() {}
    }
}

/// Cooperative cancel first, forced abort once `timeout` passes.
async fn reap(job_id: JobId, mut active: ActiveJob, timeout: Duration) -> CancelOutcome {
    active.cancel.cancel();
    let settled = match tokio::time::timeout(timeout, &mut active.done).await {
        Ok(Ok(settled)) => Some(settled),
        Ok(Err(_)) => Some(Settled::Stopped),
        Err(_) => None,
    };

    let outcome = match settled {
        Some(Settled::TerminalSent) => {
            debug!(job_id = %job_id, "job finished before cancellation took effect");
            return CancelOutcome::Finished;
        }
        Some(Settled::Stopped) => CancelOutcome::Cancelled { forced: false },
        None => {
            warn!(
                job_id = %job_id,
                timeout_ms = timeout.as_millis() as u64,
                "unit ignored cancellation; aborting"
            );
            active.abort.abort();
            CancelOutcome::Cancelled { forced: true }
        }
    };
    info!(job_id = %job_id, ?outcome, "job cancelled");
    deliver(&active.sink, ProgressEvent::cancelled());
    outcome
}

/// Pushes an event without blocking the caller; a full sink gets the event
/// from a short-lived task instead.
fn deliver(sink: &mpsc::Sender<ProgressEvent>, event: ProgressEvent) {
    match sink.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(event)) => {
            let sink = sink.clone();
            tokio::spawn(async move {
                let _ = sink.send(event).await;
            });
        }
        Err(TrySendError::Closed(_)) => debug!("progress sink closed; event dropped"),
    }
}

/// Relays one unit's events to its job sink and reports the outcome.
struct Supervisor {
    job_id: JobId,
    owner_id: String,
    seq: u64,
    sink: mpsc::Sender<ProgressEvent>,
    cancel: CancellationToken,
    queue: WriteBehindQueue,
    done: oneshot::Sender<Settled>,
    exit: mpsc::UnboundedSender<UnitExit>,
}

impl Supervisor {
    async fn run(
        self,
        mut unit: JoinHandle<Result<Vec<HarvestRecord>, HarvesterError>>,
        mut events: mpsc::Receiver<ProgressEvent>,
    ) {
        let joined = loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.forward(event).await,
                joined = &mut unit => break joined,
            }
        };
        while let Ok(event) = events.try_recv() {
            self.forward(event).await;
        }

        let settled = if self.cancel.is_cancelled() {
            debug!(job_id = %self.job_id, "unit stopped after cancellation");
            Settled::Stopped
        } else {
            self.finish(joined).await
        };

        let _ = self.done.send(settled);
        let _ = self.exit.send(UnitExit {
            job_id: self.job_id,
            seq: self.seq,
        });
    }

    async fn forward(&self, event: ProgressEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.sink.send(event) => {}
        }
    }

    async fn finish(
        &self,
        joined: Result<Result<Vec<HarvestRecord>, HarvesterError>, JoinError>,
    ) -> Settled {
        let outcome = joined
            .map_err(ExecutionUnitError::from)
            .and_then(|result| result.map_err(ExecutionUnitError::from));

        let event = match outcome {
            Ok(records) => return self.complete(records).await,
            Err(ExecutionUnitError::Harvest(HarvesterError::Cancelled)) => {
                ProgressEvent::cancelled()
            }
            Err(err @ ExecutionUnitError::Harvest(_)) => {
                warn!(job_id = %self.job_id, error = %err, "harvest failed");
                ProgressEvent::failed(err.to_string())
            }
            Err(err) => {
                error!(
                    job_id = %self.job_id,
                    error = %err,
                    "execution unit terminated abnormally"
                );
                ProgressEvent::failed(err.to_string())
            }
        };

        if self.cancel.is_cancelled() {
            return Settled::Stopped;
        }
        self.forward(event).await;
        Settled::TerminalSent
    }

    /// Hands the records to the write-behind queue. A cancel that lands
    /// before the hand-off discards them; once handed off the job is
    /// complete and a later cancel reports [`CancelOutcome::Finished`].
    async fn complete(&self, records: Vec<HarvestRecord>) -> Settled {
        if self.cancel.is_cancelled() {
            debug!(job_id = %self.job_id, "records discarded after cancellation");
            return Settled::Stopped;
        }
        info!(job_id = %self.job_id, records = records.len(), "harvest complete");
        if let Err(err) = self
            .queue
            .enqueue(self.owner_id.clone(), self.job_id.to_string(), records.clone())
            .await
        {
            error!(
                job_id = %self.job_id,
                error = %err,
                "records not handed to write-behind queue"
            );
        }
        // Bypasses the cancel check in `forward` so the terminal frame
        // matches what was persisted.
        deliver(&self.sink, ProgressEvent::complete(records));
        Settled::TerminalSent
    }
}

//! Single-writer task that owns the synchronized view.
//!
//! The coordinator is the only place state changes. Stream connections and
//! poll schedulers run as their own tasks under the [`AbortRegistry`] and
//! report back over mpsc; callers drive it through a cloneable [`SyncHandle`]
//! and read [`Snapshot`]s from a watch channel.

use std::ops::ControlFlow;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::abort::AbortRegistry;
use crate::client::{BackendClient, JobsBackend};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::event_log::{EventLog, EventWindow};
use crate::poll::{
    EventPagePoll, JobListPoll, PollKind, PollReport, PollScheduler, PollTrigger, PollUpdate,
    SelectedTelemetry,
};
use crate::stream::{StreamConnection, StreamEnvelope, StreamUpdate};
use crate::{Job, JobEvent, JobStatus, StreamState, Subscription};

const STREAM_KEY: &str = "stream";
const JOBS_POLL_KEY: &str = "poll.jobs";
const EVENTS_POLL_KEY: &str = "poll.events";

const COMMAND_QUEUE: usize = 32;
const STREAM_QUEUE: usize = 256;
const POLL_QUEUE: usize = 8;
// stream envelopes applied per wakeup before commands get another turn
const STREAM_BATCH: usize = 128;

pub const DEFAULT_VISIBLE_EVENTS: usize = 20;

/// Coarse connectivity verdict for the status bar.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Health {
    /// No job list response yet.
    #[default]
    Unknown,
    Healthy,
    /// Job list is fine but something about the selected job is failing: its
    /// detail or metrics requests, its stream or its event poll.
    Degraded,
    /// The last job list request failed.
    Unreachable,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Unknown => "unknown",
            Health::Healthy => "healthy",
            Health::Degraded => "degraded",
            Health::Unreachable => "unreachable",
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a renderer needs, published after each batch of changes.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub revision: u64,
    pub jobs: Arc<Vec<Job>>,
    pub selected: Option<String>,
    pub job: Option<Job>,
    pub metrics: Map<String, Value>,
    pub events: Arc<Vec<JobEvent>>,
    pub window: EventWindow,
    pub visible_count: usize,
    pub stream_state: StreamState,
    pub health: Health,
    pub last_error: Option<String>,
}

impl Snapshot {
    pub fn visible_events(&self) -> &[JobEvent] {
        let end = self.window.end.min(self.events.len());
        let start = self.window.start.min(end);
        &self.events[start..end]
    }
}

#[derive(Debug)]
enum Command {
    Select(String),
    Deselect,
    SetViewport {
        selected_index: Option<usize>,
        visible_count: usize,
    },
    Refresh,
    Logout(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorSource {
    JobsPoll,
    // detail or metrics of the selected job
    JobDetail,
    EventsPoll,
    Stream,
}

struct Viewport {
    // None follows the newest event
    selected_index: Option<usize>,
    visible_count: usize,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            selected_index: None,
            visible_count: DEFAULT_VISIBLE_EVENTS,
        }
    }
}

/// Cloneable front end of a running coordinator.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<Snapshot>,
}

impl SyncHandle {
    pub async fn select(&self, job_id: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Select(job_id.into())).await
    }

    pub async fn deselect(&self) -> SyncResult<()> {
        self.send(Command::Deselect).await
    }

    /// Pins the event cursor to `selected_index`.
    pub async fn set_viewport(&self, selected_index: usize, visible_count: usize) -> SyncResult<()> {
        self.send(Command::SetViewport {
            selected_index: Some(selected_index),
            visible_count,
        })
        .await
    }

    /// Keeps the cursor on the newest event as new events arrive.
    pub async fn follow_tail(&self, visible_count: usize) -> SyncResult<()> {
        self.send(Command::SetViewport {
            selected_index: None,
            visible_count,
        })
        .await
    }

    /// Polls both kinds immediately.
    pub async fn refresh(&self) -> SyncResult<()> {
        self.send(Command::Refresh).await
    }

    /// Cancels all work, clears every piece of state and stops the
    /// coordinator. Resolves after the final snapshot is published.
    pub async fn logout(&self) -> SyncResult<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Logout(ack)).await?;
        done.await.map_err(|_| SyncError::ChannelClosed)
    }

    /// Cancels all work and stops the coordinator, keeping the last view.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Shutdown(ack)).await?;
        done.await.map_err(|_| SyncError::ChannelClosed)
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::ChannelClosed)
    }
}

pub struct SyncCoordinator {
    config: SyncConfig,
    backend: Arc<dyn JobsBackend>,
    registry: AbortRegistry,
    log: EventLog,
    events: Option<Arc<Vec<JobEvent>>>,
    jobs: Arc<Vec<Job>>,
    selected: Option<String>,
    selected_job: Option<Job>,
    metrics: Map<String, Value>,
    stream_state: StreamState,
    generation: u64,
    // highest seq whose status hint was applied
    hint_seq: u64,
    jobs_reachable: Option<bool>,
    errors: Vec<(ErrorSource, String)>,
    viewport: Viewport,
    revision: u64,
    dirty: bool,
    selection_tx: watch::Sender<Option<Subscription>>,
    snapshot_tx: watch::Sender<Snapshot>,
    stream_tx: mpsc::Sender<StreamEnvelope>,
    job_trigger: PollTrigger,
    event_trigger: PollTrigger,
}

impl SyncCoordinator {
    /// Builds a [`BackendClient`] from `config` and starts the coordinator.
    pub fn connect(config: SyncConfig) -> SyncResult<SyncHandle> {
        let client = BackendClient::new(&config)?;
        Ok(Self::spawn(config, Arc::new(client)))
    }

    /// Starts the pollers and the coordinator task. Must be called from
    /// within a tokio runtime.
    pub fn spawn(config: SyncConfig, backend: Arc<dyn JobsBackend>) -> SyncHandle {
        let registry = AbortRegistry::new();
        let (selection_tx, selection_rx) = watch::channel(None);
        let (poll_tx, poll_rx) = mpsc::channel(POLL_QUEUE);
        let (stream_tx, stream_rx) = mpsc::channel(STREAM_QUEUE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
            visible_count: DEFAULT_VISIBLE_EVENTS,
            ..Snapshot::default()
        });

        let jobs_poll = PollScheduler::new(
            JobListPoll::new(backend.clone(), selection_rx.clone(), config.job_list_limit),
            config.job_poll,
            config.request_timeout,
            poll_tx.clone(),
        );
        let event_poll = PollScheduler::new(
            EventPagePoll::new(backend.clone(), selection_rx, config.event_page_limit),
            config.event_poll,
            config.request_timeout,
            poll_tx,
        );
        let job_trigger = jobs_poll.trigger();
        let event_trigger = event_poll.trigger();
        registry.spawn(JOBS_POLL_KEY, move |signal| jobs_poll.run(signal));
        registry.spawn(EVENTS_POLL_KEY, move |signal| event_poll.run(signal));

        let coordinator = SyncCoordinator {
            log: EventLog::new(config.event_capacity),
            config,
            backend,
            registry,
            events: None,
            jobs: Arc::new(Vec::new()),
            selected: None,
            selected_job: None,
            metrics: Map::new(),
            stream_state: StreamState::Idle,
            generation: 0,
            hint_seq: 0,
            jobs_reachable: None,
            errors: Vec::new(),
            viewport: Viewport::default(),
            revision: 0,
            dirty: true,
            selection_tx,
            snapshot_tx,
            stream_tx,
            job_trigger,
            event_trigger,
        };
        tokio::spawn(coordinator.run(command_rx, stream_rx, poll_rx));

        SyncHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut stream_rx: mpsc::Receiver<StreamEnvelope>,
        mut poll_rx: mpsc::Receiver<PollReport>,
    ) {
        if let Some(job_id) = self.config.initial_job_id.clone() {
            self.select(job_id);
        }
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!(target = "job_sync::coordinator", "all handles dropped");
                        self.stop();
                        break;
                    };
                    if self.handle(command).is_break() {
                        break;
                    }
                }
                Some(envelope) = stream_rx.recv() => {
                    self.apply_stream(envelope);
                    for _ in 1..STREAM_BATCH {
                        match stream_rx.try_recv() {
                            Ok(envelope) => self.apply_stream(envelope),
                            Err(_) => break,
                        }
                    }
                }
                Some(report) = poll_rx.recv() => self.apply_poll(report),
            }
            self.publish();
        }
        debug!(target = "job_sync::coordinator", "coordinator stopped");
    }

    fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Select(job_id) => {
                let job_id = job_id.trim().to_string();
                if job_id.is_empty() {
                    warn!(target = "job_sync::coordinator", "ignoring empty job id");
                } else {
                    self.select(job_id);
                }
            }
            Command::Deselect => self.deselect(),
            Command::SetViewport {
                selected_index,
                visible_count,
            } => {
                self.viewport = Viewport {
                    selected_index,
                    visible_count,
                };
                self.dirty = true;
            }
            Command::Refresh => {
                self.job_trigger.poke();
                self.event_trigger.poke();
            }
            Command::Logout(ack) => {
                info!(target = "job_sync::coordinator", "logging out");
                self.registry.abort_all();
                self.generation += 1;
                self.clear_selection();
                self.jobs = Arc::new(Vec::new());
                self.jobs_reachable = None;
                self.errors.clear();
                self.viewport = Viewport::default();
                self.dirty = true;
                self.publish();
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
            Command::Shutdown(ack) => {
                self.stop();
                let _ = ack.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn select(&mut self, job_id: String) {
        let since_seq = if self.selected.as_deref() == Some(job_id.as_str()) {
            self.log.max_seq()
        } else {
            self.log.reset();
            self.events = None;
            self.metrics = Map::new();
            self.hint_seq = 0;
            self.viewport.selected_index = None;
            self.selected_job = self.jobs.iter().find(|job| job.job_id == job_id).cloned();
            self.clear_error(ErrorSource::JobDetail);
            self.clear_error(ErrorSource::Stream);
            self.clear_error(ErrorSource::EventsPoll);
            0
        };
        info!(
            target = "job_sync::coordinator",
            job_id = %job_id,
            since_seq,
            "selecting job"
        );
        self.selected = Some(job_id.clone());
        self.selection_tx
            .send_replace(Some(Subscription::new(job_id.clone(), since_seq)));

        self.generation += 1;
        let connection = StreamConnection::new(
            self.backend.clone(),
            Subscription::new(job_id, since_seq),
            self.selection_tx.subscribe(),
            self.generation,
            self.config.reconnect,
            self.stream_tx.clone(),
        );
        self.registry
            .spawn(STREAM_KEY, move |signal| connection.run(signal));
        self.stream_state = StreamState::Connecting;

        self.job_trigger.poke();
        self.event_trigger.poke();
        self.dirty = true;
    }

    fn deselect(&mut self) {
        if self.selected.is_none() {
            return;
        }
        info!(target = "job_sync::coordinator", "clearing selection");
        self.registry.abort(STREAM_KEY);
        self.generation += 1;
        self.clear_selection();
        self.dirty = true;
    }

    fn clear_selection(&mut self) {
        self.log.reset();
        self.events = None;
        self.selected = None;
        self.selected_job = None;
        self.metrics = Map::new();
        self.hint_seq = 0;
        self.stream_state = StreamState::Idle;
        self.clear_error(ErrorSource::JobDetail);
        self.clear_error(ErrorSource::Stream);
        self.clear_error(ErrorSource::EventsPoll);
        self.selection_tx.send_replace(None);
    }

    fn stop(&mut self) {
        info!(target = "job_sync::coordinator", "shutting down");
        self.registry.abort_all();
        self.generation += 1;
        if self.selected.is_some() {
            self.stream_state = StreamState::Closed;
        }
        self.dirty = true;
        self.publish();
    }

    fn apply_stream(&mut self, envelope: StreamEnvelope) {
        if envelope.generation != self.generation {
            trace!(
                target = "job_sync::coordinator",
                job_id = %envelope.job_id,
                generation = envelope.generation,
                "dropping stale stream update"
            );
            return;
        }
        match envelope.update {
            StreamUpdate::State(state) => {
                if state == StreamState::Open {
                    self.clear_error(ErrorSource::Stream);
                }
                self.stream_state = state;
                self.dirty = true;
            }
            StreamUpdate::Delivered(event) => self.absorb(vec![event]),
            StreamUpdate::Failed(reason) => self.record_error(ErrorSource::Stream, reason),
            StreamUpdate::Reconnecting { attempt, delay } => {
                let status = self.selected_status();
                if status.is_terminal() {
                    info!(
                        target = "job_sync::coordinator",
                        job_id = %envelope.job_id,
                        status = %status,
                        "job finished; not re-arming stream"
                    );
                    self.registry.abort(STREAM_KEY);
                    self.generation += 1;
                    self.stream_state = StreamState::Closed;
                    self.clear_error(ErrorSource::Stream);
                } else {
                    debug!(
                        target = "job_sync::coordinator",
                        job_id = %envelope.job_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "stream reconnect scheduled"
                    );
                }
                self.dirty = true;
            }
        }
    }

    fn apply_poll(&mut self, report: PollReport) {
        let PollReport { kind, outcome } = report;
        match outcome {
            Ok(None) => {
                if kind == PollKind::Events {
                    self.clear_error(ErrorSource::EventsPoll);
                }
            }
            Ok(Some(PollUpdate::Jobs { jobs, selected })) => {
                self.jobs_reachable = Some(true);
                self.clear_error(ErrorSource::JobsPoll);
                self.apply_jobs(jobs, selected);
            }
            Ok(Some(PollUpdate::Events { job_id, events })) => {
                self.clear_error(ErrorSource::EventsPoll);
                if self.selected.as_deref() == Some(job_id.as_str()) {
                    self.absorb(events);
                } else {
                    trace!(
                        target = "job_sync::coordinator",
                        job_id = %job_id,
                        "dropping events for unselected job"
                    );
                }
            }
            Err(err) => {
                debug!(
                    target = "job_sync::coordinator",
                    kind = kind.as_str(),
                    error = %err,
                    "poll failure reported"
                );
                let source = match kind {
                    PollKind::Jobs => {
                        self.jobs_reachable = Some(false);
                        ErrorSource::JobsPoll
                    }
                    PollKind::Events => ErrorSource::EventsPoll,
                };
                self.record_error(source, err.to_string());
            }
        }
        self.dirty = true;
    }

    fn apply_jobs(&mut self, jobs: Vec<Job>, telemetry: Option<SelectedTelemetry>) {
        if let Some(selected) = self.selected.as_deref() {
            let listed = jobs.iter().find(|job| job.job_id == selected).cloned();
            match telemetry {
                Some(telemetry) if telemetry.job_id == selected => {
                    if let Some(job) = telemetry.job.or(listed) {
                        self.selected_job = Some(job);
                    }
                    if let Some(metrics) = telemetry.metrics {
                        self.metrics = metrics;
                    }
                    if telemetry.failures.is_empty() {
                        self.clear_error(ErrorSource::JobDetail);
                    } else {
                        self.record_error(
                            ErrorSource::JobDetail,
                            telemetry.failures.join("; "),
                        );
                    }
                }
                _ => {
                    if self.selected_job.is_none() {
                        self.selected_job = listed;
                    }
                }
            }
        }
        self.jobs = Arc::new(jobs);
    }

    /// Merges events for the selected job into the log.
    fn absorb(&mut self, events: Vec<JobEvent>) {
        let mut inserted = 0;
        for event in events {
            if event.seq > self.hint_seq {
                if let Some(status) = event.status_hint() {
                    self.hint_seq = event.seq;
                    self.apply_status_hint(status, event.seq);
                }
            }
            if self.log.ingest(event) {
                inserted += 1;
            }
        }
        if inserted == 0 {
            return;
        }
        self.events = None;
        self.dirty = true;
        let max_seq = self.log.max_seq();
        self.selection_tx.send_if_modified(|selection| match selection {
            Some(subscription) if subscription.since_seq < max_seq => {
                subscription.since_seq = max_seq;
                true
            }
            _ => false,
        });
    }

    fn apply_status_hint(&mut self, status: JobStatus, seq: u64) {
        let Some(selected) = self.selected.clone() else {
            return;
        };
        if self.selected_job.is_none() {
            // not described by the backend yet; the next job poll replaces it
            let known = self.jobs.iter().find(|job| job.job_id == selected).cloned();
            self.selected_job =
                Some(known.unwrap_or_else(|| Job::new(selected, JobStatus::Unknown)));
        }
        if let Some(job) = self.selected_job.as_mut() {
            if job.status != status {
                debug!(
                    target = "job_sync::coordinator",
                    job_id = %job.job_id,
                    seq,
                    status = %status,
                    "status from event"
                );
                job.status = status;
                self.dirty = true;
            }
        }
    }

    fn selected_status(&self) -> JobStatus {
        match (&self.selected_job, self.selected.as_deref()) {
            (Some(job), _) => job.status,
            (None, Some(selected)) => self
                .jobs
                .iter()
                .find(|job| job.job_id == selected)
                .map(|job| job.status)
                .unwrap_or_default(),
            (None, None) => JobStatus::Unknown,
        }
    }

    fn record_error(&mut self, source: ErrorSource, message: String) {
        self.errors.retain(|(existing, _)| *existing != source);
        self.errors.push((source, message));
        self.dirty = true;
    }

    fn clear_error(&mut self, source: ErrorSource) {
        let before = self.errors.len();
        self.errors.retain(|(existing, _)| *existing != source);
        if self.errors.len() != before {
            self.dirty = true;
        }
    }

    fn health(&self) -> Health {
        match self.jobs_reachable {
            None => Health::Unknown,
            Some(false) => Health::Unreachable,
            Some(true) => {
                let stream_failing = self.selected.is_some()
                    && (self.stream_state == StreamState::Reconnecting
                        || self.errors.iter().any(|(s, _)| *s == ErrorSource::Stream));
                let selected_failing = self.errors.iter().any(|(s, _)| {
                    matches!(s, ErrorSource::EventsPoll | ErrorSource::JobDetail)
                });
                if stream_failing || selected_failing {
                    Health::Degraded
                } else {
                    Health::Healthy
                }
            }
        }
    }

    fn publish(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        self.revision += 1;

        let visible_count = self.viewport.visible_count;
        let cursor = self
            .viewport
            .selected_index
            .unwrap_or_else(|| self.log.len().saturating_sub(1));
        let window = self.log.window(cursor, visible_count);
        let log = &self.log;
        let events = self
            .events
            .get_or_insert_with(|| Arc::new(log.events().to_vec()))
            .clone();

        let snapshot = Snapshot {
            revision: self.revision,
            jobs: self.jobs.clone(),
            selected: self.selected.clone(),
            job: self.selected_job.clone(),
            metrics: self.metrics.clone(),
            events,
            window,
            visible_count,
            stream_state: self.stream_state,
            health: self.health(),
            last_error: self.errors.last().map(|(_, message)| message.clone()),
        };
        self.snapshot_tx.send_replace(snapshot);
    }
}

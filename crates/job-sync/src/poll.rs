//! Periodic pull of job and event state.
//!
//! Each [`PollScheduler`] drives one [`PollJob`] on its own cadence. At most
//! one request per scheduler is in flight; ticks that fire while a request is
//! outstanding are skipped. Failures stretch the interval (capped doubling),
//! the first success after a failure snaps it back to the base.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::abort::AbortSignal;
use crate::backoff::Backoff;
use crate::client::JobsBackend;
use crate::config::PollSettings;
use crate::error::{SyncError, SyncResult};
use crate::{Job, JobEvent, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    Jobs,
    Events,
}

impl PollKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PollKind::Jobs => "jobs",
            PollKind::Events => "events",
        }
    }
}

/// Detail and metrics fetched alongside the job list for the selected job.
/// Either half may be missing when its request failed; `failures` says why.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedTelemetry {
    pub job_id: String,
    pub job: Option<Job>,
    pub metrics: Option<Map<String, Value>>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollUpdate {
    Jobs {
        jobs: Vec<Job>,
        selected: Option<SelectedTelemetry>,
    },
    Events {
        job_id: String,
        events: Vec<JobEvent>,
    },
}

#[derive(Debug)]
pub struct PollReport {
    pub kind: PollKind,
    /// `Ok(None)` means the poll had nothing to ask for.
    pub outcome: SyncResult<Option<PollUpdate>>,
}

#[async_trait]
pub trait PollJob: Send + Sync {
    fn kind(&self) -> PollKind;

    async fn fetch(&self) -> SyncResult<Option<PollUpdate>>;
}

/// Job list, plus detail and metrics of the selected job.
pub struct JobListPoll {
    backend: Arc<dyn JobsBackend>,
    selection: watch::Receiver<Option<Subscription>>,
    limit: usize,
}

impl JobListPoll {
    pub fn new(
        backend: Arc<dyn JobsBackend>,
        selection: watch::Receiver<Option<Subscription>>,
        limit: usize,
    ) -> Self {
        Self {
            backend,
            selection,
            limit,
        }
    }
}

#[async_trait]
impl PollJob for JobListPoll {
    fn kind(&self) -> PollKind {
        PollKind::Jobs
    }

    async fn fetch(&self) -> SyncResult<Option<PollUpdate>> {
        let selected = self
            .selection
            .borrow()
            .as_ref()
            .map(|sub| sub.job_id.clone());
        let jobs = self.backend.list_jobs(self.limit).await?;
        let selected = match selected {
            None => None,
            Some(job_id) => {
                let (job, metrics) = futures::join!(
                    self.backend.job(&job_id),
                    self.backend.job_metrics(&job_id)
                );
                let mut failures = Vec::new();
                let job = job
                    .map_err(|err| {
                        warn!(target = "job_sync::poll", job_id = %job_id, error = %err, "job detail fetch failed");
                        failures.push(format!("job detail: {err}"));
                    })
                    .ok();
                let metrics = metrics
                    .map_err(|err| {
                        warn!(target = "job_sync::poll", job_id = %job_id, error = %err, "job metrics fetch failed");
                        failures.push(format!("job metrics: {err}"));
                    })
                    .ok();
                Some(SelectedTelemetry {
                    job_id,
                    job,
                    metrics,
                    failures,
                })
            }
        };
        Ok(Some(PollUpdate::Jobs { jobs, selected }))
    }
}

/// Next page of events for the selected job. Does nothing without a selection.
pub struct EventPagePoll {
    backend: Arc<dyn JobsBackend>,
    selection: watch::Receiver<Option<Subscription>>,
    limit: usize,
}

impl EventPagePoll {
    pub fn new(
        backend: Arc<dyn JobsBackend>,
        selection: watch::Receiver<Option<Subscription>>,
        limit: usize,
    ) -> Self {
        Self {
            backend,
            selection,
            limit,
        }
    }
}

#[async_trait]
impl PollJob for EventPagePoll {
    fn kind(&self) -> PollKind {
        PollKind::Events
    }

    async fn fetch(&self) -> SyncResult<Option<PollUpdate>> {
        let subscription = self.selection.borrow().clone();
        let Some(subscription) = subscription else {
            return Ok(None);
        };
        let events = self.backend.events(&subscription, self.limit).await?;
        Ok(Some(PollUpdate::Events {
            job_id: subscription.job_id,
            events,
        }))
    }
}

/// Requests an immediate poll from outside the schedule.
#[derive(Clone)]
pub struct PollTrigger {
    notify: Arc<Notify>,
}

impl PollTrigger {
    /// Polls now, or right after the outstanding request if one is in flight.
    pub fn poke(&self) {
        self.notify.notify_one();
    }
}

type Pending = BoxFuture<'static, SyncResult<Option<PollUpdate>>>;

pub struct PollScheduler<J> {
    job: Arc<J>,
    backoff: Backoff,
    request_timeout: Duration,
    reports: mpsc::Sender<PollReport>,
    notify: Arc<Notify>,
}

impl<J> PollScheduler<J>
where
    J: PollJob + 'static,
{
    pub fn new(
        job: J,
        settings: PollSettings,
        request_timeout: Duration,
        reports: mpsc::Sender<PollReport>,
    ) -> Self {
        Self {
            job: Arc::new(job),
            backoff: Backoff::from(settings),
            request_timeout,
            reports,
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn trigger(&self) -> PollTrigger {
        PollTrigger {
            notify: self.notify.clone(),
        }
    }

    /// Polls immediately, then on schedule until `signal` fires or the
    /// report receiver is dropped.
    pub async fn run(mut self, signal: AbortSignal) {
        let kind = self.job.kind();
        let mut pending: Option<Pending> = None;
        let mut started_at = Instant::now();
        let mut next_tick = started_at;
        let mut rerun = false;

        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => {
                    debug!(target = "job_sync::poll", kind = kind.as_str(), "poller cancelled");
                    break;
                }
                outcome = async {
                    match pending.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                }, if pending.is_some() => {
                    pending = None;
                    match &outcome {
                        Ok(_) => self.backoff.reset(),
                        Err(err) => {
                            self.backoff.next_delay();
                            warn!(
                                target = "job_sync::poll",
                                kind = kind.as_str(),
                                error = %err,
                                failures = self.backoff.attempt(),
                                next_in_ms = self.backoff.current().as_millis() as u64,
                                "poll failed"
                            );
                        }
                    }
                    let now = Instant::now();
                    let interval = self.backoff.current();
                    next_tick = started_at + interval;
                    while next_tick <= now {
                        next_tick += interval;
                    }
                    if std::mem::take(&mut rerun) {
                        next_tick = now;
                    }
                    if self.reports.send(PollReport { kind, outcome }).await.is_err() {
                        debug!(target = "job_sync::poll", kind = kind.as_str(), "report receiver dropped");
                        break;
                    }
                }
                _ = sleep_until(next_tick) => {
                    if pending.is_some() {
                        trace!(target = "job_sync::poll", kind = kind.as_str(), "request in flight; skipping tick");
                        next_tick += self.backoff.current();
                    } else {
                        started_at = Instant::now();
                        pending = Some(self.start());
                        // parked until the outcome reschedules
                        next_tick = started_at + self.backoff.max();
                    }
                }
                _ = self.notify.notified() => {
                    if pending.is_some() {
                        rerun = true;
                    } else {
                        trace!(target = "job_sync::poll", kind = kind.as_str(), "poked");
                        started_at = Instant::now();
                        pending = Some(self.start());
                        next_tick = started_at + self.backoff.max();
                    }
                }
            }
        }
    }

    fn start(&self) -> Pending {
        let job = self.job.clone();
        let limit = self.request_timeout;
        Box::pin(async move {
            match tokio::time::timeout(limit, job.fetch()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SyncError::Timeout(limit)),
            }
        })
    }
}

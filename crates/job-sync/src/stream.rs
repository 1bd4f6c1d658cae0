//! Push subscription for a single job.
//!
//! A [`StreamConnection`] owns its reconnect schedule and reports everything
//! it does as [`StreamEnvelope`]s on an mpsc channel. It runs until its
//! [`AbortSignal`] fires or the receiving side goes away; transport failures
//! only ever lead to another attempt.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::abort::AbortSignal;
use crate::backoff::ReconnectPolicy;
use crate::client::{ByteStream, JobsBackend};
use crate::config::ReconnectSettings;
use crate::error::SyncError;
use crate::sse::{self, Frame};
use crate::{JobEvent, StreamState, Subscription};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    State(StreamState),
    Delivered(JobEvent),
    Failed(String),
    Reconnecting { attempt: u32, delay: Duration },
}

/// Update tagged with the connection that produced it. The generation lets
/// the consumer drop anything a superseded connection queued before it died.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEnvelope {
    pub job_id: String,
    pub generation: u64,
    pub update: StreamUpdate,
}

enum Stop {
    Cancelled,
    Detached,
}

pub struct StreamConnection {
    backend: Arc<dyn JobsBackend>,
    subscription: Subscription,
    // resume point published by whoever owns the event log
    logged: watch::Receiver<Option<Subscription>>,
    generation: u64,
    policy: ReconnectPolicy,
    updates: mpsc::Sender<StreamEnvelope>,
}

impl StreamConnection {
    pub fn new(
        backend: Arc<dyn JobsBackend>,
        subscription: Subscription,
        logged: watch::Receiver<Option<Subscription>>,
        generation: u64,
        reconnect: ReconnectSettings,
        updates: mpsc::Sender<StreamEnvelope>,
    ) -> Self {
        Self {
            backend,
            subscription,
            logged,
            generation,
            policy: ReconnectPolicy::new(reconnect),
            updates,
        }
    }

    pub async fn run(mut self, signal: AbortSignal) {
        match self.drive(&signal).await {
            Stop::Cancelled => {
                debug!(
                    target = "job_sync::stream",
                    job_id = %self.subscription.job_id,
                    generation = self.generation,
                    "stream cancelled"
                );
                // the consumer already moved on; a full queue is not worth waiting for
                let _ = self
                    .updates
                    .try_send(self.envelope(StreamUpdate::State(StreamState::Closed)));
            }
            Stop::Detached => {
                debug!(
                    target = "job_sync::stream",
                    job_id = %self.subscription.job_id,
                    "stream consumer dropped"
                );
            }
        }
    }

    async fn drive(&mut self, signal: &AbortSignal) -> Stop {
        loop {
            self.catch_up();
            if let Err(stop) = self.transition(StreamState::Connecting).await {
                return stop;
            }
            let opened = tokio::select! {
                biased;
                _ = signal.cancelled() => return Stop::Cancelled,
                opened = self.backend.open_event_stream(&self.subscription) => opened,
            };
            let failure = match opened {
                Ok(body) => {
                    info!(
                        target = "job_sync::stream",
                        job_id = %self.subscription.job_id,
                        since_seq = self.subscription.since_seq,
                        "event stream open"
                    );
                    if let Err(stop) = self.transition(StreamState::Open).await {
                        return stop;
                    }
                    let opened_at = Instant::now();
                    let failure = match self.pump(body, signal).await {
                        Ok(failure) => failure,
                        Err(stop) => return stop,
                    };
                    self.policy.connection_closed(opened_at.elapsed());
                    failure
                }
                Err(err) => err,
            };

            let attempt = self.policy.attempt() + 1;
            let delay = self.policy.next_delay();
            warn!(
                target = "job_sync::stream",
                job_id = %self.subscription.job_id,
                error = %failure,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "event stream interrupted; scheduling reconnect"
            );
            if let Err(stop) = self.transition(StreamState::Reconnecting).await {
                return stop;
            }
            if let Err(stop) = self.emit(StreamUpdate::Failed(failure.to_string())).await {
                return stop;
            }
            if let Err(stop) = self
                .emit(StreamUpdate::Reconnecting { attempt, delay })
                .await
            {
                return stop;
            }
            tokio::select! {
                biased;
                _ = signal.cancelled() => return Stop::Cancelled,
                _ = sleep(delay) => {}
            }
        }
    }

    /// Reads the body until it fails or ends and returns why it stopped.
    async fn pump(&mut self, body: ByteStream, signal: &AbortSignal) -> Result<SyncError, Stop> {
        let mut frames = sse::frames(body);
        loop {
            let next = tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(Stop::Cancelled),
                next = frames.next() => next,
            };
            let frame = match next {
                None => return Ok(SyncError::StreamEnded),
                Some(Err(err)) => return Ok(err),
                Some(Ok(frame)) => frame,
            };
            if let Some(event) = self.decode(frame) {
                self.subscription.since_seq = self.subscription.since_seq.max(event.seq);
                self.emit(StreamUpdate::Delivered(event)).await?;
            }
        }
    }

    /// Moves the resume point past events the log already holds, whichever
    /// channel delivered them.
    fn catch_up(&mut self) {
        let logged = match &*self.logged.borrow() {
            Some(logged) if logged.job_id == self.subscription.job_id => logged.since_seq,
            _ => return,
        };
        self.subscription.since_seq = self.subscription.since_seq.max(logged);
    }

    fn decode(&self, frame: Frame) -> Option<JobEvent> {
        let mut event: JobEvent = match serde_json::from_str(&frame.data) {
            Ok(event) => event,
            Err(err) => {
                debug!(
                    target = "job_sync::stream",
                    job_id = %self.subscription.job_id,
                    event = %frame.event,
                    error = %err,
                    "dropping undecodable frame"
                );
                return None;
            }
        };
        if event.job_id.is_empty() {
            event.job_id = self.subscription.job_id.clone();
        } else if event.job_id != self.subscription.job_id {
            debug!(
                target = "job_sync::stream",
                job_id = %self.subscription.job_id,
                foreign = %event.job_id,
                seq = event.seq,
                "dropping event for another job"
            );
            return None;
        }
        Some(event)
    }

    async fn transition(&self, state: StreamState) -> Result<(), Stop> {
        self.emit(StreamUpdate::State(state)).await
    }

    async fn emit(&self, update: StreamUpdate) -> Result<(), Stop> {
        self.updates
            .send(self.envelope(update))
            .await
            .map_err(|_| Stop::Detached)
    }

    fn envelope(&self, update: StreamUpdate) -> StreamEnvelope {
        StreamEnvelope {
            job_id: self.subscription.job_id.clone(),
            generation: self.generation,
            update,
        }
    }
}

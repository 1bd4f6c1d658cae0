//! In-memory backend used by the unit tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::client::{ByteStream, JobsBackend};
use crate::error::{SyncError, SyncResult};
use crate::{Job, JobEvent, JobStatus, Subscription};

pub(crate) enum StreamScript {
    /// Serve the chunks, then end the body.
    Body(Vec<&'static str>),
    /// Serve the chunks, then keep the body open.
    Hold(Vec<&'static str>),
    /// Reject the connection with this status.
    Reject(u16),
}

#[derive(Default)]
pub(crate) struct FakeBackend {
    pub jobs: Mutex<Vec<Job>>,
    pub fail_jobs: Mutex<Option<String>>,
    /// Detail records; jobs without one fall back to their list entry.
    pub details: Mutex<HashMap<String, Job>>,
    pub metrics: Mutex<HashMap<String, Map<String, Value>>>,
    pub events: Mutex<HashMap<String, Vec<JobEvent>>>,
    pub streams: Mutex<VecDeque<StreamScript>>,
    pub opened: Mutex<Vec<Subscription>>,
    pub event_requests: Mutex<Vec<Subscription>>,
}

impl FakeBackend {
    pub fn script(&self, script: StreamScript) {
        self.streams.lock().push_back(script);
    }

    pub fn opened(&self) -> Vec<Subscription> {
        self.opened.lock().clone()
    }
}

#[async_trait]
impl JobsBackend for FakeBackend {
    async fn list_jobs(&self, limit: usize) -> SyncResult<Vec<Job>> {
        if let Some(reason) = self.fail_jobs.lock().clone() {
            return Err(SyncError::Decode(reason));
        }
        Ok(self.jobs.lock().iter().take(limit).cloned().collect())
    }

    async fn job(&self, job_id: &str) -> SyncResult<Job> {
        let detail = self.details.lock().get(job_id).cloned();
        detail
            .or_else(|| self.jobs.lock().iter().find(|job| job.job_id == job_id).cloned())
            .ok_or_else(|| SyncError::Decode(format!("no job {job_id}")))
    }

    async fn job_metrics(&self, job_id: &str) -> SyncResult<Map<String, Value>> {
        Ok(self.metrics.lock().get(job_id).cloned().unwrap_or_default())
    }

    async fn events(
        &self,
        subscription: &Subscription,
        limit: usize,
    ) -> SyncResult<Vec<JobEvent>> {
        self.event_requests.lock().push(subscription.clone());
        Ok(self
            .events
            .lock()
            .get(&subscription.job_id)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.seq > subscription.since_seq)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn open_event_stream(&self, subscription: &Subscription) -> SyncResult<ByteStream> {
        self.opened.lock().push(subscription.clone());
        let script = self.streams.lock().pop_front();
        match script {
            None => Ok(stream::pending::<SyncResult<Bytes>>().boxed()),
            Some(StreamScript::Body(chunks)) => Ok(chunk_stream(chunks).boxed()),
            Some(StreamScript::Hold(chunks)) => {
                Ok(chunk_stream(chunks).chain(stream::pending()).boxed())
            }
            Some(StreamScript::Reject(code)) => Err(SyncError::UnexpectedStatus {
                status: reqwest::StatusCode::from_u16(code)
                    .unwrap_or(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
                body: String::new(),
            }),
        }
    }
}

fn chunk_stream(chunks: Vec<&'static str>) -> impl futures::Stream<Item = SyncResult<Bytes>> {
    stream::iter(
        chunks
            .into_iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes()))),
    )
}

pub(crate) fn job(job_id: &str, status: JobStatus) -> Job {
    Job {
        job_type: Some("prompt_learning".into()),
        ..Job::new(job_id, status)
    }
}

pub(crate) fn event(job_id: &str, seq: u64, message: &str) -> JobEvent {
    JobEvent {
        job_id: job_id.into(),
        seq,
        timestamp: None,
        event_type: "prompt.learning.progress".into(),
        level: Some("info".into()),
        message: message.into(),
        run_id: None,
        data: Map::new(),
    }
}

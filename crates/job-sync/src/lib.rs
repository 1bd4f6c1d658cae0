//! Job Sync: keeps a local view of remote training/evaluation jobs in step with the backend.
//!
//! Responsibilities:
//! - holding one push subscription (`text/event-stream`) for the selected job
//! - polling the job list, job status/metrics and event pages on an adaptive cadence
//! - merging both channels into an ordered, deduplicated event log
//! - cancelling superseded work when the operator switches jobs
//! - publishing snapshots for whatever renders the dashboard

pub mod abort;
pub mod backoff;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_log;
pub mod poll;
pub mod sse;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use abort::{AbortRegistry, AbortSignal};
pub use backoff::{Backoff, ReconnectPolicy};
pub use client::{BackendClient, ByteStream, JobsBackend};
pub use config::{PollSettings, ReconnectSettings, SyncConfig};
pub use coordinator::{Health, Snapshot, SyncCoordinator, SyncHandle};
pub use error::{SyncError, SyncResult};
pub use event_log::{EventLog, EventWindow};
pub use poll::{
    EventPagePoll, JobListPoll, PollJob, PollKind, PollReport, PollScheduler, PollTrigger,
    PollUpdate, SelectedTelemetry,
};
pub use stream::{StreamConnection, StreamEnvelope, StreamUpdate};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Lifecycle state reported by the backend for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
    #[default]
    Unknown,
}

impl JobStatus {
    /// Maps the backend's status vocabulary, which is not fully consistent
    /// across job types, onto the closed set the dashboard understands.
    pub fn from_wire(value: &str) -> JobStatus {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" | "pending" | "created" | "submitted" => JobStatus::Queued,
            "running" | "in_progress" | "started" => JobStatus::Running,
            "completed" | "succeeded" | "success" => JobStatus::Completed,
            "failed" | "error" => JobStatus::Failed,
            "canceled" | "cancelled" => JobStatus::Canceled,
            _ => JobStatus::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
            JobStatus::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobStatus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw
            .as_deref()
            .map(JobStatus::from_wire)
            .unwrap_or_default())
    }
}

/// Job metadata. The backend is authoritative: entries are replaced wholesale
/// on every poll response, never merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(alias = "id")]
    pub job_id: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default, deserialize_with = "lenient_string")]
    pub job_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub created_at: Option<String>,
    #[serde(default, alias = "best_score")]
    pub best_reward: Option<f64>,
}

impl Job {
    /// Record holding only what is known locally, until the backend describes the job.
    pub fn new(job_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            job_type: None,
            created_at: None,
            best_reward: None,
        }
    }
}

/// One entry of a job's event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(default, deserialize_with = "null_as_default")]
    pub job_id: String,
    pub seq: u64,
    #[serde(
        default,
        rename = "ts",
        alias = "timestamp",
        deserialize_with = "lenient_string"
    )]
    pub timestamp: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "null_as_default")]
    pub event_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub level: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, deserialize_with = "open_map")]
    pub data: Map<String, Value>,
}

impl JobEvent {
    /// Status implied by a `<namespace>.job.<phase>` event, if any.
    pub fn status_hint(&self) -> Option<JobStatus> {
        let kind = self.event_type.to_ascii_lowercase();
        let mut segments = kind.rsplit('.');
        let phase = segments.next()?;
        if segments.next() != Some("job") {
            return None;
        }
        match phase {
            "started" | "running" => Some(JobStatus::Running),
            "completed" | "succeeded" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" | "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

/// Parameters of a stream or event-poll request: resume `job_id` after `since_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub job_id: String,
    pub since_seq: u64,
}

impl Subscription {
    pub fn new(job_id: impl Into<String>, since_seq: u64) -> Self {
        Self {
            job_id: job_id.into(),
            since_seq,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    #[default]
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StreamState::Idle => "idle",
            StreamState::Connecting => "connecting",
            StreamState::Open => "open",
            StreamState::Reconnecting => "reconnecting",
            StreamState::Closed => "closed",
        };
        f.write_str(label)
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// Timestamps and labels arrive as strings from some job types and as numbers
// from others.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

fn open_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Object(map) => map,
        _ => Map::new(),
    })
}

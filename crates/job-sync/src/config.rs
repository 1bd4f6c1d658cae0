use std::time::Duration;

use url::Url;

use crate::error::SyncResult;

pub const DEFAULT_API_PREFIX: &str = "/api/prompt-learning/online";

/// Cadence of one poll kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub base: Duration,
    pub max: Duration,
}

impl PollSettings {
    pub fn jobs() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(60),
        }
    }

    pub fn events() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectSettings {
    pub base: Duration,
    pub max: Duration,
    pub grace: Duration,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            grace: Duration::from_secs(2),
        }
    }
}

/// Everything the engine needs from the outside world. Supplied by the
/// embedding application; the engine never reads the environment itself.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub backend_url: Url,
    pub api_key: String,
    pub api_prefix: String,
    pub initial_job_id: Option<String>,
    pub job_poll: PollSettings,
    pub event_poll: PollSettings,
    pub reconnect: ReconnectSettings,
    pub request_timeout: Duration,
    pub job_list_limit: usize,
    pub event_page_limit: usize,
    pub event_capacity: usize,
}

impl SyncConfig {
    pub fn new(backend_url: &str, api_key: impl Into<String>) -> SyncResult<Self> {
        Ok(Self {
            backend_url: Url::parse(backend_url.trim())?,
            api_key: api_key.into(),
            api_prefix: DEFAULT_API_PREFIX.to_string(),
            initial_job_id: None,
            job_poll: PollSettings::jobs(),
            event_poll: PollSettings::events(),
            reconnect: ReconnectSettings::default(),
            request_timeout: Duration::from_secs(10),
            job_list_limit: 50,
            event_page_limit: 200,
            event_capacity: 5_000,
        })
    }

    pub fn with_initial_job(mut self, job_id: Option<String>) -> Self {
        self.initial_job_id = job_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        self
    }
}

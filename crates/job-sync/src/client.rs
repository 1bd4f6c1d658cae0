//! HTTP access to the jobs backend.
//!
//! [`JobsBackend`] is the seam the stream and poll components talk to;
//! [`BackendClient`] implements it over reqwest with bearer auth.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::{ParseError, Url};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::{Job, JobEvent, Subscription};

pub type ByteStream = BoxStream<'static, SyncResult<Bytes>>;

#[async_trait]
pub trait JobsBackend: Send + Sync {
    async fn list_jobs(&self, limit: usize) -> SyncResult<Vec<Job>>;

    async fn job(&self, job_id: &str) -> SyncResult<Job>;

    async fn job_metrics(&self, job_id: &str) -> SyncResult<Map<String, Value>>;

    /// Page of events strictly after `subscription.since_seq`.
    async fn events(&self, subscription: &Subscription, limit: usize)
        -> SyncResult<Vec<JobEvent>>;

    /// Opens the push stream. Resolves once response headers arrived with a
    /// success status; the body is handed back unparsed.
    async fn open_event_stream(&self, subscription: &Subscription) -> SyncResult<ByteStream>;
}

#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
    api_prefix: String,
    token: String,
    request_timeout: Duration,
}

impl BackendClient {
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let http = Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.backend_url.clone(),
            api_prefix: config.api_prefix.clone(),
            token: config.api_key.clone(),
            request_timeout: config.request_timeout,
        })
    }

    /// Builds `{base}{prefix}/{segments...}`, percent-encoding each segment.
    pub fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                SyncError::InvalidUrl(ParseError::RelativeUrlWithCannotBeABaseBase)
            })?;
            path.pop_if_empty();
            path.extend(self.api_prefix.split('/').filter(|part| !part.is_empty()));
            path.extend(segments);
        }
        Ok(url)
    }

    fn get(&self, url: Url) -> RequestBuilder {
        self.http.get(url).bearer_auth(&self.token)
    }

    async fn fetch_json(&self, request: RequestBuilder) -> SyncResult<Value> {
        let res = request.timeout(self.request_timeout).send().await?;
        let res = ensure_success(res).await?;
        Ok(res.json::<Value>().await?)
    }
}

#[async_trait]
impl JobsBackend for BackendClient {
    async fn list_jobs(&self, limit: usize) -> SyncResult<Vec<Job>> {
        let url = self.endpoint(&["jobs"])?;
        let body = self
            .fetch_json(self.get(url).query(&[("limit", limit)]))
            .await?;
        decode_list(body, &["jobs", "data", "items"])
    }

    async fn job(&self, job_id: &str) -> SyncResult<Job> {
        let url = self.endpoint(&["jobs", job_id])?;
        let body = self.fetch_json(self.get(url)).await?;
        // some deployments wrap the record as {"job": {...}}
        let body = match body {
            Value::Object(mut map) if map.get("job").map(Value::is_object).unwrap_or(false) => {
                map.remove("job").unwrap_or(Value::Null)
            }
            other => other,
        };
        serde_json::from_value(body).map_err(|err| SyncError::Decode(err.to_string()))
    }

    async fn job_metrics(&self, job_id: &str) -> SyncResult<Map<String, Value>> {
        let url = self.endpoint(&["jobs", job_id, "metrics"])?;
        match self.fetch_json(self.get(url)).await? {
            Value::Object(map) => Ok(map),
            other => {
                debug!(
                    target = "job_sync::client",
                    job_id,
                    kind = value_kind(&other),
                    "metrics payload is not an object"
                );
                Ok(Map::new())
            }
        }
    }

    async fn events(
        &self,
        subscription: &Subscription,
        limit: usize,
    ) -> SyncResult<Vec<JobEvent>> {
        let url = self.endpoint(&["jobs", &subscription.job_id, "events"])?;
        let request = self.get(url).query(&[
            ("since_seq", subscription.since_seq),
            ("limit", limit as u64),
        ]);
        let body = self.fetch_json(request).await?;
        decode_list(body, &["events", "data", "items"])
    }

    async fn open_event_stream(&self, subscription: &Subscription) -> SyncResult<ByteStream> {
        let url = self.endpoint(&["jobs", &subscription.job_id, "events", "stream"])?;
        let res = self
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .query(&[("since_seq", subscription.since_seq)])
            .send()
            .await?;
        let res = ensure_success(res).await?;
        Ok(res
            .bytes_stream()
            .map(|chunk| chunk.map_err(SyncError::from))
            .boxed())
    }
}

async fn ensure_success(res: Response) -> SyncResult<Response> {
    if res.status().is_success() {
        Ok(res)
    } else {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(SyncError::UnexpectedStatus { status, body })
    }
}

/// Accepts either a bare array or an object holding the array under one of
/// `keys`. Entries that fail to decode are skipped.
fn decode_list<T: DeserializeOwned>(body: Value, keys: &[&str]) -> SyncResult<Vec<T>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => keys
            .iter()
            .find_map(|key| match map.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| SyncError::Decode(format!("expected one of {keys:?}")))?,
        other => {
            return Err(SyncError::Decode(format!(
                "expected array, got {}",
                value_kind(&other)
            )))
        }
    };
    let mut decoded = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value(item) {
            Ok(value) => decoded.push(value),
            Err(err) => warn!(target = "job_sync::client", error = %err, "skipping undecodable entry"),
        }
    }
    Ok(decoded)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Importer client
//!
//! The importer serves every stream under `palaute/updater/{stream}`. A page
//! request answers either with records or with a not-ready signal
//! (`{"waitAndRetry": true, "waitTime": 1500}`). Records are converted into
//! the typed forms in [`records`] here, at the boundary; nothing past this
//! module handles untyped JSON.

pub mod records;

use crate::updater::offsets::StreamPosition;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Wait applied when a not-ready signal carries no `waitTime`.
pub const DEFAULT_NOT_READY_WAIT: Duration = Duration::from_millis(1000);

const UPDATER_PATH: &str = "palaute/updater";

#[derive(Error, Debug)]
pub enum ImporterError {
    #[error("Importer request to '{path}' failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Importer answered {status} for '{path}'")]
    Status {
        path: String,
        status: reqwest::StatusCode,
    },

    #[error("Malformed payload from '{path}': {message}")]
    Malformed { path: String, message: String },
}

/// One request against an importer stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub path: String,
    pub since: Option<DateTime<Utc>>,
    pub offset: Option<u64>,
    pub limit: Option<u32>,
}

impl PageRequest {
    pub fn page(path: &str, position: StreamPosition, limit: u32) -> Self {
        Self {
            path: path.to_string(),
            since: position.since,
            offset: Some(position.offset),
            limit: Some(limit),
        }
    }

    /// Unpaged request, e.g. `enrolments/{realisation_id}`.
    pub fn whole(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            since: None,
            offset: None,
            limit: None,
        }
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if let Some(since) = self.since {
            query.push(("since", since.to_rfc3339()));
        }
        if let Some(offset) = self.offset {
            query.push(("offset", offset.to_string()));
        }
        if let Some(limit) = self.limit {
            query.push(("limit", limit.to_string()));
        }
        query
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceResponse {
    Ready(Vec<Value>),
    NotReady { wait: Duration },
}

/// A source of paged upstream records.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> Result<SourceResponse, ImporterError>;
}

/// Records of one page plus how many not-ready waits preceded them.
#[derive(Debug)]
pub struct Fetched<T> {
    pub records: Vec<T>,
    pub waits: u32,
}

/// Fetch `request` until the source is ready, sleeping on every not-ready
/// signal, then decode the records.
pub async fn fetch_ready<T: DeserializeOwned>(
    source: &dyn UpstreamSource,
    request: &PageRequest,
) -> Result<Fetched<T>, ImporterError> {
    let mut waits = 0;

    loop {
        match source.fetch(request).await? {
            SourceResponse::NotReady { wait } => {
                waits += 1;
                debug!(
                    path = %request.path,
                    wait_ms = wait.as_millis() as u64,
                    attempt = waits,
                    "Importer not ready, waiting"
                );
                tokio::time::sleep(wait).await;
            },
            SourceResponse::Ready(values) => {
                let records = decode(&request.path, values)?;
                return Ok(Fetched { records, waits });
            },
        }
    }
}

fn decode<T: DeserializeOwned>(path: &str, values: Vec<Value>) -> Result<Vec<T>, ImporterError> {
    values
        .into_iter()
        .enumerate()
        .map(|(index, value)| {
            serde_json::from_value(value).map_err(|e| ImporterError::Malformed {
                path: path.to_string(),
                message: format!("record {index}: {e}"),
            })
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Records {
        #[serde(alias = "data")]
        records: Vec<Value>,
    },
    Bare(Vec<Value>),
    Wait {
        #[serde(rename = "waitAndRetry")]
        wait_and_retry: bool,
        #[serde(rename = "waitTime", default)]
        wait_time: Option<u64>,
    },
}

fn interpret(path: &str, body: Value) -> Result<SourceResponse, ImporterError> {
    let envelope: Envelope = serde_json::from_value(body).map_err(|_| ImporterError::Malformed {
        path: path.to_string(),
        message: "expected records or a waitAndRetry signal".to_string(),
    })?;

    match envelope {
        Envelope::Records { records } | Envelope::Bare(records) => Ok(SourceResponse::Ready(records)),
        Envelope::Wait {
            wait_and_retry: true,
            wait_time,
        } => Ok(SourceResponse::NotReady {
            wait: wait_time
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_NOT_READY_WAIT),
        }),
        Envelope::Wait { .. } => Err(ImporterError::Malformed {
            path: path.to_string(),
            message: "waitAndRetry is false but no records were sent".to_string(),
        }),
    }
}

/// HTTP client for the importer
#[derive(Clone)]
pub struct ImporterClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ImporterClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, UPDATER_PATH, path.trim_start_matches('/'))
    }
}

#[async_trait]
impl UpstreamSource for ImporterClient {
    async fn fetch(&self, request: &PageRequest) -> Result<SourceResponse, ImporterError> {
        let http_err = |source| ImporterError::Http {
            path: request.path.clone(),
            source,
        };

        let response = self
            .client
            .get(self.url(&request.path))
            .query(&[("token", self.token.as_str())])
            .query(&request.query())
            .send()
            .await
            .map_err(http_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ImporterError::Status {
                path: request.path.clone(),
                status,
            });
        }

        let body: Value = response.json().await.map_err(http_err)?;
        interpret(&request.path, body)
    }
}

//! Resumable batch fetcher
//!
//! Drives one stream to its end:
//!
//! 1. Read the stream's cursor, or start from the stream's default position
//! 2. Fetch a page at the cursor, sleeping through not-ready signals
//! 3. Hand the page to the handler
//! 4. Only after the handler succeeds, persist the advanced cursor
//! 5. Stop on an empty page or one shorter than the page size
//!
//! A crash between 3 and 4 replays the page on resume; handlers merge
//! idempotently so a replay cannot duplicate rows. A handler error aborts
//! the stream with the cursor still pointing at the failed page.

use crate::db::StoreError;
use crate::updater::importer::{fetch_ready, ImporterError, PageRequest, UpstreamSource};
use crate::updater::offsets::{offset_key, OffsetStore, StreamPosition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Per-page callback of a stream.
#[async_trait]
pub trait PageHandler<T: Send + 'static>: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn handle(&mut self, page: Vec<T>) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Upstream(#[from] ImporterError),

    #[error("Offset store failed for '{key}': {source}")]
    Offset {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("Page handler failed on '{key}' at offset {offset}: {source}")]
    Handler {
        key: String,
        offset: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// A stream as the fetcher walks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    /// Importer path, e.g. `enrolments`.
    pub stream: &'static str,
    /// Offset key base. Passes over the same stream use distinct keys.
    pub key: String,
    pub page_size: u32,
    /// `since` used when the stream has no stored offset.
    pub default_since: Option<DateTime<Utc>>,
}

impl StreamSpec {
    pub fn new(stream: &'static str, page_size: u32) -> Self {
        Self {
            stream,
            key: stream.to_string(),
            page_size,
            default_since: None,
        }
    }

    /// A named pass over the stream with its own offset.
    pub fn pass(mut self, pass: &str) -> Self {
        self.key = format!("{}:{}", self.stream, pass);
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.default_since = Some(since);
        self
    }

    pub fn offset_key(&self) -> String {
        offset_key(&self.key)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    /// Pages handed to the handler
    pub pages: u32,
    pub records: u64,
    /// Not-ready signals slept through
    pub waits: u32,
    /// Offset the stream resumed from, when one was stored
    pub resumed_from: Option<u64>,
}

pub struct BatchFetcher<'a> {
    source: &'a dyn UpstreamSource,
    offsets: &'a dyn OffsetStore,
}

impl<'a> BatchFetcher<'a> {
    pub fn new(source: &'a dyn UpstreamSource, offsets: &'a dyn OffsetStore) -> Self {
        Self { source, offsets }
    }

    pub async fn drain<T, H>(&self, spec: &StreamSpec, handler: &mut H) -> Result<FetchStats, FetchError>
    where
        T: DeserializeOwned + Send + 'static,
        H: PageHandler<T>,
    {
        let key = spec.offset_key();
        let offset_err = |source| FetchError::Offset {
            key: key.clone(),
            source,
        };

        let mut stats = FetchStats::default();
        let mut position = match self.offsets.get(&key).await.map_err(offset_err)? {
            Some(cursor) => {
                let position = StreamPosition::decode(&cursor).map_err(offset_err)?;
                stats.resumed_from = Some(position.offset);
                info!(stream = %spec.key, offset = position.offset, "Resuming stream from stored offset");
                position
            },
            None => StreamPosition::starting_at(spec.default_since),
        };

        loop {
            let request = PageRequest::page(spec.stream, position, spec.page_size);
            let fetched = fetch_ready::<T>(self.source, &request).await?;
            stats.waits += fetched.waits;

            let count = fetched.records.len();
            if count == 0 {
                debug!(stream = %spec.key, offset = position.offset, "Empty page, stream drained");
                break;
            }

            handler
                .handle(fetched.records)
                .await
                .map_err(|e| FetchError::Handler {
                    key: spec.key.clone(),
                    offset: position.offset,
                    source: Box::new(e),
                })?;

            position = position.advance(count);
            let cursor = position.encode().map_err(offset_err)?;
            self.offsets.set(&key, &cursor).await.map_err(offset_err)?;

            stats.pages += 1;
            stats.records += count as u64;
            debug!(stream = %spec.key, offset = position.offset, records = count, "Page processed");

            if count < spec.page_size as usize {
                break;
            }
        }

        info!(
            stream = %spec.key,
            pages = stats.pages,
            records = stats.records,
            waits = stats.waits,
            "Stream drained"
        );

        Ok(stats)
    }
}

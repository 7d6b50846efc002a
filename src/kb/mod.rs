//! Knowledge-group processing.
//!
//! A knowledge group is one configured ingestion source with its own run
//! state machine (`pending → processing → done|error`). Processing is
//! driven through two seams:
//!
//! - [`ProcessorListener`] — the four lifecycle hooks invoked by a
//!   processor as it works: run start, per-key content, per-key error,
//!   and completion. The production listener persists items and drives
//!   the chunk → quota → index pipeline; tests substitute their own.
//! - [`KbProcessor`] — the per-source-kind fetch strategy. Web and GitHub
//!   repository groups crawl; issue trackers, transcripts, and wiki-style
//!   services go through a [`FetchAdapter`]; uploads ingest the provided
//!   text directly.
//!
//! Cancellation is cooperative: a stop request flips the group status
//! away from `processing` and the processor observes this before issuing
//! the next fetch. In-flight fetches finish naturally.

pub mod adapter;
pub mod factory;
pub mod github;
pub mod listener;
pub mod upload;
pub mod video;
pub mod web;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::models::MetaTag;

/// Content produced for one logical key by any fetch strategy.
#[derive(Debug, Clone, Default)]
pub struct KbContent {
    pub title: Option<String>,
    pub text: String,
    pub meta_tags: Vec<MetaTag>,
    /// Set when the fetch failed; the item is persisted as `failed`.
    pub error: Option<String>,
}

/// Ingestion lifecycle hooks.
#[async_trait]
pub trait ProcessorListener: Send + Sync {
    /// Transition the group to `processing` and record a fresh run id.
    async fn on_before_start(&self) -> Result<()>;

    /// Content (or a per-key fetch error) is available for one key.
    async fn on_content_available(&self, key: &str, content: KbContent) -> Result<()>;

    /// A per-key failure outside the content path.
    async fn on_error(&self, key: &str, error: &str) -> Result<()>;

    /// The run finished; transition to `done` (or `error`) and schedule
    /// the next sync. Fires exactly once per run.
    async fn on_complete(&self, error: Option<String>) -> Result<()>;
}

/// What a finished run saw, for stale-item detection.
#[derive(Debug, Default, Clone)]
pub struct ProcessOutcome {
    /// Every key visited during the run (fetched, whether it succeeded
    /// or failed).
    pub visited_keys: Vec<String>,
}

/// One source-kind fetch strategy. `process` drives the listener hooks
/// end-to-end for a single run.
#[async_trait]
pub trait KbProcessor: Send + Sync {
    async fn process(&mut self) -> Result<ProcessOutcome>;
}

/// Fetch adapter for non-crawled source kinds (issue trackers, video
/// transcripts, wiki-style services). The adapter owns its auth,
/// pagination, and rate limiting; the core only consumes keys and
/// per-key content.
#[async_trait]
pub trait FetchAdapter: Send + Sync {
    /// All logical keys currently present in the source.
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Content for one key.
    async fn fetch(&self, key: &str) -> Result<KbContent>;
}

/// Typed ingestion errors callers need to match on.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Adding this document would exceed the tenant's page quota.
    #[error("Pages limit reached for the plan: {count} ingested + {adding} new > {limit}")]
    QuotaExceeded { count: i64, adding: i64, limit: i64 },
}

/// Next automatic sync time for a group's configured cadence. `manual`
/// groups are never rescheduled.
pub fn next_update_time(frequency: &str, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match frequency {
        "daily" => Some(from + Duration::days(1)),
        "weekly" => Some(from + Duration::days(7)),
        "monthly" => Some(from + Duration::days(30)),
        _ => None,
    }
}

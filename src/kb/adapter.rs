//! Adapter-driven processor for non-crawled source kinds.
//!
//! Issue trackers, transcripts, and wiki-style services enumerate their
//! own keys; there is no link discovery. The processor walks the key list
//! sequentially, polling the group status between keys for cooperative
//! cancellation, and isolates per-key adapter failures through
//! `on_error`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::kb::{FetchAdapter, KbProcessor, ProcessOutcome, ProcessorListener};
use crate::models::GroupStatus;
use crate::store::MetaStore;

pub struct AdapterProcessor {
    listener: Arc<dyn ProcessorListener>,
    store: Arc<dyn MetaStore>,
    adapter: Arc<dyn FetchAdapter>,
    group_id: String,
    page_limit: Option<usize>,
}

impl AdapterProcessor {
    pub fn new(
        listener: Arc<dyn ProcessorListener>,
        store: Arc<dyn MetaStore>,
        adapter: Arc<dyn FetchAdapter>,
        group_id: &str,
        page_limit: Option<usize>,
    ) -> Self {
        Self {
            listener,
            store,
            adapter,
            group_id: group_id.to_string(),
            page_limit,
        }
    }
}

#[async_trait]
impl KbProcessor for AdapterProcessor {
    async fn process(&mut self) -> Result<ProcessOutcome> {
        self.listener.on_before_start().await?;

        // Listing failures are run-level: there is nothing to iterate.
        let keys = self.adapter.list_keys().await?;
        tracing::info!(group = %self.group_id, keys = keys.len(), "Adapter listed keys");

        let mut visited = Vec::new();
        let mut fetched = 0usize;
        for key in keys {
            if let Some(limit) = self.page_limit {
                if fetched >= limit {
                    tracing::info!(group = %self.group_id, limit, "Reached page limit");
                    break;
                }
            }

            let status = self.store.group_run(&self.group_id).await?.status;
            if status != GroupStatus::Processing {
                tracing::info!(group = %self.group_id, status = status.as_str(), "Run no longer processing, stopping");
                break;
            }

            match self.adapter.fetch(&key).await {
                Ok(content) => self.listener.on_content_available(&key, content).await?,
                Err(e) => self.listener.on_error(&key, &e.to_string()).await?,
            }
            visited.push(key);
            fetched += 1;
        }

        self.listener.on_complete(None).await?;
        Ok(ProcessOutcome {
            visited_keys: visited,
        })
    }
}

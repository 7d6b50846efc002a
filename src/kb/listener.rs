//! The persisting [`ProcessorListener`].
//!
//! Drives the shared ingestion pipeline for every source kind: chunk the
//! text, enforce the page quota, delete the chunk records a previous
//! ingest of the same key left in the index, upsert the new chunks, and
//! persist the item with its final status. Per-key failures never escape
//! this listener; they are recorded on the item and the run continues.

use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::chunk::{split_markdown, SplitOptions};
use crate::indexer::{make_record_id, Indexer};
use crate::kb::{next_update_time, IngestError, KbContent, ProcessorListener};
use crate::models::{GroupStatus, IndexDocument, ItemStatus, KnowledgeItem};
use crate::store::MetaStore;

/// Check the tenant page quota before indexing one document.
///
/// Keys already present in the store are exempt: re-ingesting an existing
/// page never consumes quota. For new keys the check is
/// `completed pages + new chunk count <= limit`.
pub async fn assert_limit(
    store: &dyn MetaStore,
    group_id: &str,
    key: &str,
    adding: i64,
    limit: i64,
) -> Result<(), IngestError> {
    let existing = store.find_item(group_id, key).await.ok().flatten();
    if existing.is_some() {
        return Ok(());
    }

    let count = store.completed_pages_count().await.unwrap_or(0);
    if count + adding <= limit {
        return Ok(());
    }

    Err(IngestError::QuotaExceeded {
        count,
        adding,
        limit,
    })
}

/// Configuration the listener needs from the group.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub group_id: String,
    /// Collection the group's chunks are embedded under.
    pub collection_id: String,
    pub max_chars: usize,
    pub item_context: Option<String>,
    pub pages_limit: i64,
    pub update_frequency: String,
}

pub struct IngestListener {
    store: Arc<dyn MetaStore>,
    indexer: Arc<dyn Indexer>,
    options: ListenerOptions,
    /// Run id minted by `on_before_start`; compared before the final
    /// status write so a cancelled run cannot clobber a newer one.
    run_id: Mutex<Option<String>>,
}

impl IngestListener {
    pub fn new(
        store: Arc<dyn MetaStore>,
        indexer: Arc<dyn Indexer>,
        options: ListenerOptions,
    ) -> Self {
        Self {
            store,
            indexer,
            options,
            run_id: Mutex::new(None),
        }
    }

    async fn persist_failed(&self, key: &str, title: Option<String>, error: String) -> Result<()> {
        let existing = self.store.find_item(&self.options.group_id, key).await?;

        let item = match existing {
            Some(mut item) => {
                item.status = ItemStatus::Failed;
                item.error = Some(error);
                if title.is_some() {
                    item.title = title;
                }
                item.updated_at = Utc::now();
                item
            }
            None => KnowledgeItem {
                id: String::new(),
                group_id: self.options.group_id.clone(),
                key: key.to_string(),
                title,
                markdown: String::new(),
                meta_tags: Vec::new(),
                chunk_ids: Vec::new(),
                status: ItemStatus::Failed,
                error: Some(error),
                updated_at: Utc::now(),
            },
        };

        self.store.upsert_item(&item).await?;
        Ok(())
    }
}

#[async_trait]
impl ProcessorListener for IngestListener {
    async fn on_before_start(&self) -> Result<()> {
        let run_id = Uuid::new_v4().to_string();
        *self.run_id.lock().unwrap() = Some(run_id.clone());

        let mut run = self.store.group_run(&self.options.group_id).await?;
        run.status = GroupStatus::Processing;
        run.run_id = Some(run_id);
        run.fetch_error = None;
        self.store.set_group_run(&run).await?;
        Ok(())
    }

    async fn on_content_available(&self, key: &str, content: KbContent) -> Result<()> {
        if let Some(error) = content.error {
            tracing::warn!(group = %self.options.group_id, key = %key, error = %error, "Fetch failed for key");
            return self.persist_failed(key, content.title, error).await;
        }

        let split = SplitOptions {
            max_chars: self.options.max_chars,
            context: self.options.item_context.clone(),
        };
        let chunks = match split_markdown(&content.text, &split) {
            Ok(chunks) => chunks,
            Err(e) => return self.persist_failed(key, content.title, e.to_string()).await,
        };

        if let Err(quota) = assert_limit(
            self.store.as_ref(),
            &self.options.group_id,
            key,
            chunks.len() as i64,
            self.options.pages_limit,
        )
        .await
        {
            tracing::warn!(group = %self.options.group_id, key = %key, "{}", quota);
            return self.persist_failed(key, content.title, quota.to_string()).await;
        }

        // Superseded chunks must leave the index before the new ones land,
        // so a re-ingest can never accumulate stale vectors.
        let existing = self.store.find_item(&self.options.group_id, key).await?;
        if let Some(existing) = &existing {
            self.indexer.delete_by_ids(&existing.chunk_ids).await?;
        }

        let documents: Vec<IndexDocument> = chunks
            .iter()
            .map(|chunk| IndexDocument {
                id: make_record_id(&self.options.collection_id, &Uuid::new_v4().to_string()),
                text: chunk.clone(),
                url: key.to_string(),
            })
            .collect();

        self.indexer
            .upsert(&self.options.collection_id, &documents)
            .await?;

        let item = KnowledgeItem {
            id: existing.map(|e| e.id).unwrap_or_default(),
            group_id: self.options.group_id.clone(),
            key: key.to_string(),
            title: content.title,
            markdown: content.text,
            meta_tags: content.meta_tags,
            chunk_ids: documents.iter().map(|d| d.id.clone()).collect(),
            status: ItemStatus::Completed,
            error: None,
            updated_at: Utc::now(),
        };
        self.store.upsert_item(&item).await?;

        tracing::info!(group = %self.options.group_id, key = %key, chunks = documents.len(), "Item ingested");
        Ok(())
    }

    async fn on_error(&self, key: &str, error: &str) -> Result<()> {
        tracing::warn!(group = %self.options.group_id, key = %key, error = %error, "Item failed");
        self.persist_failed(key, None, error.to_string()).await
    }

    async fn on_complete(&self, error: Option<String>) -> Result<()> {
        let own_run_id = self.run_id.lock().unwrap().clone();

        let mut run = self.store.group_run(&self.options.group_id).await?;
        if own_run_id.is_some() && run.run_id != own_run_id {
            // A newer run took over while this one was finishing.
            return Ok(());
        }

        run.status = if error.is_some() {
            GroupStatus::Error
        } else {
            GroupStatus::Done
        };
        run.fetch_error = error;
        run.last_updated_at = Some(Utc::now());
        run.next_update_at = next_update_time(&self.options.update_frequency, Utc::now());
        self.store.set_group_run(&run).await?;
        Ok(())
    }
}

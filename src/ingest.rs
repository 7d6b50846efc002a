//! Run orchestration for knowledge groups.
//!
//! Wires one group's processor, listener, store, and index together for
//! a single sync run: guard the one-active-run invariant, run the
//! processor, capture run-level failures into the group's `error` status
//! (still firing `on_complete`), and clean up stale items afterwards
//! when the group asks for it.

use std::sync::Arc;

use anyhow::{bail, Result};

use crate::config::Config;
use crate::crawl::PageFetcher;
use crate::indexer::{make_indexer, Indexer};
use crate::kb::factory::{make_processor, ProcessorDeps};
use crate::kb::listener::{IngestListener, ListenerOptions};
use crate::kb::{FetchAdapter, ProcessorListener};
use crate::models::{GroupStatus, SourceKind};
use crate::store::MetaStore;

/// Everything a sync run needs from the environment.
pub struct SyncDeps {
    pub store: Arc<dyn MetaStore>,
    pub fetcher: Arc<dyn PageFetcher>,
    /// Body for `upload` groups, supplied out of band.
    pub upload: Option<(String, String)>,
    /// Adapter for wiki-style groups.
    pub external_adapter: Option<Arc<dyn FetchAdapter>>,
}

/// Summary of one finished run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub group_id: String,
    pub visited: usize,
    pub completed: usize,
    pub failed: usize,
    pub stale_removed: usize,
    pub error: Option<String>,
}

/// Run one sync for a configured group.
pub async fn run_sync(
    config: &Config,
    deps: SyncDeps,
    group_name: &str,
    limit_override: Option<usize>,
) -> Result<SyncReport> {
    let Some(group_config) = config.groups.get(group_name) else {
        bail!(
            "Unknown knowledge group: '{}'. Configured groups: {}",
            group_name,
            config
                .groups
                .keys()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    };

    let mut group = group_config.clone();
    if limit_override.is_some() {
        group.page_limit = limit_override;
    }

    // One active run per group.
    let run = deps.store.group_run(group_name).await?;
    if run.status == GroupStatus::Processing {
        bail!("Group '{}' is already processing", group_name);
    }

    let indexer: Arc<dyn Indexer> = make_indexer(config, group.indexer.as_deref())?;

    let listener = Arc::new(IngestListener::new(
        deps.store.clone(),
        indexer.clone(),
        ListenerOptions {
            group_id: group_name.to_string(),
            collection_id: group_name.to_string(),
            max_chars: config.chunking.max_chars,
            item_context: group.item_context.clone(),
            pages_limit: config.quota.pages,
            update_frequency: group.update_frequency.clone(),
        },
    ));

    let kind = SourceKind::from_group(&group, deps.upload.clone())?;
    let mut processor = make_processor(
        ProcessorDeps {
            listener: listener.clone(),
            store: deps.store.clone(),
            fetcher: deps.fetcher.clone(),
        },
        group_name,
        &group,
        kind,
        deps.external_adapter.clone(),
    )?;

    // Run-level failures land in the group status, not in the caller's
    // control flow; completion still fires.
    let outcome = match processor.process().await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            tracing::error!(group = %group_name, error = %e, "Run failed");
            listener.on_complete(Some(e.to_string())).await?;
            Err(e)
        }
    };

    let mut stale_removed = 0usize;
    if let Ok(outcome) = &outcome {
        if group.remove_stale_pages {
            stale_removed =
                remove_stale_items(deps.store.as_ref(), indexer.as_ref(), group_name, &outcome.visited_keys)
                    .await?;
        }
    }

    let items = deps.store.list_items(group_name).await?;
    let completed = items
        .iter()
        .filter(|i| i.status == crate::models::ItemStatus::Completed)
        .count();
    let failed = items
        .iter()
        .filter(|i| i.status == crate::models::ItemStatus::Failed)
        .count();

    Ok(SyncReport {
        group_id: group_name.to_string(),
        visited: outcome.as_ref().map(|o| o.visited_keys.len()).unwrap_or(0),
        completed,
        failed,
        stale_removed,
        error: outcome.err().map(|e| e.to_string()),
    })
}

/// Delete items whose key disappeared from the source. Runs only after a
/// successful run, so a partial crawl can never mass-delete.
async fn remove_stale_items(
    store: &dyn MetaStore,
    indexer: &dyn Indexer,
    group_id: &str,
    visited_keys: &[String],
) -> Result<usize> {
    let mut removed = 0usize;

    for item in store.list_items(group_id).await? {
        if visited_keys.contains(&item.key) {
            continue;
        }
        tracing::info!(group = %group_id, key = %item.key, "Removing stale item");
        indexer.delete_by_ids(&item.chunk_ids).await?;
        store.delete_item(group_id, &item.key).await?;
        removed += 1;
    }

    Ok(removed)
}

/// Request a cooperative stop: flip the group out of `processing`. The
/// crawler observes the change before its next fetch; in-flight requests
/// finish naturally and their results are discarded with the run.
pub async fn stop_group(store: &dyn MetaStore, group_name: &str) -> Result<()> {
    let mut run = store.group_run(group_name).await?;
    if run.status != GroupStatus::Processing {
        return Ok(());
    }
    run.status = GroupStatus::Done;
    store.set_group_run(&run).await?;
    Ok(())
}

/// Remove a group's derived data: items and index records.
pub async fn clear_group(
    store: &dyn MetaStore,
    indexer: &dyn Indexer,
    group_name: &str,
) -> Result<()> {
    indexer.delete_collection(group_name).await?;
    store.delete_items(group_name).await?;
    Ok(())
}

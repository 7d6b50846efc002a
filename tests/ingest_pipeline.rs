//! End-to-end ingestion tests over the in-memory store and index with a
//! canned-page fetcher: crawl → chunk → quota → index → persist, plus
//! run-state transitions, re-sync, and stale removal.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use ragbase::config::{Config, DbConfig, GroupConfig};
use ragbase::crawl::{PageFetcher, RawPage};
use ragbase::indexer::memory::InMemoryIndexer;
use ragbase::indexer::{Indexer, SearchOptions};
use ragbase::ingest::{run_sync, stop_group, SyncDeps};
use ragbase::kb::listener::{IngestListener, ListenerOptions};
use ragbase::kb::web::WebProcessor;
use ragbase::kb::{KbProcessor, ProcessorListener};
use ragbase::models::{GroupStatus, ItemStatus};
use ragbase::store::memory::InMemoryStore;
use ragbase::store::MetaStore;

struct SiteFetcher {
    pages: HashMap<String, RawPage>,
}

#[async_trait]
impl PageFetcher for SiteFetcher {
    async fn fetch(&self, url: &str) -> Result<RawPage> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("connection refused: {}", url))
    }
}

fn page(html: &str) -> RawPage {
    RawPage {
        status: 200,
        html: html.to_string(),
    }
}

/// Root links to one same-origin page and one off-origin page.
fn two_page_site() -> SiteFetcher {
    SiteFetcher {
        pages: HashMap::from([
            (
                "https://docs.example.com/".to_string(),
                page(
                    r#"<html><head><title>Docs Home</title></head><body>
                    <p>Welcome to the documentation.</p>
                    <a href="/guide">Guide</a>
                    <a href="https://elsewhere.com/page">Elsewhere</a>
                    </body></html>"#,
                ),
            ),
            (
                "https://docs.example.com/guide".to_string(),
                page(
                    r#"<html><head><title>Guide</title></head><body>
                    <p>The guide explains deployment and pricing.</p>
                    </body></html>"#,
                ),
            ),
        ]),
    }
}

fn web_group(url: &str) -> GroupConfig {
    GroupConfig {
        kind: "web".to_string(),
        url: Some(url.to_string()),
        branch: None,
        match_prefix: false,
        skip_page_regex: None,
        remove_html_tags: None,
        include_404: false,
        remove_stale_pages: false,
        load_dynamically: false,
        scroll_selector: None,
        static_content_threshold: None,
        page_limit: Some(5),
        update_frequency: "manual".to_string(),
        item_context: None,
        indexer: None,
        min_score: None,
        chat_prompt: None,
    }
}

fn config_with_group(name: &str, group: GroupConfig) -> Config {
    let mut config = Config::minimal();
    config.db = DbConfig {
        path: std::path::PathBuf::from("/tmp/unused.sqlite"),
    };
    config.groups.insert(name.to_string(), group);
    config
}

#[tokio::test]
async fn test_end_to_end_crawl_scenario() {
    let config = config_with_group("docs", web_group("https://docs.example.com/"));
    let store = Arc::new(InMemoryStore::new());

    let report = run_sync(
        &config,
        SyncDeps {
            store: store.clone(),
            fetcher: Arc::new(two_page_site()),
            upload: None,
            external_adapter: None,
        },
        "docs",
        None,
    )
    .await
    .unwrap();

    // Exactly the two same-origin pages became completed items; the
    // off-origin link was never fetched.
    assert!(report.error.is_none());
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);

    let items = store.list_items("docs").await.unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.status == ItemStatus::Completed));
    assert!(items.iter().all(|i| !i.key.contains("elsewhere.com")));

    let run = store.group_run("docs").await.unwrap();
    assert_eq!(run.status, GroupStatus::Done);
    assert!(run.run_id.is_some());
    assert!(run.last_updated_at.is_some());
}

#[tokio::test]
async fn test_unknown_group_is_an_error() {
    let config = config_with_group("docs", web_group("https://docs.example.com/"));
    let store = Arc::new(InMemoryStore::new());

    let result = run_sync(
        &config,
        SyncDeps {
            store,
            fetcher: Arc::new(two_page_site()),
            upload: None,
            external_adapter: None,
        },
        "nope",
        None,
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_concurrent_trigger_rejected_and_rearm_after_done() {
    let config = config_with_group("docs", web_group("https://docs.example.com/"));
    let store = Arc::new(InMemoryStore::new());

    // Simulate an active run.
    let mut run = store.group_run("docs").await.unwrap();
    run.status = GroupStatus::Processing;
    store.set_group_run(&run).await.unwrap();

    let result = run_sync(
        &config,
        SyncDeps {
            store: store.clone(),
            fetcher: Arc::new(two_page_site()),
            upload: None,
            external_adapter: None,
        },
        "docs",
        None,
    )
    .await;
    assert!(result.is_err());

    // After a stop the group re-arms and a fresh run succeeds.
    stop_group(store.as_ref(), "docs").await.unwrap();
    let report = run_sync(
        &config,
        SyncDeps {
            store: store.clone(),
            fetcher: Arc::new(two_page_site()),
            upload: None,
            external_adapter: None,
        },
        "docs",
        None,
    )
    .await
    .unwrap();
    assert!(report.error.is_none());
    assert_eq!(store.group_run("docs").await.unwrap().status, GroupStatus::Done);
}

#[tokio::test]
async fn test_reingestion_is_idempotent_in_the_index() {
    let store = Arc::new(InMemoryStore::new());
    let indexer = Arc::new(InMemoryIndexer::new(
        Default::default(),
        Default::default(),
    ));

    let listener = Arc::new(IngestListener::new(
        store.clone(),
        indexer.clone(),
        ListenerOptions {
            group_id: "docs".to_string(),
            collection_id: "docs".to_string(),
            max_chars: 7680,
            item_context: None,
            pages_limit: 100,
            update_frequency: "manual".to_string(),
        },
    ));

    for _ in 0..2 {
        let mut processor = WebProcessor::new(
            listener.clone(),
            store.clone(),
            Arc::new(two_page_site()),
            "docs",
            "https://docs.example.com/",
            Default::default(),
            Some(5),
        );
        processor.process().await.unwrap();
    }

    // Two syncs, still one item per page and one live chunk set each.
    let items = store.list_items("docs").await.unwrap();
    assert_eq!(items.len(), 2);
    let total_chunks: usize = items.iter().map(|i| i.chunk_ids.len()).sum();
    assert_eq!(indexer.record_count("docs"), total_chunks);
}

#[tokio::test]
async fn test_ingested_content_is_searchable() {
    let store = Arc::new(InMemoryStore::new());
    let indexer = Arc::new(InMemoryIndexer::new(
        Default::default(),
        Default::default(),
    ));

    let listener = Arc::new(IngestListener::new(
        store.clone(),
        indexer.clone(),
        ListenerOptions {
            group_id: "docs".to_string(),
            collection_id: "docs".to_string(),
            max_chars: 7680,
            item_context: None,
            pages_limit: 100,
            update_frequency: "manual".to_string(),
        },
    ));

    let mut processor = WebProcessor::new(
        listener,
        store.clone(),
        Arc::new(two_page_site()),
        "docs",
        "https://docs.example.com/",
        Default::default(),
        Some(5),
    );
    processor.process().await.unwrap();

    let matches = indexer
        .search("docs", "deployment and pricing", &SearchOptions::default())
        .await
        .unwrap();
    assert!(!matches.is_empty());

    let ranked = indexer
        .process("deployment and pricing", matches)
        .await
        .unwrap();
    assert!(ranked[0].content.contains("deployment"));
    assert_eq!(
        ranked[0].url.as_deref(),
        Some("https://docs.example.com/guide")
    );

    // The top passage resolves back to its persisted item.
    let item = store
        .find_item_by_chunk_id(&ranked[0].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(item.key, "https://docs.example.com/guide");
}

#[tokio::test]
async fn test_stale_items_removed_when_enabled() {
    let mut group = web_group("https://docs.example.com/");
    group.remove_stale_pages = true;
    let config = config_with_group("docs", group);

    let store = Arc::new(InMemoryStore::new());

    // An item from an earlier sync whose page no longer exists.
    store
        .upsert_item(&ragbase::models::KnowledgeItem {
            id: String::new(),
            group_id: "docs".to_string(),
            key: "https://docs.example.com/removed".to_string(),
            title: Some("Removed".to_string()),
            markdown: "old".to_string(),
            meta_tags: Vec::new(),
            chunk_ids: Vec::new(),
            status: ItemStatus::Completed,
            error: None,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let report = run_sync(
        &config,
        SyncDeps {
            store: store.clone(),
            fetcher: Arc::new(two_page_site()),
            upload: None,
            external_adapter: None,
        },
        "docs",
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.stale_removed, 1);
    assert!(store
        .find_item("docs", "https://docs.example.com/removed")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_upload_group_ingests_provided_document() {
    let group = GroupConfig {
        kind: "upload".to_string(),
        url: None,
        branch: None,
        match_prefix: false,
        skip_page_regex: None,
        remove_html_tags: None,
        include_404: false,
        remove_stale_pages: false,
        load_dynamically: false,
        scroll_selector: None,
        static_content_threshold: None,
        page_limit: None,
        update_frequency: "manual".to_string(),
        item_context: None,
        indexer: None,
        min_score: None,
        chat_prompt: None,
    };
    let config = config_with_group("handbook", group);
    let store = Arc::new(InMemoryStore::new());

    let report = run_sync(
        &config,
        SyncDeps {
            store: store.clone(),
            fetcher: Arc::new(SiteFetcher {
                pages: HashMap::new(),
            }),
            upload: Some((
                "Employee Handbook".to_string(),
                "# Handbook\n\nVacation policy details.".to_string(),
            )),
            external_adapter: None,
        },
        "handbook",
        None,
    )
    .await
    .unwrap();

    assert_eq!(report.completed, 1);
    let items = store.list_items("handbook").await.unwrap();
    assert_eq!(items[0].key, "upload:employee-handbook");
    assert!(items[0].markdown.contains("Vacation policy"));
}

#[tokio::test]
async fn test_run_level_error_sets_error_status_and_completes() {
    // A group whose kind needs an adapter that is missing fails at
    // construction; construction errors surface to the caller, so force
    // a run-level error instead: a processor whose listener start works
    // but whose source listing explodes.
    struct ExplodingAdapter;

    #[async_trait]
    impl ragbase::kb::FetchAdapter for ExplodingAdapter {
        async fn list_keys(&self) -> Result<Vec<String>> {
            anyhow::bail!("source API returned 503")
        }
        async fn fetch(&self, _key: &str) -> Result<ragbase::kb::KbContent> {
            unreachable!()
        }
    }

    let group = GroupConfig {
        kind: "wiki".to_string(),
        url: Some("https://wiki.example.com".to_string()),
        branch: None,
        match_prefix: false,
        skip_page_regex: None,
        remove_html_tags: None,
        include_404: false,
        remove_stale_pages: false,
        load_dynamically: false,
        scroll_selector: None,
        static_content_threshold: None,
        page_limit: None,
        update_frequency: "manual".to_string(),
        item_context: None,
        indexer: None,
        min_score: None,
        chat_prompt: None,
    };
    let config = config_with_group("wiki", group);
    let store = Arc::new(InMemoryStore::new());

    let report = run_sync(
        &config,
        SyncDeps {
            store: store.clone(),
            fetcher: Arc::new(SiteFetcher {
                pages: HashMap::new(),
            }),
            upload: None,
            external_adapter: Some(Arc::new(ExplodingAdapter)),
        },
        "wiki",
        None,
    )
    .await
    .unwrap();

    assert!(report.error.as_deref().unwrap().contains("503"));
    let run = store.group_run("wiki").await.unwrap();
    assert_eq!(run.status, GroupStatus::Error);
    assert!(run.fetch_error.as_deref().unwrap().contains("503"));
}

#[tokio::test]
async fn test_listener_hooks_exempt_from_double_complete() {
    // The processor fires on_complete once itself; a run-level error path
    // in run_sync fires it instead. Either way the stored run ends in a
    // terminal state exactly once per run id.
    let config = config_with_group("docs", web_group("https://docs.example.com/"));
    let store = Arc::new(InMemoryStore::new());

    #[derive(Default)]
    struct CountingListener {
        completes: std::sync::Mutex<u32>,
    }

    #[async_trait]
    impl ProcessorListener for CountingListener {
        async fn on_before_start(&self) -> Result<()> {
            Ok(())
        }
        async fn on_content_available(
            &self,
            _key: &str,
            _content: ragbase::kb::KbContent,
        ) -> Result<()> {
            Ok(())
        }
        async fn on_error(&self, _key: &str, _error: &str) -> Result<()> {
            Ok(())
        }
        async fn on_complete(&self, _error: Option<String>) -> Result<()> {
            *self.completes.lock().unwrap() += 1;
            Ok(())
        }
    }

    let listener = Arc::new(CountingListener::default());
    let mut processor = WebProcessor::new(
        listener.clone(),
        store,
        Arc::new(two_page_site()),
        "docs",
        "https://docs.example.com/",
        Default::default(),
        config.groups["docs"].page_limit,
    );
    processor.process().await.unwrap();

    assert_eq!(*listener.completes.lock().unwrap(), 1);
}

//! Web crawl processor.
//!
//! Drives a breadth-first crawl over one site: pop the next un-fetched
//! key from the frontier in first-seen order, fetch it, hand the content
//! to the listener, and keep going until the frontier drains, the page
//! limit is hit, or the group's status leaves `processing` (the
//! cooperative stop signal, checked before every new fetch).

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::crawl::{clean_url, fetch_with_links, CrawlOptions, CrawlStore, PageFetcher};
use crate::kb::{KbContent, KbProcessor, ProcessOutcome, ProcessorListener};
use crate::models::GroupStatus;
use crate::store::MetaStore;

const DEFAULT_PAGE_LIMIT: usize = 5000;

pub struct WebProcessor {
    listener: Arc<dyn ProcessorListener>,
    store: Arc<dyn MetaStore>,
    fetcher: Arc<dyn PageFetcher>,
    group_id: String,
    start_url: String,
    options: CrawlOptions,
    page_limit: usize,
}

impl WebProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: Arc<dyn ProcessorListener>,
        store: Arc<dyn MetaStore>,
        fetcher: Arc<dyn PageFetcher>,
        group_id: &str,
        start_url: &str,
        options: CrawlOptions,
        page_limit: Option<usize>,
    ) -> Self {
        Self {
            listener,
            store,
            fetcher,
            group_id: group_id.to_string(),
            start_url: start_url.to_string(),
            options,
            page_limit: page_limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }

}

#[async_trait]
impl KbProcessor for WebProcessor {
    async fn process(&mut self) -> Result<ProcessOutcome> {
        if self.start_url.is_empty() {
            anyhow::bail!("No url provided");
        }

        let start = clean_url(&self.start_url);

        let mut crawl_store = CrawlStore::new();
        crawl_store.url_set.add(start.clone());

        self.listener.on_before_start().await?;

        tracing::info!(group = %self.group_id, url = %start, limit = self.page_limit, "Starting crawl");

        loop {
            let next = match crawl_store.not_fetched().into_iter().next() {
                Some(url) => url,
                None => break,
            };

            let result =
                fetch_with_links(self.fetcher.as_ref(), &next, &mut crawl_store, &start, &self.options)
                    .await;

            let content = match result {
                Ok(page) => KbContent {
                    title: page.title,
                    text: page.markdown,
                    meta_tags: page.meta_tags,
                    error: None,
                },
                Err(e) => KbContent {
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            };

            self.listener.on_content_available(&next, content).await?;

            if crawl_store.urls.len() >= self.page_limit {
                tracing::info!(group = %self.group_id, limit = self.page_limit, "Reached page limit");
                break;
            }

            let status = self.store.group_run(&self.group_id).await?.status;
            if status != GroupStatus::Processing {
                tracing::info!(group = %self.group_id, status = status.as_str(), "Run no longer processing, stopping");
                break;
            }
        }

        self.listener.on_complete(None).await?;
        Ok(ProcessOutcome {
            visited_keys: crawl_store.urls.keys().cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::RawPage;
    use crate::models::GroupRun;
    use crate::store::memory::InMemoryStore;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every hook invocation for assertions.
    #[derive(Default)]
    struct RecordingListener {
        store: Arc<InMemoryStore>,
        events: Mutex<Vec<String>>,
        completes: Mutex<u32>,
        /// Flip the group away from `processing` after this many pages.
        stop_after: Option<usize>,
        group_id: String,
    }

    #[async_trait]
    impl ProcessorListener for RecordingListener {
        async fn on_before_start(&self) -> Result<()> {
            let mut run = GroupRun::new(&self.group_id);
            run.status = GroupStatus::Processing;
            self.store.set_group_run(&run).await?;
            self.events.lock().unwrap().push("start".to_string());
            Ok(())
        }

        async fn on_content_available(&self, key: &str, content: KbContent) -> Result<()> {
            let tag = if content.error.is_some() { "err" } else { "ok" };
            let fetched = {
                let mut events = self.events.lock().unwrap();
                events.push(format!("{}:{}", tag, key));
                events.iter().filter(|e| e.starts_with("ok:")).count()
            };

            if let Some(stop_after) = self.stop_after {
                if fetched >= stop_after {
                    let mut run = self.store.group_run(&self.group_id).await?;
                    run.status = GroupStatus::Done;
                    self.store.set_group_run(&run).await?;
                }
            }
            Ok(())
        }

        async fn on_error(&self, key: &str, _error: &str) -> Result<()> {
            self.events.lock().unwrap().push(format!("err:{}", key));
            Ok(())
        }

        async fn on_complete(&self, _error: Option<String>) -> Result<()> {
            *self.completes.lock().unwrap() += 1;
            Ok(())
        }
    }

    struct SiteFetcher {
        pages: HashMap<String, RawPage>,
    }

    #[async_trait]
    impl PageFetcher for SiteFetcher {
        async fn fetch(&self, url: &str) -> Result<RawPage> {
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("dns failure: {}", url))
        }
    }

    fn page(html: &str) -> RawPage {
        RawPage {
            status: 200,
            html: html.to_string(),
        }
    }

    fn three_page_site() -> SiteFetcher {
        SiteFetcher {
            pages: HashMap::from([
                (
                    "https://example.com/".to_string(),
                    page(
                        r#"<html><head><title>Root</title></head><body>
                        <p>Root page content.</p>
                        <a href="/one">One</a>
                        <a href="/two">Two</a>
                        <a href="https://offsite.com/three">Three</a>
                        </body></html>"#,
                    ),
                ),
                (
                    "https://example.com/one".to_string(),
                    page("<html><head><title>One</title></head><body><p>Page one.</p></body></html>"),
                ),
                (
                    "https://example.com/two".to_string(),
                    page("<html><head><title>Two</title></head><body><p>Page two.</p></body></html>"),
                ),
            ]),
        }
    }

    fn make_processor(
        listener: Arc<RecordingListener>,
        store: Arc<InMemoryStore>,
        fetcher: SiteFetcher,
        page_limit: Option<usize>,
    ) -> WebProcessor {
        WebProcessor::new(
            listener,
            store,
            Arc::new(fetcher),
            "g1",
            "https://example.com/",
            CrawlOptions::default(),
            page_limit,
        )
    }

    #[tokio::test]
    async fn test_crawl_visits_same_origin_pages_in_discovery_order() {
        let store = Arc::new(InMemoryStore::new());
        let listener = Arc::new(RecordingListener {
            store: store.clone(),
            group_id: "g1".to_string(),
            ..Default::default()
        });

        let mut processor = make_processor(listener.clone(), store, three_page_site(), Some(5));
        processor.process().await.unwrap();

        let events = listener.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                "start",
                "ok:https://example.com/",
                "ok:https://example.com/one",
                "ok:https://example.com/two",
            ]
        );
        // Off-origin link never fetched, completion fired exactly once.
        assert!(!events.iter().any(|e| e.contains("offsite.com")));
        assert_eq!(*listener.completes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_page_limit_stops_crawl() {
        let store = Arc::new(InMemoryStore::new());
        let listener = Arc::new(RecordingListener {
            store: store.clone(),
            group_id: "g1".to_string(),
            ..Default::default()
        });

        let mut processor = make_processor(listener.clone(), store, three_page_site(), Some(1));
        processor.process().await.unwrap();

        let events = listener.events.lock().unwrap().clone();
        let fetched = events.iter().filter(|e| e.starts_with("ok:")).count();
        assert_eq!(fetched, 1);
        assert_eq!(*listener.completes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cooperative_cancellation() {
        let store = Arc::new(InMemoryStore::new());
        let listener = Arc::new(RecordingListener {
            store: store.clone(),
            group_id: "g1".to_string(),
            stop_after: Some(1),
            ..Default::default()
        });

        let mut processor = make_processor(listener.clone(), store, three_page_site(), Some(50));
        processor.process().await.unwrap();

        // Status flipped after the first page; the loop stops issuing new
        // fetches within one iteration and still completes exactly once.
        let events = listener.events.lock().unwrap().clone();
        let fetched = events.iter().filter(|e| e.starts_with("ok:")).count();
        assert_eq!(fetched, 1);
        assert_eq!(*listener.completes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_isolated() {
        let store = Arc::new(InMemoryStore::new());
        let listener = Arc::new(RecordingListener {
            store: store.clone(),
            group_id: "g1".to_string(),
            ..Default::default()
        });

        // Root links to a page the fetcher cannot resolve.
        let fetcher = SiteFetcher {
            pages: HashMap::from([
                (
                    "https://example.com/".to_string(),
                    page(
                        r#"<html><body><p>Root.</p>
                        <a href="/gone">Gone</a>
                        <a href="/ok">Ok</a>
                        </body></html>"#,
                    ),
                ),
                (
                    "https://example.com/ok".to_string(),
                    page("<html><body><p>Still fine.</p></body></html>"),
                ),
            ]),
        };

        let mut processor = make_processor(listener.clone(), store, fetcher, Some(10));
        processor.process().await.unwrap();

        let events = listener.events.lock().unwrap().clone();
        assert!(events.contains(&"err:https://example.com/gone".to_string()));
        assert!(events.contains(&"ok:https://example.com/ok".to_string()));
        assert_eq!(*listener.completes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scheme_coerced_for_bare_domain() {
        let store = Arc::new(InMemoryStore::new());
        let listener = Arc::new(RecordingListener {
            store: store.clone(),
            group_id: "g1".to_string(),
            ..Default::default()
        });

        let fetcher = SiteFetcher {
            pages: HashMap::from([(
                "https://example.com".to_string(),
                page("<html><body><p>Bare domain root.</p></body></html>"),
            )]),
        };

        let mut processor = WebProcessor::new(
            listener.clone(),
            store,
            Arc::new(fetcher),
            "g1",
            "example.com",
            CrawlOptions::default(),
            Some(5),
        );
        processor.process().await.unwrap();

        let events = listener.events.lock().unwrap().clone();
        assert!(events.contains(&"ok:https://example.com".to_string()));
    }
}

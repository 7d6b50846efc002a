//! Page fetching, readable-text extraction, and link discovery.
//!
//! One crawl run owns a [`CrawlStore`]: the insertion-ordered set of every
//! discovered key plus the per-key fetch results. [`fetch_with_links`]
//! fetches a single page, converts it to markdown, extracts and normalizes
//! outgoing links against the start origin, and queues the survivors of the
//! allow/skip filters. The page-by-page loop itself lives in the web
//! knowledge-group processor.
//!
//! Fetching goes through the [`PageFetcher`] trait so tests and non-HTTP
//! environments can substitute their own transport. The default
//! [`HttpFetcher`] is reqwest-based and static-only; a script-rendering
//! fallback can be plugged in for pages whose static text is below the
//! configured threshold.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use crate::dedup::OrderedSet;
use crate::models::MetaTag;

/// Raw transport result for one page fetch.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub status: u16,
    pub html: String,
}

/// Fetch strategy abstraction. `fetch` is the static strategy;
/// `fetch_dynamic` executes scripts (headless-browser-class) and is only
/// consulted as a fallback or when a group is configured to always load
/// dynamically.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<RawPage>;

    /// Default: dynamic fetching is not available.
    async fn fetch_dynamic(&self, url: &str, _scroll_selector: Option<&str>) -> Result<RawPage> {
        bail!("Dynamic fetch not configured for {}", url);
    }
}

/// Static HTTP fetcher with browser-like headers.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<RawPage> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Request failed for {}", url))?;

        let status = response.status().as_u16();
        let html = response
            .text()
            .await
            .with_context(|| format!("Failed to read body for {}", url))?;

        Ok(RawPage { status, html })
    }
}

/// Fetch result recorded against one key in the crawl store.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub markdown: String,
    pub title: Option<String>,
    pub meta_tags: Vec<MetaTag>,
    pub error: Option<String>,
}

/// Ephemeral per-run crawl state: every discovered key in first-seen
/// order, and the fetch result for each key already visited. Discarded
/// wholesale when the run ends.
#[derive(Debug, Default)]
pub struct CrawlStore {
    pub urls: HashMap<String, PageResult>,
    pub url_set: OrderedSet,
}

impl CrawlStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys queued but not yet fetched, in insertion order.
    pub fn not_fetched(&self) -> Vec<String> {
        self.url_set
            .values()
            .iter()
            .filter(|url| !self.urls.contains_key(*url))
            .cloned()
            .collect()
    }
}

/// Filter configuration for one crawl run.
#[derive(Debug, Default, Clone)]
pub struct CrawlOptions {
    /// Only queue links matching this regex.
    pub allow_only: Option<Regex>,
    /// Never queue links matching any of these.
    pub skip: Vec<Regex>,
    /// Comma-separated CSS selectors removed before text extraction.
    pub remove_html_tags: Option<String>,
    /// Static text shorter than this re-fetches with the dynamic strategy.
    pub dynamic_fallback_content_length: Option<usize>,
    /// Always use the dynamic strategy.
    pub load_dynamically: bool,
    pub scroll_selector: Option<String>,
    /// Treat 404 responses as content instead of an error.
    pub include_404: bool,
}

/// Coerce scheme-less locators to https.
pub fn clean_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Normalize an outgoing link against the page it was found on: resolve
/// relative references, keep http(s) on the start origin only, drop the
/// fragment and query, and trim the trailing slash so duplicates collapse
/// to one key.
pub fn normalize_link(base: &Url, origin: &Url, href: &str) -> Option<String> {
    let mut resolved = base.join(href).ok()?;

    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    if resolved.host_str() != origin.host_str() || resolved.port() != origin.port() {
        return None;
    }

    resolved.set_fragment(None);
    resolved.set_query(None);

    let path = resolved.path().trim_end_matches('/').to_string();
    resolved.set_path(if path.is_empty() { "/" } else { &path });

    Some(resolved.to_string())
}

fn parse_selector_list(selectors: &str) -> Vec<Selector> {
    selectors
        .split(',')
        .filter_map(|s| Selector::parse(s.trim()).ok())
        .collect()
}

/// Remove configured elements plus script/style noise from an HTML string.
fn strip_unwanted(html: &str, remove_html_tags: Option<&str>) -> String {
    let document = Html::parse_document(html);
    let mut result = html.to_string();

    let mut selectors: Vec<Selector> = parse_selector_list("script, style, noscript, iframe");
    if let Some(extra) = remove_html_tags {
        selectors.extend(parse_selector_list(extra));
    }

    for selector in &selectors {
        for element in document.select(selector) {
            let element_html = element.html();
            result = result.replace(&element_html, "");
        }
    }

    result
}

fn extract_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn extract_meta_tags(document: &Html) -> Vec<MetaTag> {
    let selector = match Selector::parse("meta[name][content], meta[property][content]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    document
        .select(&selector)
        .filter_map(|el| {
            let key = el
                .value()
                .attr("name")
                .or_else(|| el.value().attr("property"))?;
            let value = el.value().attr("content")?;
            Some(MetaTag {
                key: key.to_string(),
                value: value.to_string(),
            })
        })
        .collect()
}

fn extract_links(document: &Html, base: &Url, origin: &Url) -> Vec<String> {
    let selector = match Selector::parse("a[href]") {
        Ok(s) => s,
        Err(_) => return Vec::new(),
    };

    document
        .select(&selector)
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| normalize_link(base, origin, href))
        .collect()
}

fn html_to_markdown(html: &str) -> String {
    htmd::convert(html).unwrap_or_else(|_| {
        let document = Html::parse_document(html);
        document.root_element().text().collect::<String>()
    })
}

fn link_allowed(link: &str, options: &CrawlOptions) -> bool {
    if let Some(allow) = &options.allow_only {
        if !allow.is_match(link) {
            return false;
        }
    }
    !options.skip.iter().any(|re| re.is_match(link))
}

/// Extracted content of one fetched page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub markdown: String,
    pub title: Option<String>,
    pub meta_tags: Vec<MetaTag>,
}

/// Fetch one page, record its result in the store, and queue newly
/// discovered same-origin links that pass the filters.
///
/// A fetch error is returned to the caller but the store entry is still
/// written (with the error recorded) so the key counts as visited and the
/// run proceeds to the next one.
pub async fn fetch_with_links(
    fetcher: &dyn PageFetcher,
    url: &str,
    store: &mut CrawlStore,
    origin_url: &str,
    options: &CrawlOptions,
) -> Result<FetchedPage> {
    let fetched = fetch_page(fetcher, url, options).await;

    match fetched {
        Ok((page, document_html)) => {
            let base = Url::parse(url).with_context(|| format!("Invalid URL: {}", url))?;
            let origin =
                Url::parse(origin_url).with_context(|| format!("Invalid origin: {}", origin_url))?;

            let document = Html::parse_document(&document_html);
            for link in extract_links(&document, &base, &origin) {
                if link_allowed(&link, options) {
                    store.url_set.add(link);
                }
            }

            store.urls.insert(
                url.to_string(),
                PageResult {
                    markdown: page.markdown.clone(),
                    title: page.title.clone(),
                    meta_tags: page.meta_tags.clone(),
                    error: None,
                },
            );

            Ok(page)
        }
        Err(e) => {
            store.urls.insert(
                url.to_string(),
                PageResult {
                    markdown: String::new(),
                    title: None,
                    meta_tags: Vec::new(),
                    error: Some(e.to_string()),
                },
            );
            Err(e)
        }
    }
}

/// Fetch and extract one page. Returns the extracted content plus the raw
/// HTML used for link discovery.
async fn fetch_page(
    fetcher: &dyn PageFetcher,
    url: &str,
    options: &CrawlOptions,
) -> Result<(FetchedPage, String)> {
    let mut raw = if options.load_dynamically {
        fetcher
            .fetch_dynamic(url, options.scroll_selector.as_deref())
            .await?
    } else {
        fetcher.fetch(url).await?
    };

    if raw.status == 404 && !options.include_404 {
        bail!("404 Not Found: {}", url);
    }
    if raw.status >= 400 && raw.status != 404 {
        bail!("HTTP {} for {}", raw.status, url);
    }

    let mut page = extract_page(&raw.html, options);

    // Too little static content: this page likely renders with scripts.
    if !options.load_dynamically {
        if let Some(threshold) = options.dynamic_fallback_content_length {
            if page.markdown.len() < threshold {
                tracing::debug!(url = %url, len = page.markdown.len(), "Static content below threshold, trying dynamic fetch");
                if let Ok(dynamic) = fetcher
                    .fetch_dynamic(url, options.scroll_selector.as_deref())
                    .await
                {
                    raw = dynamic;
                    page = extract_page(&raw.html, options);
                }
            }
        }
    }

    Ok((page, raw.html))
}

fn extract_page(html: &str, options: &CrawlOptions) -> FetchedPage {
    let document = Html::parse_document(html);
    let title = extract_title(&document);
    let meta_tags = extract_meta_tags(&document);

    let cleaned = strip_unwanted(html, options.remove_html_tags.as_deref());
    let markdown = html_to_markdown(&cleaned);

    FetchedPage {
        markdown: markdown.trim().to_string(),
        title,
        meta_tags,
    }
}

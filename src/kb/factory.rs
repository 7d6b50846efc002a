//! Processor construction.
//!
//! Maps a group's [`SourceKind`] to the processor implementing its fetch
//! strategy. The match is exhaustive; adding a source kind fails to
//! compile until it is handled here.

use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::GroupConfig;
use crate::crawl::{CrawlOptions, PageFetcher};
use crate::kb::adapter::AdapterProcessor;
use crate::kb::github::{repo_crawl_options, GithubIssuesAdapter};
use crate::kb::upload::UploadProcessor;
use crate::kb::video::TranscriptAdapter;
use crate::kb::web::WebProcessor;
use crate::kb::{FetchAdapter, KbProcessor, ProcessorListener};
use crate::models::SourceKind;
use crate::store::MetaStore;

/// Shared collaborators every processor needs.
pub struct ProcessorDeps {
    pub listener: Arc<dyn ProcessorListener>,
    pub store: Arc<dyn MetaStore>,
    pub fetcher: Arc<dyn PageFetcher>,
}

/// Crawl filter options shared by the web-crawling kinds.
fn crawl_options(group: &GroupConfig, allow_only: Option<Regex>) -> Result<CrawlOptions> {
    let skip = match &group.skip_page_regex {
        Some(raw) => raw
            .split(',')
            .map(|r| Regex::new(r.trim()).with_context(|| format!("Invalid skip regex: {}", r)))
            .collect::<Result<Vec<_>>>()?,
        None => Vec::new(),
    };

    Ok(CrawlOptions {
        allow_only,
        skip,
        remove_html_tags: group.remove_html_tags.clone(),
        dynamic_fallback_content_length: group.static_content_threshold,
        load_dynamically: group.load_dynamically,
        scroll_selector: group.scroll_selector.clone(),
        include_404: group.include_404,
    })
}

/// Allow-prefix regex for `match_prefix` groups.
fn prefix_regex(url: &str) -> Result<Regex> {
    let trimmed = url.trim_end_matches('/');
    Regex::new(&format!("^{}.*", regex::escape(trimmed))).context("Invalid group URL for prefix filter")
}

/// Build the processor for one knowledge group.
///
/// `external_adapter` supplies the fetch adapter for wiki-style services,
/// whose auth and pagination live outside the core.
pub fn make_processor(
    deps: ProcessorDeps,
    group_id: &str,
    group: &GroupConfig,
    kind: SourceKind,
    external_adapter: Option<Arc<dyn FetchAdapter>>,
) -> Result<Box<dyn KbProcessor>> {
    match kind {
        SourceKind::Web { url } => {
            let allow = if group.match_prefix {
                Some(prefix_regex(&url)?)
            } else {
                None
            };
            let options = crawl_options(group, allow)?;

            Ok(Box::new(WebProcessor::new(
                deps.listener,
                deps.store,
                deps.fetcher,
                group_id,
                &url,
                options,
                group.page_limit,
            )))
        }

        SourceKind::GithubRepo { url, branch } => {
            let (start_url, repo_options) = repo_crawl_options(&url, &branch)?;
            let mut options = crawl_options(group, repo_options.allow_only)?;
            // The file-view chrome selectors are fixed for the GitHub UI;
            // group-level removals are appended.
            options.remove_html_tags = match (repo_options.remove_html_tags, options.remove_html_tags)
            {
                (Some(fixed), Some(extra)) => Some(format!("{}, {}", fixed, extra)),
                (Some(fixed), None) => Some(fixed),
                (None, extra) => extra,
            };

            Ok(Box::new(WebProcessor::new(
                deps.listener,
                deps.store,
                deps.fetcher,
                group_id,
                &start_url,
                options,
                group.page_limit,
            )))
        }

        SourceKind::GithubIssues { repo } => {
            let adapter: Arc<dyn FetchAdapter> = Arc::new(GithubIssuesAdapter::new(&repo)?);
            Ok(Box::new(AdapterProcessor::new(
                deps.listener,
                deps.store,
                adapter,
                group_id,
                group.page_limit,
            )))
        }

        SourceKind::Upload { title, text } => {
            Ok(Box::new(UploadProcessor::new(deps.listener, &title, &text)))
        }

        SourceKind::Video { url } => {
            let adapter: Arc<dyn FetchAdapter> = Arc::new(TranscriptAdapter::new(&url)?);
            Ok(Box::new(AdapterProcessor::new(
                deps.listener,
                deps.store,
                adapter,
                group_id,
                group.page_limit,
            )))
        }

        SourceKind::Wiki { url } => {
            let adapter = external_adapter
                .ok_or_else(|| anyhow::anyhow!("Wiki group '{}' requires a fetch adapter", url))?;
            Ok(Box::new(AdapterProcessor::new(
                deps.listener,
                deps.store,
                adapter,
                group_id,
                group.page_limit,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_regex_matches_subpaths_only() {
        let re = prefix_regex("https://docs.example.com/guide/").unwrap();
        assert!(re.is_match("https://docs.example.com/guide/intro"));
        assert!(re.is_match("https://docs.example.com/guide"));
        assert!(!re.is_match("https://docs.example.com/blog/post"));
    }

    #[test]
    fn test_skip_regex_list_parsed_from_commas() {
        let group = GroupConfig {
            kind: "web".to_string(),
            url: Some("https://e.com".to_string()),
            branch: None,
            match_prefix: false,
            skip_page_regex: Some(r".*/archive/.*, .*\.pdf$".to_string()),
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
        let options = crawl_options(&group, None).unwrap();
        assert_eq!(options.skip.len(), 2);
        assert!(options.skip[0].is_match("https://e.com/archive/2020"));
        assert!(options.skip[1].is_match("https://e.com/file.pdf"));
    }

    #[test]
    fn test_bad_skip_regex_is_an_error() {
        let group = GroupConfig {
            kind: "web".to_string(),
            url: Some("https://e.com".to_string()),
            branch: None,
            match_prefix: false,
            skip_page_regex: Some("([unclosed".to_string()),
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
        assert!(crawl_options(&group, None).is_err());
    }
}

//! GitHub source kinds.
//!
//! Repository groups are a specialization of the web crawl: the start URL
//! is the branch tree view, link discovery is restricted to tree/blob
//! pages of that branch, and the file-listing chrome is stripped before
//! text extraction. Issue groups use a [`FetchAdapter`] over the REST
//! API, one issue per logical key, comments folded into the body.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;

use crate::crawl::CrawlOptions;
use crate::kb::{FetchAdapter, KbContent};

/// Selectors for GitHub's code-view chrome that would otherwise pollute
/// extracted text.
const REPO_REMOVE_SELECTORS: &str = ".react-line-number, #repos-file-tree";

/// Crawl options for a repository group: start at the branch tree and
/// never leave it.
pub fn repo_crawl_options(repo_url: &str, branch: &str) -> Result<(String, CrawlOptions)> {
    let trimmed = repo_url.trim_end_matches('/');
    let start_url = format!("{}/tree/{}", trimmed, branch);

    let allow = Regex::new(&format!(
        "^{}/(tree|blob)/{}.*",
        regex::escape(trimmed),
        regex::escape(branch)
    ))
    .context("Invalid repository URL for allow filter")?;

    Ok((
        start_url,
        CrawlOptions {
            allow_only: Some(allow),
            remove_html_tags: Some(REPO_REMOVE_SELECTORS.to_string()),
            ..Default::default()
        },
    ))
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Issue {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    html_url: String,
    #[serde(default)]
    comments: u64,
    state: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct Comment {
    #[serde(default)]
    body: Option<String>,
    user: CommentUser,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct CommentUser {
    login: String,
}

/// Issue-tracker adapter over the GitHub REST API.
///
/// Keys are issue HTML URLs. Listing caches the fetched issues so each
/// `fetch` only has to pull the comment thread.
pub struct GithubIssuesAdapter {
    client: reqwest::Client,
    /// `owner/name`, parsed from the configured repository locator.
    repo: String,
    issues: Mutex<HashMap<String, Issue>>,
}

impl GithubIssuesAdapter {
    pub fn new(repo_locator: &str) -> Result<Self> {
        let repo = parse_repo(repo_locator)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("ragbase")
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            repo,
            issues: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let mut request = self.client.get(url).header("Accept", "application/vnd.github+json");
        if let Ok(token) = std::env::var("GITHUB_TOKEN") {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.with_context(|| format!("Request failed: {}", url))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("GitHub API error {}: {}", status, body);
        }
        response.json().await.context("Invalid JSON from GitHub API")
    }
}

/// Accept both `owner/name` and full `https://github.com/owner/name` forms.
fn parse_repo(locator: &str) -> Result<String> {
    let trimmed = locator
        .trim_end_matches('/')
        .trim_start_matches("https://github.com/")
        .trim_start_matches("http://github.com/");

    let parts: Vec<&str> = trimmed.split('/').filter(|p| !p.is_empty()).collect();
    if parts.len() != 2 {
        bail!("Invalid GitHub repository locator: {}", locator);
    }
    Ok(format!("{}/{}", parts[0], parts[1]))
}

#[async_trait]
impl FetchAdapter for GithubIssuesAdapter {
    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut page = 1u32;

        loop {
            let url = format!(
                "https://api.github.com/repos/{}/issues?state=all&per_page=100&page={}",
                self.repo, page
            );
            let json = self.get_json(&url).await?;
            let issues: Vec<Issue> = serde_json::from_value(json)
                .context("Unexpected issue list shape from GitHub API")?;

            if issues.is_empty() {
                break;
            }

            let mut cache = self.issues.lock().unwrap();
            for issue in issues {
                keys.push(issue.html_url.clone());
                cache.insert(issue.html_url.clone(), issue);
            }
            drop(cache);

            page += 1;
        }

        Ok(keys)
    }

    async fn fetch(&self, key: &str) -> Result<KbContent> {
        let issue = self
            .issues
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown issue key: {}", key))?;

        let mut parts: Vec<String> = Vec::new();
        parts.push(format!(
            "# {}\n\n{}",
            issue.title,
            issue.body.clone().unwrap_or_default()
        ));

        if issue.comments > 0 {
            let url = format!(
                "https://api.github.com/repos/{}/issues/{}/comments?per_page=100",
                self.repo, issue.number
            );
            let json = self.get_json(&url).await?;
            let comments: Vec<Comment> = serde_json::from_value(json)
                .context("Unexpected comment list shape from GitHub API")?;

            if !comments.is_empty() {
                let rendered: Vec<String> = comments
                    .iter()
                    .map(|c| format!("{}: {}", c.user.login, c.body.clone().unwrap_or_default()))
                    .collect();
                parts.push(format!("### Comments\n{}", rendered.join("\n\n")));
            }
        }

        parts.push(format!("Status: {}", issue.state));

        Ok(KbContent {
            title: Some(issue.title.clone()),
            text: parts.join("\n\n"),
            ..Default::default()
        })
    }
}

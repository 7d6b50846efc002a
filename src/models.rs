//! Core data models used throughout ragbase.
//!
//! These types represent the knowledge items, passages, and source links
//! that flow through the ingestion and answering pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::GroupConfig;

/// Lifecycle status of one ingested knowledge item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ItemStatus::Pending),
            "completed" => Some(ItemStatus::Completed),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }
}

/// A `<meta>` tag captured from a fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaTag {
    pub key: String,
    pub value: String,
}

/// One fetched/ingested unit of a knowledge group.
///
/// Identity is `(group_id, key)`. Re-fetching the same key updates the
/// existing item; the previously embedded chunk ids are deleted from the
/// index before new ones are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    pub group_id: String,
    /// URL or logical key within the source.
    pub key: String,
    pub title: Option<String>,
    /// Full normalized markdown text.
    pub markdown: String,
    pub meta_tags: Vec<MetaTag>,
    /// Index record ids embedded for this item, in chunk order.
    pub chunk_ids: Vec<String>,
    pub status: ItemStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Run state of a knowledge group.
///
/// `Processing -> Done | Error` are the only forward transitions;
/// `Done`/`Error` re-arm to `Processing` on refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Processing => "processing",
            GroupStatus::Done => "done",
            GroupStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(GroupStatus::Pending),
            "processing" => Some(GroupStatus::Processing),
            "done" => Some(GroupStatus::Done),
            "error" => Some(GroupStatus::Error),
            _ => None,
        }
    }
}

/// Persisted run record for one knowledge group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRun {
    pub group_id: String,
    pub status: GroupStatus,
    /// Identifier of the active run; gates concurrent triggers.
    pub run_id: Option<String>,
    pub fetch_error: Option<String>,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub next_update_at: Option<DateTime<Utc>>,
}

impl GroupRun {
    pub fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            status: GroupStatus::Pending,
            run_id: None,
            fetch_error: None,
            last_updated_at: None,
            next_update_at: None,
        }
    }
}

/// A document handed to the vector index for embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Record id, unique within the collection. Upserts overwrite.
    pub id: String,
    pub text: String,
    /// Originating page URL or logical key.
    pub url: String,
}

/// A reranked passage returned from retrieval.
///
/// `fetch_id` is a fresh correlation id minted per result per turn; the
/// model cites it inline as `!!<fetch_id>!!` and the citation extractor
/// resolves it back to a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankedPassage {
    /// Index record id of the matched chunk.
    pub id: String,
    pub content: String,
    pub url: Option<String>,
    pub score: f64,
    pub item_id: Option<String>,
    pub fetch_id: String,
    pub query: String,
}

/// A resolved citation source attached to a final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceLink {
    pub url: Option<String>,
    pub title: Option<String>,
    pub score: f64,
    pub item_id: Option<String>,
    pub fetch_id: Option<String>,
    pub group_id: Option<String>,
    pub search_query: Option<String>,
}

/// Source kind of a knowledge group, carrying only the configuration each
/// kind actually reads. Constructed from the raw [`GroupConfig`] and
/// matched exhaustively when building the processor.
#[derive(Debug, Clone)]
pub enum SourceKind {
    Web {
        url: String,
    },
    GithubRepo {
        url: String,
        branch: String,
    },
    GithubIssues {
        repo: String,
    },
    Upload {
        title: String,
        text: String,
    },
    Video {
        url: String,
    },
    Wiki {
        url: String,
    },
}

impl SourceKind {
    /// Build the source kind from a parsed group config.
    ///
    /// `upload_text` supplies the body for `upload` groups, which arrives
    /// out of band (API payload or file read) rather than from the config.
    pub fn from_group(
        group: &GroupConfig,
        upload_text: Option<(String, String)>,
    ) -> anyhow::Result<Self> {
        let url = || {
            group
                .url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("group url is required"))
        };

        match group.kind.as_str() {
            "web" => Ok(SourceKind::Web { url: url()? }),
            "github-repo" => Ok(SourceKind::GithubRepo {
                url: url()?,
                branch: group.branch.clone().unwrap_or_else(|| "main".to_string()),
            }),
            "github-issues" => Ok(SourceKind::GithubIssues { repo: url()? }),
            "upload" => {
                let (title, text) = upload_text
                    .ok_or_else(|| anyhow::anyhow!("upload groups require an uploaded document"))?;
                Ok(SourceKind::Upload { title, text })
            }
            "video" => Ok(SourceKind::Video { url: url()? }),
            "wiki" => Ok(SourceKind::Wiki { url: url()? }),
            other => anyhow::bail!("Unsupported knowledge group kind: {}", other),
        }
    }
}

//! Metadata store abstraction.
//!
//! The [`MetaStore`] trait is the CRUD contract the core has with the
//! relational metadata collaborator: knowledge items, group run state, and
//! persisted answers. The core does not own schema evolution beyond the
//! fields it reads and writes here.
//!
//! Implementations: SQLite ([`sqlite::SqliteStore`]) for deployments and
//! an in-memory double ([`memory::InMemoryStore`]) for tests.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{GroupRun, GroupStatus, KnowledgeItem, SourceLink};

/// A persisted answer with its resolved citation sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub id: String,
    pub group_id: String,
    pub query: String,
    pub content: String,
    pub credits_used: u32,
    pub sources: Vec<SourceLink>,
    pub created_at: DateTime<Utc>,
}

/// Abstract metadata store.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Insert or update an item keyed by `(group_id, key)`. Returns the
    /// stored item id (existing id wins over the caller's on update).
    async fn upsert_item(&self, item: &KnowledgeItem) -> Result<String>;

    async fn find_item(&self, group_id: &str, key: &str) -> Result<Option<KnowledgeItem>>;

    /// Resolve the item that owns an embedded chunk record.
    async fn find_item_by_chunk_id(&self, chunk_id: &str) -> Result<Option<KnowledgeItem>>;

    async fn list_items(&self, group_id: &str) -> Result<Vec<KnowledgeItem>>;

    async fn delete_item(&self, group_id: &str, key: &str) -> Result<()>;

    /// Delete all items of a group (source removal cascade).
    async fn delete_items(&self, group_id: &str) -> Result<()>;

    /// Completed pages across every group of this tenant, for quota checks.
    async fn completed_pages_count(&self) -> Result<i64>;

    /// Current run record of a group; a fresh `pending` record if none.
    async fn group_run(&self, group_id: &str) -> Result<GroupRun>;

    async fn set_group_run(&self, run: &GroupRun) -> Result<()>;

    async fn save_answer(&self, answer: &AnswerRecord) -> Result<()>;
}

/// Convenience: current status of a group.
pub async fn group_status(store: &dyn MetaStore, group_id: &str) -> Result<GroupStatus> {
    Ok(store.group_run(group_id).await?.status)
}

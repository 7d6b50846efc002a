//! In-memory [`MetaStore`] implementation for tests.
//!
//! `HashMap`s behind `std::sync::RwLock`; chunk-id resolution is a linear
//! scan, which is fine at test scale.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{GroupRun, ItemStatus, KnowledgeItem};

use super::{AnswerRecord, MetaStore};

/// In-memory metadata store.
#[derive(Default)]
pub struct InMemoryStore {
    items: RwLock<HashMap<(String, String), KnowledgeItem>>,
    runs: RwLock<HashMap<String, GroupRun>>,
    answers: RwLock<Vec<AnswerRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All persisted answers, for assertions.
    pub fn answers(&self) -> Vec<AnswerRecord> {
        self.answers.read().unwrap().clone()
    }
}

#[async_trait]
impl MetaStore for InMemoryStore {
    async fn upsert_item(&self, item: &KnowledgeItem) -> Result<String> {
        let mut items = self.items.write().unwrap();
        let key = (item.group_id.clone(), item.key.clone());

        let id = items
            .get(&key)
            .map(|existing| existing.id.clone())
            .unwrap_or_else(|| {
                if item.id.is_empty() {
                    Uuid::new_v4().to_string()
                } else {
                    item.id.clone()
                }
            });

        let mut stored = item.clone();
        stored.id = id.clone();
        items.insert(key, stored);
        Ok(id)
    }

    async fn find_item(&self, group_id: &str, key: &str) -> Result<Option<KnowledgeItem>> {
        let items = self.items.read().unwrap();
        Ok(items
            .get(&(group_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn find_item_by_chunk_id(&self, chunk_id: &str) -> Result<Option<KnowledgeItem>> {
        let items = self.items.read().unwrap();
        Ok(items
            .values()
            .find(|item| item.chunk_ids.iter().any(|id| id == chunk_id))
            .cloned())
    }

    async fn list_items(&self, group_id: &str) -> Result<Vec<KnowledgeItem>> {
        let items = self.items.read().unwrap();
        let mut result: Vec<KnowledgeItem> = items
            .values()
            .filter(|item| item.group_id == group_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(result)
    }

    async fn delete_item(&self, group_id: &str, key: &str) -> Result<()> {
        self.items
            .write()
            .unwrap()
            .remove(&(group_id.to_string(), key.to_string()));
        Ok(())
    }

    async fn delete_items(&self, group_id: &str) -> Result<()> {
        self.items
            .write()
            .unwrap()
            .retain(|(group, _), _| group != group_id);
        Ok(())
    }

    async fn completed_pages_count(&self) -> Result<i64> {
        let items = self.items.read().unwrap();
        Ok(items
            .values()
            .filter(|item| item.status == ItemStatus::Completed)
            .count() as i64)
    }

    async fn group_run(&self, group_id: &str) -> Result<GroupRun> {
        let runs = self.runs.read().unwrap();
        Ok(runs
            .get(group_id)
            .cloned()
            .unwrap_or_else(|| GroupRun::new(group_id)))
    }

    async fn set_group_run(&self, run: &GroupRun) -> Result<()> {
        self.runs
            .write()
            .unwrap()
            .insert(run.group_id.clone(), run.clone());
        Ok(())
    }

    async fn save_answer(&self, answer: &AnswerRecord) -> Result<()> {
        self.answers.write().unwrap().push(answer.clone());
        Ok(())
    }
}

//! SQLite [`MetaStore`] implementation.
//!
//! Items are keyed by `(group_id, key)` with `ON CONFLICT` upserts; the
//! embedded chunk ids live in a child table so chunk-id resolution is a
//! single lookup. All writes that span both tables run in a transaction.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{GroupRun, GroupStatus, ItemStatus, KnowledgeItem, MetaTag};

use super::{AnswerRecord, MetaStore};

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn load_chunk_ids(&self, item_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT chunk_id FROM item_chunks WHERE item_id = ? ORDER BY chunk_index",
        )
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("chunk_id")).collect())
    }

    async fn row_to_item(&self, row: &sqlx::sqlite::SqliteRow) -> Result<KnowledgeItem> {
        let id: String = row.get("id");
        let meta_tags_json: String = row.get("meta_tags_json");
        let meta_tags: Vec<MetaTag> = serde_json::from_str(&meta_tags_json).unwrap_or_default();
        let status: String = row.get("status");
        let updated_at: i64 = row.get("updated_at");

        Ok(KnowledgeItem {
            chunk_ids: self.load_chunk_ids(&id).await?,
            id,
            group_id: row.get("group_id"),
            key: row.get("key"),
            title: row.get("title"),
            markdown: row.get("markdown"),
            meta_tags,
            status: ItemStatus::parse(&status).unwrap_or(ItemStatus::Pending),
            error: row.get("error"),
            updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_else(Utc::now),
        })
    }
}

#[async_trait]
impl MetaStore for SqliteStore {
    async fn upsert_item(&self, item: &KnowledgeItem) -> Result<String> {
        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM items WHERE group_id = ? AND key = ?")
                .bind(&item.group_id)
                .bind(&item.key)
                .fetch_optional(&self.pool)
                .await?;

        let item_id = existing_id.unwrap_or_else(|| {
            if item.id.is_empty() {
                Uuid::new_v4().to_string()
            } else {
                item.id.clone()
            }
        });

        let meta_tags_json = serde_json::to_string(&item.meta_tags)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO items (id, group_id, key, title, markdown, meta_tags_json, status, error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(group_id, key) DO UPDATE SET
                title = excluded.title,
                markdown = excluded.markdown,
                meta_tags_json = excluded.meta_tags_json,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&item_id)
        .bind(&item.group_id)
        .bind(&item.key)
        .bind(&item.title)
        .bind(&item.markdown)
        .bind(&meta_tags_json)
        .bind(item.status.as_str())
        .bind(&item.error)
        .bind(item.updated_at.timestamp())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM item_chunks WHERE item_id = ?")
            .bind(&item_id)
            .execute(&mut *tx)
            .await?;

        for (index, chunk_id) in item.chunk_ids.iter().enumerate() {
            sqlx::query(
                "INSERT INTO item_chunks (chunk_id, item_id, chunk_index) VALUES (?, ?, ?)",
            )
            .bind(chunk_id)
            .bind(&item_id)
            .bind(index as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(item_id)
    }

    async fn find_item(&self, group_id: &str, key: &str) -> Result<Option<KnowledgeItem>> {
        let row = sqlx::query("SELECT * FROM items WHERE group_id = ? AND key = ?")
            .bind(group_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_item(&row).await?)),
            None => Ok(None),
        }
    }

    async fn find_item_by_chunk_id(&self, chunk_id: &str) -> Result<Option<KnowledgeItem>> {
        let row = sqlx::query(
            r#"
            SELECT items.* FROM items
            JOIN item_chunks ON item_chunks.item_id = items.id
            WHERE item_chunks.chunk_id = ?
            "#,
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.row_to_item(&row).await?)),
            None => Ok(None),
        }
    }

    async fn list_items(&self, group_id: &str) -> Result<Vec<KnowledgeItem>> {
        let rows = sqlx::query("SELECT * FROM items WHERE group_id = ? ORDER BY key")
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(self.row_to_item(row).await?);
        }
        Ok(items)
    }

    async fn delete_item(&self, group_id: &str, key: &str) -> Result<()> {
        let existing_id: Option<String> =
            sqlx::query_scalar("SELECT id FROM items WHERE group_id = ? AND key = ?")
                .bind(group_id)
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        if let Some(id) = existing_id {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM item_chunks WHERE item_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM items WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    async fn delete_items(&self, group_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM item_chunks WHERE item_id IN (SELECT id FROM items WHERE group_id = ?)",
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM items WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn completed_pages_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE status = 'completed'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn group_run(&self, group_id: &str) -> Result<GroupRun> {
        let row = sqlx::query("SELECT * FROM group_runs WHERE group_id = ?")
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(GroupRun::new(group_id));
        };

        let status: String = row.get("status");
        let last_updated_at: Option<i64> = row.get("last_updated_at");
        let next_update_at: Option<i64> = row.get("next_update_at");

        Ok(GroupRun {
            group_id: row.get("group_id"),
            status: GroupStatus::parse(&status).unwrap_or(GroupStatus::Pending),
            run_id: row.get("run_id"),
            fetch_error: row.get("fetch_error"),
            last_updated_at: last_updated_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            next_update_at: next_update_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        })
    }

    async fn set_group_run(&self, run: &GroupRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO group_runs (group_id, status, run_id, fetch_error, last_updated_at, next_update_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(group_id) DO UPDATE SET
                status = excluded.status,
                run_id = excluded.run_id,
                fetch_error = excluded.fetch_error,
                last_updated_at = excluded.last_updated_at,
                next_update_at = excluded.next_update_at
            "#,
        )
        .bind(&run.group_id)
        .bind(run.status.as_str())
        .bind(&run.run_id)
        .bind(&run.fetch_error)
        .bind(run.last_updated_at.map(|dt| dt.timestamp()))
        .bind(run.next_update_at.map(|dt| dt.timestamp()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_answer(&self, answer: &AnswerRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO answers (id, group_id, query, content, credits_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&answer.id)
        .bind(&answer.group_id)
        .bind(&answer.query)
        .bind(&answer.content)
        .bind(answer.credits_used as i64)
        .bind(answer.created_at.timestamp())
        .execute(&mut *tx)
        .await?;

        for (position, source) in answer.sources.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO answer_sources (answer_id, position, url, title, score, item_id, fetch_id, search_query)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&answer.id)
            .bind(position as i64)
            .bind(&source.url)
            .bind(&source.title)
            .bind(source.score)
            .bind(&source.item_id)
            .bind(&source.fetch_id)
            .bind(&source.search_query)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DbConfig};
    use crate::models::SourceLink;
    use crate::migrate;
    use std::collections::BTreeMap;

    async fn setup() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            db: DbConfig {
                path: dir.path().join("test.sqlite"),
            },
            chunking: Default::default(),
            retrieval: Default::default(),
            embedding: Default::default(),
            indexer: Default::default(),
            llm: Default::default(),
            quota: Default::default(),
            server: Default::default(),
            groups: BTreeMap::new(),
        };
        let pool = crate::db::connect(&config).await.unwrap();
        migrate::apply_schema(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn item(group: &str, key: &str, chunk_ids: Vec<String>) -> KnowledgeItem {
        KnowledgeItem {
            id: String::new(),
            group_id: group.to_string(),
            key: key.to_string(),
            title: Some("Title".to_string()),
            markdown: "# Title\nBody".to_string(),
            meta_tags: vec![MetaTag {
                key: "description".to_string(),
                value: "desc".to_string(),
            }],
            chunk_ids,
            status: ItemStatus::Completed,
            error: None,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_item_roundtrip_with_chunks() {
        let (_dir, store) = setup().await;
        let chunk_ids = vec!["g1/c1".to_string(), "g1/c2".to_string()];
        store
            .upsert_item(&item("g1", "https://e.com/a", chunk_ids.clone()))
            .await
            .unwrap();

        let loaded = store.find_item("g1", "https://e.com/a").await.unwrap().unwrap();
        assert_eq!(loaded.chunk_ids, chunk_ids);
        assert_eq!(loaded.status, ItemStatus::Completed);
        assert_eq!(loaded.meta_tags.len(), 1);
    }

    #[tokio::test]
    async fn test_reupsert_replaces_chunk_rows() {
        let (_dir, store) = setup().await;
        let id1 = store
            .upsert_item(&item("g1", "k", vec!["g1/old".to_string()]))
            .await
            .unwrap();
        let id2 = store
            .upsert_item(&item("g1", "k", vec!["g1/new-1".to_string(), "g1/new-2".to_string()]))
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let loaded = store.find_item("g1", "k").await.unwrap().unwrap();
        assert_eq!(loaded.chunk_ids, vec!["g1/new-1", "g1/new-2"]);
        assert!(store.find_item_by_chunk_id("g1/old").await.unwrap().is_none());
        assert!(store
            .find_item_by_chunk_id("g1/new-2")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_group_run_roundtrip() {
        let (_dir, store) = setup().await;

        let fresh = store.group_run("g1").await.unwrap();
        assert_eq!(fresh.status, GroupStatus::Pending);

        let mut run = GroupRun::new("g1");
        run.status = GroupStatus::Processing;
        run.run_id = Some("run-1".to_string());
        store.set_group_run(&run).await.unwrap();

        let loaded = store.group_run("g1").await.unwrap();
        assert_eq!(loaded.status, GroupStatus::Processing);
        assert_eq!(loaded.run_id.as_deref(), Some("run-1"));
    }

    #[tokio::test]
    async fn test_delete_items_cascades_chunks() {
        let (_dir, store) = setup().await;
        store
            .upsert_item(&item("g1", "a", vec!["g1/a-0".to_string()]))
            .await
            .unwrap();
        store
            .upsert_item(&item("g1", "b", vec!["g1/b-0".to_string()]))
            .await
            .unwrap();

        store.delete_items("g1").await.unwrap();
        assert!(store.list_items("g1").await.unwrap().is_empty());
        assert!(store.find_item_by_chunk_id("g1/a-0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_answer_with_sources() {
        let (_dir, store) = setup().await;
        let answer = AnswerRecord {
            id: Uuid::new_v4().to_string(),
            group_id: "g1".to_string(),
            query: "what is it".to_string(),
            content: "It is a thing.".to_string(),
            credits_used: 1,
            sources: vec![SourceLink {
                url: Some("https://e.com/a".to_string()),
                title: Some("A".to_string()),
                score: 0.9,
                item_id: None,
                fetch_id: Some("abc12345".to_string()),
                group_id: Some("g1".to_string()),
                search_query: Some("thing".to_string()),
            }],
            created_at: Utc::now(),
        };
        store.save_answer(&answer).await.unwrap();
    }
}

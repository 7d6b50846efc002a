use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Knowledge items, one per fetched key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS items (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            key TEXT NOT NULL,
            title TEXT,
            markdown TEXT NOT NULL DEFAULT '',
            meta_tags_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'pending',
            error TEXT,
            updated_at INTEGER NOT NULL,
            UNIQUE(group_id, key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Embedded chunk records per item, in chunk order
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_chunks (
            chunk_id TEXT PRIMARY KEY,
            item_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            FOREIGN KEY (item_id) REFERENCES items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Run state per knowledge group
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_runs (
            group_id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'pending',
            run_id TEXT,
            fetch_error TEXT,
            last_updated_at INTEGER,
            next_update_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Persisted answers with their citation sources
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS answers (
            id TEXT PRIMARY KEY,
            group_id TEXT NOT NULL,
            query TEXT NOT NULL,
            content TEXT NOT NULL,
            credits_used INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS answer_sources (
            answer_id TEXT NOT NULL,
            position INTEGER NOT NULL,
            url TEXT,
            title TEXT,
            score REAL NOT NULL DEFAULT 0,
            item_id TEXT,
            fetch_id TEXT,
            search_query TEXT,
            PRIMARY KEY (answer_id, position),
            FOREIGN KEY (answer_id) REFERENCES answers(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_group ON items(group_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_status ON items(status)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_item_chunks_item ON item_chunks(item_id)")
        .execute(pool)
        .await?;

    Ok(())
}

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::config::SourceConfig;
use crate::model::{format_timestamp, FeedItem, FeedSource, ItemQuery, StoredItem};
use crate::store::ItemStore;

/// SQLite-backed [`ItemStore`].
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn initialize(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sources (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                feed_url TEXT NOT NULL UNIQUE,
                source_handle TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                auto_named INTEGER NOT NULL DEFAULT 0,
                last_fetched_at TEXT,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // AUTOINCREMENT keeps ids monotonic after pruning, so id order is insertion order
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                link TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                published_at TEXT NOT NULL,
                source_id INTEGER NOT NULL REFERENCES sources(id),
                content_hash TEXT NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_items_published
            ON items(published_at DESC, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_items_source_published
            ON items(source_id, published_at DESC)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_source(&self, source_id: i64) -> anyhow::Result<Option<FeedSource>> {
        let source = sqlx::query_as::<_, FeedSource>("SELECT * FROM sources WHERE id = ?")
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(source)
    }
}

#[async_trait]
impl ItemStore for Database {
    async fn sync_sources(&self, configs: &[SourceConfig]) -> anyhow::Result<()> {
        for config in configs {
            sqlx::query(
                r#"
                INSERT INTO sources (name, feed_url, source_handle, is_active, auto_named)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(feed_url) DO UPDATE SET
                    name = CASE
                        WHEN excluded.auto_named = 1 AND sources.auto_named = 1 THEN sources.name
                        ELSE excluded.name
                    END,
                    auto_named = excluded.auto_named,
                    source_handle = excluded.source_handle,
                    is_active = excluded.is_active
                "#,
            )
            .bind(config.display_name())
            .bind(&config.url)
            .bind(&config.handle)
            .bind(config.active)
            .bind(config.is_auto_named())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn all_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
        let sources = sqlx::query_as::<_, FeedSource>("SELECT * FROM sources ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(sources)
    }

    async fn active_sources(&self) -> anyhow::Result<Vec<FeedSource>> {
        let sources =
            sqlx::query_as::<_, FeedSource>("SELECT * FROM sources WHERE is_active = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(sources)
    }

    async fn insert_items(&self, items: &[FeedItem]) -> anyhow::Result<u64> {
        let mut inserted = 0;
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO items (title, link, summary, published_at, source_id, content_hash)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(content_hash) DO NOTHING
                "#,
            )
            .bind(&item.title)
            .bind(&item.link)
            .bind(&item.summary)
            .bind(format_timestamp(&item.published_at))
            .bind(item.source_id)
            .bind(&item.fingerprint)
            .execute(&self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    async fn record_fetch(
        &self,
        source_id: i64,
        error: Option<&str>,
        feed_title: Option<&str>,
    ) -> anyhow::Result<()> {
        let now = format_timestamp(&Utc::now());
        sqlx::query(
            r#"
            UPDATE sources
            SET last_fetched_at = ?,
                last_error = ?,
                name = CASE WHEN auto_named = 1 THEN COALESCE(?, name) ELSE name END
            WHERE id = ?
            "#,
        )
        .bind(&now)
        .bind(error)
        .bind(feed_title)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn prune_source(&self, source_id: i64, keep: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM items
            WHERE source_id = ?
              AND id NOT IN (
                  SELECT id FROM items
                  WHERE source_id = ?
                  ORDER BY published_at DESC, id ASC
                  LIMIT ?
              )
            "#,
        )
        .bind(source_id)
        .bind(source_id)
        .bind(keep.max(0))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_items(&self, query: &ItemQuery) -> anyhow::Result<Vec<StoredItem>> {
        let items = sqlx::query_as::<_, StoredItem>(
            r#"
            SELECT i.content_hash AS id, i.title, i.link, i.summary, i.published_at,
                   s.name AS source, s.source_handle
            FROM items i
            JOIN sources s ON s.id = i.source_id
            WHERE (?1 IS NULL OR s.name = ?1)
            ORDER BY i.published_at DESC, i.id ASC
            LIMIT ?2 OFFSET ?3
            "#,
        )
        .bind(&query.source)
        .bind(query.limit)
        .bind(query.offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    async fn count_items(&self, source: Option<&str>) -> anyhow::Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM items i
            JOIN sources s ON s.id = i.source_id
            WHERE (?1 IS NULL OR s.name = ?1)
            "#,
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }
}

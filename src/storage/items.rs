use anyhow::Result;
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, EntityCount, EntityKind, Item, ItemDbRow, NormalizedItem};

const ITEM_COLUMNS: &str = "id, source_id, url, title, author, published_at, content, content_sha, \
     tags, metadata, fetched_at";

/// Maximum number of items returned from any single listing (OOM protection)
const MAX_ITEMS: i64 = 2000;

impl Database {
    // ========================================================================
    // Item Operations
    // ========================================================================

    /// Insert items for a source, skipping any whose `(source_id, url)` is already stored.
    ///
    /// Returns the number of newly inserted rows. Duplicates within `items`
    /// collapse onto the first occurrence.
    ///
    /// PERF-012: INSERT OR IGNORE + `changes()` counts new rows without
    /// before/after COUNT scans.
    pub async fn insert_items(
        &self,
        source_id: i64,
        items: &[NormalizedItem],
    ) -> Result<usize, DatabaseError> {
        if items.is_empty() {
            return Ok(0);
        }

        const BATCH_SIZE: usize = 50;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut total_inserted: usize = 0;

        for chunk in items.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO items \
                 (source_id, url, title, author, published_at, content, content_sha, tags, metadata, fetched_at) ",
            );

            builder.push_values(chunk, |mut b, item| {
                b.push_bind(source_id)
                    .push_bind(item.url.clone())
                    .push_bind(item.title.clone())
                    .push_bind(item.author.clone())
                    .push_bind(item.published_at)
                    .push_bind(item.content.clone())
                    .push_bind(item.content_sha())
                    .push_bind(serde_json::to_string(&item.tags).unwrap_or_else(|_| "[]".into()))
                    .push_bind(item.metadata.to_string())
                    .push_bind(now);
            });

            builder.build().execute(&mut *tx).await?;

            let changes: (i64,) = sqlx::query_as("SELECT changes()")
                .fetch_one(&mut *tx)
                .await?;
            total_inserted += changes.0 as usize;
        }

        tx.commit().await?;
        Ok(total_inserted)
    }

    /// Items published in `[start, end)` (UNIX seconds), newest first.
    pub async fn items_published_between(
        &self,
        source_id: i64,
        start: i64,
        end: i64,
    ) -> Result<Vec<Item>> {
        let rows: Vec<ItemDbRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE source_id = ? AND published_at >= ? AND published_at < ?
             ORDER BY published_at DESC, id DESC
             LIMIT ?"
        ))
        .bind(source_id)
        .bind(start)
        .bind(end)
        .bind(MAX_ITEMS)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    /// Most recently published items of a source.
    pub async fn recent_items(&self, source_id: i64, limit: i64) -> Result<Vec<Item>> {
        let rows: Vec<ItemDbRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items
             WHERE source_id = ?
             ORDER BY published_at DESC, id DESC
             LIMIT ?"
        ))
        .bind(source_id)
        .bind(limit.clamp(0, MAX_ITEMS))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
    }

    pub async fn count_items(&self, source_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM items WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    /// Authors and tags ranked by how many items carry them.
    ///
    /// `Unknown` authors are excluded. Ties break alphabetically.
    pub async fn top_entities(&self, limit: i64) -> Result<Vec<EntityCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"
            SELECT name, kind, cnt FROM (
                SELECT author AS name, 'author' AS kind, COUNT(*) AS cnt
                FROM items
                WHERE author != '' AND author != 'Unknown'
                GROUP BY author
                UNION ALL
                SELECT j.value AS name, 'tag' AS kind, COUNT(*) AS cnt
                FROM items, json_each(items.tags) AS j
                WHERE j.type = 'text' AND j.value != ''
                GROUP BY j.value
            )
            ORDER BY cnt DESC, name ASC
            LIMIT ?
            "#,
        )
        .bind(limit.clamp(1, MAX_ITEMS))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(name, kind, count)| EntityCount {
                name,
                kind: if kind == "author" {
                    EntityKind::Author
                } else {
                    EntityKind::Tag
                },
                count,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, EntityKind, NewSource, NormalizedItem, Schedule, SourceKind};
    use pretty_assertions::assert_eq;

    async fn test_db() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let source = db
            .create_source(&NewSource {
                name: "Feed".into(),
                kind: SourceKind::Rss,
                handle: "https://example.com/feed".into(),
                schedule: Schedule::Daily,
                ai_focus: None,
                policy_id: None,
            })
            .await
            .unwrap();
        (db, source)
    }

    fn item(n: i64, published_at: i64) -> NormalizedItem {
        NormalizedItem {
            url: format!("https://example.com/post/{}", n),
            title: format!("Post {}", n),
            author: "Alice".into(),
            published_at,
            content: format!("Body of post {}", n),
            tags: vec!["rust".into()],
            metadata: serde_json::json!({"type": "rss_item"}),
        }
    }

    #[tokio::test]
    async fn test_insert_items_deduplicates_on_url() {
        let (db, source) = test_db().await;

        let inserted = db
            .insert_items(source, &[item(1, 100), item(2, 200)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        // Same URLs again, plus one new item
        let inserted = db
            .insert_items(source, &[item(1, 100), item(2, 200), item(3, 300)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
        assert_eq!(db.count_items(source).await.unwrap(), 3);

        // Duplicates inside a single batch collapse
        let inserted = db
            .insert_items(source, &[item(4, 400), item(4, 400)])
            .await
            .unwrap();
        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_insert_items_stores_sha_tags_and_metadata() {
        let (db, source) = test_db().await;
        let original = item(1, 100);
        db.insert_items(source, std::slice::from_ref(&original))
            .await
            .unwrap();

        let stored = db.recent_items(source, 10).await.unwrap().remove(0);
        assert_eq!(stored.content_sha, original.content_sha());
        assert_eq!(stored.tags, vec!["rust".to_string()]);
        assert_eq!(stored.metadata["type"], "rss_item");
    }

    #[tokio::test]
    async fn test_items_published_between_is_half_open_and_newest_first() {
        let (db, source) = test_db().await;
        db.insert_items(source, &[item(1, 99), item(2, 100), item(3, 150), item(4, 200)])
            .await
            .unwrap();

        let window = db.items_published_between(source, 100, 200).await.unwrap();
        let titles: Vec<&str> = window.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Post 3", "Post 2"]);
    }

    #[tokio::test]
    async fn test_top_entities_counts_authors_and_tags() {
        let (db, source) = test_db().await;
        let mut a = item(1, 1);
        a.tags = vec!["rust".into(), "async".into()];
        let mut b = item(2, 2);
        b.author = "Bob".into();
        let mut c = item(3, 3);
        c.author = "Unknown".into();
        c.tags = vec![];
        db.insert_items(source, &[a, b, c]).await.unwrap();

        let entities = db.top_entities(10).await.unwrap();
        assert_eq!(entities[0].name, "rust");
        assert_eq!(entities[0].kind, EntityKind::Tag);
        assert_eq!(entities[0].count, 2);
        assert!(entities.iter().any(|e| e.name == "Alice" && e.count == 1));
        assert!(!entities.iter().any(|e| e.name == "Unknown"));

        assert_eq!(db.top_entities(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_items_removed_with_source() {
        let (db, source) = test_db().await;
        db.insert_items(source, &[item(1, 1)]).await.unwrap();
        db.delete_source(source).await.unwrap();
        assert_eq!(db.count_items(source).await.unwrap(), 0);
    }
}

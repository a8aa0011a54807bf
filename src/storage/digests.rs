use anyhow::{Context, Result};
use chrono::NaiveDate;

use super::schema::Database;
use super::types::{DailyDigest, DigestDbRow};

const DIGEST_COLUMNS: &str = "id, source_id, date, summary_md, insights_md, items, created_at";

impl Database {
    // ========================================================================
    // Digest Operations
    // ========================================================================

    /// Insert or replace the digest for `(source_id, date)`, returning its ID.
    pub async fn upsert_digest(&self, digest: &DailyDigest) -> Result<i64> {
        let items = serde_json::to_string(&digest.items)?;
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO daily_digests (source_id, date, summary_md, insights_md, items, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_id, date) DO UPDATE SET
                summary_md = excluded.summary_md,
                insights_md = excluded.insights_md,
                items = excluded.items,
                created_at = excluded.created_at
            RETURNING id
            "#,
        )
        .bind(digest.source_id)
        .bind(digest.date.format("%Y-%m-%d").to_string())
        .bind(&digest.summary_md)
        .bind(&digest.insights_md)
        .bind(&items)
        .bind(digest.created_at)
        .fetch_one(&self.pool)
        .await
        .with_context(|| {
            format!(
                "Failed to store digest for source {} on {}",
                digest.source_id, digest.date
            )
        })?;
        Ok(row.0)
    }

    pub async fn get_digest(&self, source_id: i64, date: NaiveDate) -> Result<Option<DailyDigest>> {
        let row: Option<DigestDbRow> = sqlx::query_as(&format!(
            "SELECT {DIGEST_COLUMNS} FROM daily_digests WHERE source_id = ? AND date = ?"
        ))
        .bind(source_id)
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(DigestDbRow::into_digest).transpose()?)
    }

    /// Stored digests, newest date first, optionally for one source.
    pub async fn list_digests(&self, source_id: Option<i64>, limit: i64) -> Result<Vec<DailyDigest>> {
        let rows: Vec<DigestDbRow> = sqlx::query_as(&format!(
            "SELECT {DIGEST_COLUMNS} FROM daily_digests
             WHERE ?1 IS NULL OR source_id = ?1
             ORDER BY date DESC, source_id
             LIMIT ?2"
        ))
        .bind(source_id)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        let mut digests = Vec::with_capacity(rows.len());
        for row in rows {
            digests.push(row.into_digest()?);
        }
        Ok(digests)
    }
}

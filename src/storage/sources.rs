use anyhow::{Context, Result};
use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, NewSource, Source, SourceDbRow, SourceUpdate};

const SOURCE_COLUMNS: &str = "id, name, kind, handle, schedule, ai_focus, policy_id, is_active, \
     last_fetched, error, consecutive_failures, created_at";

fn into_sources(rows: Vec<SourceDbRow>) -> Vec<Source> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            match row.into_source() {
                Ok(source) => Some(source),
                Err(e) => {
                    tracing::warn!(source_id = id, error = %e, "Skipping source with unreadable kind");
                    None
                }
            }
        })
        .collect()
}

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Register a source, returning its ID.
    ///
    /// Fails if another source already polls the same handle.
    pub async fn create_source(&self, source: &NewSource) -> Result<i64> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO sources (name, kind, handle, schedule, ai_focus, policy_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(source.name.trim())
        .bind(source.kind.as_str())
        .bind(source.handle.trim())
        .bind(source.schedule.as_str())
        .bind(source.ai_focus.as_deref())
        .bind(source.policy_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("Failed to register source {}", source.handle))?;

        Ok(row.0)
    }

    /// Register many sources in one transaction, skipping handles already present.
    ///
    /// Returns the IDs of every requested handle (new or pre-existing), in input order.
    /// PERF-001: Batch INSERT in chunks of 100 for large OPML imports.
    pub async fn create_sources_batch(&self, sources: &[NewSource]) -> Result<Vec<i64>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }

        const BATCH_SIZE: usize = 100;
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for chunk in sources.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO sources (name, kind, handle, schedule, ai_focus, policy_id, created_at) ",
            );
            builder.push_values(chunk, |mut b, source| {
                b.push_bind(source.name.trim().to_string())
                    .push_bind(source.kind.as_str())
                    .push_bind(source.handle.trim().to_string())
                    .push_bind(source.schedule.as_str())
                    .push_bind(source.ai_focus.clone())
                    .push_bind(source.policy_id)
                    .push_bind(now);
            });
            builder.build().execute(&mut *tx).await?;
        }

        let mut ids = Vec::with_capacity(sources.len());
        for source in sources {
            let row: (i64,) = sqlx::query_as("SELECT id FROM sources WHERE handle = ?")
                .bind(source.handle.trim())
                .fetch_one(&mut *tx)
                .await?;
            ids.push(row.0);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Load one source.
    pub async fn get_source(&self, source_id: i64) -> Result<Option<Source>> {
        let row: Option<SourceDbRow> =
            sqlx::query_as(&format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?"))
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(Some(row.into_source()?)),
            None => Ok(None),
        }
    }

    /// All sources ordered by name.
    pub async fn list_sources(&self) -> Result<Vec<Source>> {
        let rows: Vec<SourceDbRow> = sqlx::query_as(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources ORDER BY name COLLATE NOCASE, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(into_sources(rows))
    }

    /// Active sources whose circuit breaker has not tripped.
    pub async fn get_fetchable_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let rows: Vec<SourceDbRow> = sqlx::query_as(&format!(
            "SELECT {SOURCE_COLUMNS} FROM sources
             WHERE is_active = 1 AND consecutive_failures < ?
             ORDER BY id"
        ))
        .bind(Self::CIRCUIT_BREAKER_THRESHOLD)
        .fetch_all(&self.pool)
        .await?;

        Ok(into_sources(rows))
    }

    /// Apply a partial update. Errors with `NotFound` for unknown IDs.
    pub async fn update_source(&self, source_id: i64, update: &SourceUpdate) -> Result<()> {
        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE sources SET ");
        let mut fields = builder.separated(", ");
        let mut any = false;

        if let Some(name) = &update.name {
            fields.push("name = ").push_bind_unseparated(name.trim().to_string());
            any = true;
        }
        if let Some(handle) = &update.handle {
            fields.push("handle = ").push_bind_unseparated(handle.trim().to_string());
            any = true;
        }
        if let Some(schedule) = update.schedule {
            fields.push("schedule = ").push_bind_unseparated(schedule.as_str());
            any = true;
        }
        if let Some(ai_focus) = &update.ai_focus {
            fields.push("ai_focus = ").push_bind_unseparated(ai_focus.clone());
            any = true;
        }
        if let Some(is_active) = update.is_active {
            fields.push("is_active = ").push_bind_unseparated(is_active);
            if is_active {
                // Reactivating a source also closes its circuit breaker
                fields.push("consecutive_failures = 0");
            }
            any = true;
        }

        if !any {
            return Ok(());
        }

        builder.push(" WHERE id = ").push_bind(source_id);
        let result = builder.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "Source",
                id: source_id,
            }
            .into());
        }
        Ok(())
    }

    /// Delete a source with its items, fetch runs, digests and category links.
    pub async fn delete_source(&self, source_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Attach a policy to a source, or detach with `None`.
    pub async fn set_source_policy(&self, source_id: i64, policy_id: Option<i64>) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET policy_id = ? WHERE id = ?")
            .bind(policy_id)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "Source",
                id: source_id,
            }
            .into());
        }
        Ok(())
    }

    // ========================================================================
    // Fetch Status / Circuit Breaker Operations
    // ========================================================================

    /// Threshold for consecutive failures before a source is skipped
    pub const CIRCUIT_BREAKER_THRESHOLD: i64 = 5;

    /// Record a failed fetch: store the error and bump the failure counter.
    ///
    /// Returns the new failure count. Once it reaches
    /// [`Self::CIRCUIT_BREAKER_THRESHOLD`], bulk fetches skip the source until
    /// it is re-enabled with `source edit --active true`.
    pub async fn record_source_failure(
        &self,
        source_id: i64,
        error: &str,
    ) -> Result<i64, DatabaseError> {
        let result: (i64,) = sqlx::query_as(
            "UPDATE sources SET error = ?, consecutive_failures = consecutive_failures + 1
             WHERE id = ? RETURNING consecutive_failures",
        )
        .bind(error)
        .bind(source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(result.0)
    }

    /// Record a successful fetch: clear the error, reset failures, stamp `last_fetched`.
    pub async fn record_source_success(&self, source_id: i64) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            "UPDATE sources SET error = NULL, consecutive_failures = 0, last_fetched = ? WHERE id = ?",
        )
        .bind(now)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, NewSource, Schedule, SourceKind, SourceUpdate};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_source(id: i64) -> NewSource {
        NewSource {
            name: format!("Source {}", id),
            kind: SourceKind::Rss,
            handle: format!("https://feed{}.example.com/rss", id),
            schedule: Schedule::Daily,
            ai_focus: None,
            policy_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_source() {
        let db = test_db().await;
        let mut new = test_source(1);
        new.kind = SourceKind::GithubRepo;
        new.ai_focus = Some("release cadence".into());
        let id = db.create_source(&new).await.unwrap();

        let source = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.name, "Source 1");
        assert_eq!(source.kind, SourceKind::GithubRepo);
        assert_eq!(source.schedule, Schedule::Daily);
        assert_eq!(source.ai_focus.as_deref(), Some("release cadence"));
        assert!(source.is_active);
        assert_eq!(source.consecutive_failures, 0);
        assert!(source.last_fetched.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_handle_rejected() {
        let db = test_db().await;
        db.create_source(&test_source(1)).await.unwrap();
        assert!(db.create_source(&test_source(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_batch_create_skips_existing() {
        let db = test_db().await;
        let existing = db.create_source(&test_source(1)).await.unwrap();

        let ids = db
            .create_sources_batch(&[test_source(1), test_source(2), test_source(3)])
            .await
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], existing);
        assert_eq!(db.list_sources().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_update_source_partial() {
        let db = test_db().await;
        let id = db.create_source(&test_source(1)).await.unwrap();

        let update = SourceUpdate {
            name: Some("Renamed".into()),
            schedule: Some(Schedule::Hourly),
            ..Default::default()
        };
        db.update_source(id, &update).await.unwrap();

        let source = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.name, "Renamed");
        assert_eq!(source.schedule, Schedule::Hourly);
        assert_eq!(source.handle, "https://feed1.example.com/rss");

        let clear = SourceUpdate {
            ai_focus: Some(None),
            ..Default::default()
        };
        db.update_source(id, &clear).await.unwrap();
        assert!(db.get_source(id).await.unwrap().unwrap().ai_focus.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_source_is_not_found() {
        let db = test_db().await;
        let update = SourceUpdate {
            name: Some("x".into()),
            ..Default::default()
        };
        let err = db.update_source(999, &update).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_failure_counter_and_circuit_breaker() {
        let db = test_db().await;
        let id = db.create_source(&test_source(1)).await.unwrap();

        for expected in 1..=Database::CIRCUIT_BREAKER_THRESHOLD {
            let count = db.record_source_failure(id, "HTTP 500").await.unwrap();
            assert_eq!(count, expected);
        }

        let source = db.get_source(id).await.unwrap().unwrap();
        assert_eq!(source.error.as_deref(), Some("HTTP 500"));
        assert!(db.get_fetchable_sources().await.unwrap().is_empty());

        // Re-enabling resets the breaker
        let update = SourceUpdate {
            is_active: Some(true),
            ..Default::default()
        };
        db.update_source(id, &update).await.unwrap();
        assert_eq!(db.get_fetchable_sources().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_success_clears_error() {
        let db = test_db().await;
        let id = db.create_source(&test_source(1)).await.unwrap();
        db.record_source_failure(id, "boom").await.unwrap();
        db.record_source_success(id).await.unwrap();

        let source = db.get_source(id).await.unwrap().unwrap();
        assert!(source.error.is_none());
        assert_eq!(source.consecutive_failures, 0);
        assert!(source.last_fetched.is_some());
    }

    #[tokio::test]
    async fn test_inactive_sources_not_fetchable() {
        let db = test_db().await;
        let id = db.create_source(&test_source(1)).await.unwrap();
        db.create_source(&test_source(2)).await.unwrap();
        let update = SourceUpdate {
            is_active: Some(false),
            ..Default::default()
        };
        db.update_source(id, &update).await.unwrap();

        let fetchable = db.get_fetchable_sources().await.unwrap();
        assert_eq!(fetchable.len(), 1);
        assert_eq!(fetchable[0].name, "Source 2");
    }

    #[tokio::test]
    async fn test_delete_source() {
        let db = test_db().await;
        let id = db.create_source(&test_source(1)).await.unwrap();
        assert!(db.delete_source(id).await.unwrap());
        assert!(!db.delete_source(id).await.unwrap());
        assert!(db.get_source(id).await.unwrap().is_none());
    }
}

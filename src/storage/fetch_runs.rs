use anyhow::Result;

use super::schema::Database;
use super::types::{DatabaseError, FetchRun};

impl Database {
    // ========================================================================
    // Fetch Run Operations
    // ========================================================================

    /// Number of runs `fetch_history` returns by default.
    pub const FETCH_HISTORY_LIMIT: i64 = 10;

    /// Open a run (`ok = false`, `started_at = now`) and return its ID.
    pub async fn start_fetch_run(&self, source_id: i64) -> Result<i64, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO fetch_runs (source_id, started_at, ok, new_items) VALUES (?, ?, 0, 0) RETURNING id",
        )
        .bind(source_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Close a run with its outcome.
    pub async fn finish_fetch_run(
        &self,
        run_id: i64,
        ok: bool,
        new_items: usize,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE fetch_runs SET ended_at = ?, ok = ?, new_items = ?, error = ? WHERE id = ?")
            .bind(now)
            .bind(ok)
            .bind(new_items as i64)
            .bind(error)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Most recent runs for a source, newest first.
    pub async fn fetch_history(&self, source_id: i64, limit: i64) -> Result<Vec<FetchRun>> {
        let runs: Vec<FetchRun> = sqlx::query_as(
            r#"
            SELECT id, source_id, started_at, ended_at, ok, new_items, error
            FROM fetch_runs
            WHERE source_id = ?
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(source_id)
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        Ok(runs)
    }
}

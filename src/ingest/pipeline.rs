use futures::stream::{self, StreamExt};

use super::http::{FetchError, Fetcher};
use crate::storage::{Database, FetchRun, NormalizedItem, Source, SourceKind};

/// Bulk fetches keep at most this many sources in flight.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 8;

/// What a successful `fetch_and_save` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub source_id: i64,
    pub run_id: i64,
    /// Items the fetcher produced, before deduplication.
    pub fetched: usize,
    pub new_items: usize,
}

/// Result of one source in a bulk fetch.
#[derive(Debug)]
pub struct FetchResult {
    pub source_id: i64,
    pub name: String,
    pub result: Result<FetchOutcome, FetchError>,
}

impl Fetcher {
    /// Dispatch to the fetcher for the source's kind.
    pub async fn fetch_source(&self, source: &Source) -> Result<Vec<NormalizedItem>, FetchError> {
        match source.kind {
            SourceKind::Rss => self.fetch_feed(&source.handle).await,
            SourceKind::GithubRepo => self.fetch_github_repo(&source.handle).await,
            SourceKind::Html => self.fetch_html(&source.handle).await,
        }
    }
}

fn db_err(e: impl std::fmt::Display) -> FetchError {
    FetchError::Database(e.to_string())
}

/// Fetch one source and store its new items, recording a fetch run.
///
/// A fetch failure closes the run as failed, stores the error on the source
/// and bumps its circuit-breaker counter before being returned.
pub async fn fetch_and_save(
    db: &Database,
    fetcher: &Fetcher,
    source_id: i64,
) -> Result<FetchOutcome, FetchError> {
    let source = db
        .get_source(source_id)
        .await
        .map_err(db_err)?
        .ok_or(FetchError::SourceNotFound(source_id))?;

    let run_id = db.start_fetch_run(source_id).await.map_err(db_err)?;

    let items = match fetcher.fetch_source(&source).await {
        Ok(items) => items,
        Err(e) => {
            let message = e.to_string();
            if let Err(db_e) = db.finish_fetch_run(run_id, false, 0, Some(&message)).await {
                tracing::warn!(source_id, error = %db_e, "Failed to close fetch run");
            }
            match db.record_source_failure(source_id, &message).await {
                Ok(failures) if failures >= Database::CIRCUIT_BREAKER_THRESHOLD => {
                    tracing::warn!(
                        source_id,
                        failures,
                        "Source tripped the circuit breaker and will be skipped by bulk fetches"
                    );
                }
                Ok(_) => {}
                Err(db_e) => tracing::warn!(source_id, error = %db_e, "Failed to record source failure"),
            }
            tracing::warn!(source = %source.handle, error = %e, "Fetch failed");
            return Err(e);
        }
    };

    let new_items = match db.insert_items(source_id, &items).await {
        Ok(n) => n,
        Err(e) => {
            let message = e.to_string();
            if let Err(db_e) = db.finish_fetch_run(run_id, false, 0, Some(&message)).await {
                tracing::warn!(source_id, error = %db_e, "Failed to close fetch run");
            }
            return Err(db_err(e));
        }
    };

    db.finish_fetch_run(run_id, true, new_items, None)
        .await
        .map_err(db_err)?;
    db.record_source_success(source_id).await.map_err(db_err)?;

    tracing::info!(
        source = %source.handle,
        fetched = items.len(),
        new_items,
        "Fetched source"
    );

    Ok(FetchOutcome {
        source_id,
        run_id,
        fetched: items.len(),
        new_items,
    })
}

/// Fetch every active source concurrently.
///
/// Sources past the circuit-breaker threshold are never fetched. With
/// `due_only`, sources whose schedule interval has not elapsed (and manual
/// sources) are skipped too. Results arrive in completion order.
pub async fn fetch_all(
    db: &Database,
    fetcher: &Fetcher,
    due_only: bool,
    concurrency: usize,
) -> Result<Vec<FetchResult>, FetchError> {
    let active = db.list_sources().await.map_err(db_err)?;
    let active: Vec<Source> = active.into_iter().filter(|s| s.is_active).collect();
    let fetchable = db.get_fetchable_sources().await.map_err(db_err)?;

    let tripped = active.len().saturating_sub(fetchable.len());
    if tripped > 0 {
        tracing::info!(
            skipped = tripped,
            threshold = Database::CIRCUIT_BREAKER_THRESHOLD,
            "Skipping sources due to consecutive failures (re-enable with `source edit --active true`)"
        );
    }

    let now = chrono::Utc::now().timestamp();
    let selected: Vec<Source> = if due_only {
        fetchable.into_iter().filter(|s| s.is_due(now)).collect()
    } else {
        fetchable
    };

    if selected.is_empty() {
        return Ok(Vec::new());
    }

    let results = stream::iter(selected)
        .map(|source| async move {
            let result = fetch_and_save(db, fetcher, source.id).await;
            FetchResult {
                source_id: source.id,
                name: source.name,
                result,
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let failed = results.iter().filter(|r| r.result.is_err()).count();
    tracing::info!(total = results.len(), failed, "Bulk fetch complete");
    Ok(results)
}

/// The most recent fetch runs of a source, newest first.
pub async fn fetch_history(db: &Database, source_id: i64) -> anyhow::Result<Vec<FetchRun>> {
    db.fetch_history(source_id, Database::FETCH_HISTORY_LIMIT).await
}

use anyhow::Result;

use super::schema::Database;
use super::types::{Item, ItemDbRow};

// ============================================================================
// FTS5 Query Validation
// ============================================================================

const MAX_QUERY_LENGTH: usize = 256;
const MAX_WILDCARDS: usize = 3;
const MAX_OR_OPERATORS: usize = 5;
const MAX_PARENTHESES: usize = 5;
const MAX_AND_OPERATORS: usize = 10;

/// Maximum number of items returned from a search
const MAX_RESULTS: i64 = 500;

/// Validate FTS5 query complexity to prevent DoS via expensive wildcard expansions.
///
/// Limits:
/// - Maximum query length: 256 characters
/// - Maximum wildcards (*): 3
/// - Maximum OR operators: 5
/// - Maximum parentheses: 5, and they must balance
/// - Maximum AND operators: 10
/// Escape LIKE wildcards so they match literally under `ESCAPE '\'`.
fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn validate_fts_query(query: &str) -> Result<()> {
    if query.len() > MAX_QUERY_LENGTH {
        anyhow::bail!(
            "Search query exceeds maximum length of {} characters",
            MAX_QUERY_LENGTH
        );
    }

    if query.matches('*').count() > MAX_WILDCARDS {
        anyhow::bail!(
            "Search query contains too many wildcards (max {})",
            MAX_WILDCARDS
        );
    }

    let upper = query.to_uppercase();
    if upper.matches(" OR ").count() > MAX_OR_OPERATORS {
        anyhow::bail!(
            "Search query contains too many OR operators (max {})",
            MAX_OR_OPERATORS
        );
    }

    let open_paren_count = query.chars().filter(|&c| c == '(').count();
    let close_paren_count = query.chars().filter(|&c| c == ')').count();
    if open_paren_count > MAX_PARENTHESES {
        anyhow::bail!(
            "Search query contains too many parentheses (max {})",
            MAX_PARENTHESES
        );
    }
    if open_paren_count != close_paren_count {
        anyhow::bail!("Search query has unbalanced parentheses");
    }

    if upper.matches(" AND ").count() > MAX_AND_OPERATORS {
        anyhow::bail!(
            "Search query contains too many AND operators (max {})",
            MAX_AND_OPERATORS
        );
    }

    Ok(())
}

impl Database {
    // ========================================================================
    // Search Operations
    // ========================================================================

    /// Search item titles and bodies.
    ///
    /// Uses FTS5 MATCH, falling back to LIKE when the query is not valid FTS5
    /// syntax (e.g. a bare `"` or `-`). Results are newest first.
    pub async fn search_items(&self, query: &str) -> Result<Vec<Item>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        validate_fts_query(query)?;

        tracing::debug!(limit = MAX_RESULTS, query = %query, "search_items");

        let fts_result = sqlx::query_as::<_, ItemDbRow>(
            r#"
            SELECT i.id, i.source_id, i.url, i.title, i.author, i.published_at,
                   i.content, i.content_sha, i.tags, i.metadata, i.fetched_at
            FROM items i
            INNER JOIN items_fts ON i.id = items_fts.rowid
            WHERE items_fts MATCH ?
            ORDER BY i.published_at DESC
            LIMIT ?
        "#,
        )
        .bind(query)
        .bind(MAX_RESULTS)
        .fetch_all(&self.pool)
        .await;

        match fts_result {
            Ok(rows) => Ok(rows.into_iter().map(ItemDbRow::into_item).collect()),
            Err(e) => {
                tracing::warn!(error = %e, query = %query, "FTS5 search failed, falling back to LIKE");
                let like_pattern = format!("%{}%", escape_like(query));
                let rows = sqlx::query_as::<_, ItemDbRow>(
                    r#"
                    SELECT id, source_id, url, title, author, published_at,
                           content, content_sha, tags, metadata, fetched_at
                    FROM items
                    WHERE title LIKE ?1 ESCAPE '\' OR content LIKE ?1 ESCAPE '\'
                    ORDER BY published_at DESC
                    LIMIT ?2
                "#,
                )
                .bind(&like_pattern)
                .bind(MAX_RESULTS)
                .fetch_all(&self.pool)
                .await?;

                Ok(rows.into_iter().map(ItemDbRow::into_item).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{escape_like, validate_fts_query};
    use crate::storage::{Database, NewSource, NormalizedItem, Schedule, SourceKind};

    async fn seeded_db() -> Database {
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

        let items: Vec<NormalizedItem> = [
            ("Protein folding with diffusion", "A new diffusion model", 300),
            ("Rust 2024 edition", "Async closures land", 200),
            ("Weekly notes", "Mentions protein design briefly", 100),
            ("Spring sale", "Everything 50% off", 50),
            ("Release 500", "500 merged changes", 40),
        ]
        .iter()
        .enumerate()
        .map(|(n, (title, content, ts))| NormalizedItem {
            url: format!("https://example.com/{}", n),
            title: title.to_string(),
            author: "Unknown".into(),
            published_at: *ts,
            content: content.to_string(),
            tags: vec![],
            metadata: serde_json::json!({}),
        })
        .collect();
        db.insert_items(source, &items).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_search_matches_title_and_content() {
        let db = seeded_db().await;
        let results = db.search_items("protein").await.unwrap();
        let titles: Vec<&str> = results.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Protein folding with diffusion", "Weekly notes"]);
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let db = seeded_db().await;
        assert!(db.search_items("   ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_fts_syntax_falls_back_to_like() {
        let db = seeded_db().await;
        // Unterminated quote is an FTS5 syntax error
        let results = db.search_items("\"Async clo").await;
        assert!(results.is_ok());
    }

    #[tokio::test]
    async fn test_like_fallback_matches_wildcards_literally() {
        let db = seeded_db().await;
        // `%` is not valid FTS5 syntax, so this goes through LIKE
        let results = db.search_items("50%").await.unwrap();
        let titles: Vec<&str> = results.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["Spring sale"]);

        assert_eq!(escape_like(r"a_b%c\d"), r"a\_b\%c\\d");
    }

    #[test]
    fn test_query_complexity_limits() {
        assert!(validate_fts_query("rust").is_ok());
        assert!(validate_fts_query(&"a".repeat(257)).is_err());
        assert!(validate_fts_query("a* b* c* d*").is_err());
        assert!(validate_fts_query("a OR b OR c OR d OR e OR f OR g").is_err());
        assert!(validate_fts_query("(a").is_err());
        assert!(validate_fts_query("((((((a))))))").is_err());
    }
}

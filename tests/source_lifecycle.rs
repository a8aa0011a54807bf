//! Integration tests for the source lifecycle: register, categorize, attach a
//! policy, store items, search, delete.
//!
//! Each test creates its own in-memory SQLite database for isolation.

use newsintel::storage::{
    Database, NewSource, NormalizedItem, PolicyParams, PolicyScope, Schedule, SourceKind,
    SourceUpdate,
};
use pretty_assertions::assert_eq;

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn new_source(handle: &str) -> NewSource {
    NewSource {
        name: "Example Feed".to_string(),
        kind: SourceKind::Rss,
        handle: handle.to_string(),
        schedule: Schedule::Daily,
        ai_focus: None,
        policy_id: None,
    }
}

fn item(url: &str, title: &str, content: &str) -> NormalizedItem {
    NormalizedItem {
        url: url.to_string(),
        title: title.to_string(),
        author: "alice".to_string(),
        published_at: 1_700_000_000,
        content: content.to_string(),
        tags: vec!["rust".to_string()],
        metadata: serde_json::json!({ "type": "rss_item" }),
    }
}

// ============================================================================
// Registration
// ============================================================================

#[tokio::test]
async fn test_register_source_appears_in_list() {
    let db = test_db().await;
    let id = db
        .create_source(&new_source("https://example.com/feed.xml"))
        .await
        .unwrap();

    let sources = db.list_sources().await.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].id, id);
    assert!(sources[0].is_active);
    assert_eq!(sources[0].last_fetched, None);
    assert_eq!(sources[0].schedule, Schedule::Daily);
}

#[tokio::test]
async fn test_duplicate_handle_rejected() {
    let db = test_db().await;
    db.create_source(&new_source("https://example.com/feed.xml"))
        .await
        .unwrap();
    assert!(db
        .create_source(&new_source("https://example.com/feed.xml"))
        .await
        .is_err());
}

#[tokio::test]
async fn test_edit_and_reactivate_resets_breaker() {
    let db = test_db().await;
    let id = db
        .create_source(&new_source("https://example.com/feed.xml"))
        .await
        .unwrap();

    for _ in 0..Database::CIRCUIT_BREAKER_THRESHOLD {
        db.record_source_failure(id, "timeout").await.unwrap();
    }
    assert!(db.get_fetchable_sources().await.unwrap().is_empty());

    db.update_source(
        id,
        &SourceUpdate {
            name: Some("Renamed".to_string()),
            is_active: Some(true),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let source = db.get_source(id).await.unwrap().unwrap();
    assert_eq!(source.name, "Renamed");
    assert_eq!(source.consecutive_failures, 0);
    assert_eq!(db.get_fetchable_sources().await.unwrap().len(), 1);
}

// ============================================================================
// Categories and policies
// ============================================================================

#[tokio::test]
async fn test_delete_category_detaches_sources_and_orphans_children() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/feed.xml"))
        .await
        .unwrap();
    let parent = db.create_category("Research", None).await.unwrap();
    let child = db.create_category("Proteins", Some(parent)).await.unwrap();
    db.assign_source_category(source, parent).await.unwrap();

    assert!(db.delete_category(parent).await.unwrap());

    assert!(db.categories_for_source(source).await.unwrap().is_empty());
    let tree = db.get_categories_tree().await.unwrap();
    assert_eq!(tree.len(), 1);
    assert_eq!(tree[0].id, child);
    assert_eq!(tree[0].parent_id, None);
}

#[tokio::test]
async fn test_deleting_policy_detaches_sources() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/feed.xml"))
        .await
        .unwrap();
    let policy = db
        .create_policy("default", None, PolicyScope::Global, &PolicyParams::default())
        .await
        .unwrap();
    db.set_source_policy(source, Some(policy)).await.unwrap();
    assert_eq!(
        db.get_source(source).await.unwrap().unwrap().policy_id,
        Some(policy)
    );

    assert!(db.delete_policy(policy).await.unwrap());
    assert_eq!(db.get_source(source).await.unwrap().unwrap().policy_id, None);
}

// ============================================================================
// Items, search and deletion
// ============================================================================

#[tokio::test]
async fn test_items_dedupe_and_search() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/feed.xml"))
        .await
        .unwrap();

    let batch = vec![
        item("https://example.com/1", "Async Rust in practice", "Tokio runtimes"),
        item("https://example.com/2", "SQLite tuning", "WAL mode and busy timeouts"),
    ];
    assert_eq!(db.insert_items(source, &batch).await.unwrap(), 2);
    assert_eq!(db.insert_items(source, &batch).await.unwrap(), 0);

    let hits = db.search_items("tokio").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].title, "Async Rust in practice");
    assert_eq!(hits[0].content_sha, batch[0].content_sha());

    let entities = db.top_entities(10).await.unwrap();
    assert!(entities.iter().any(|e| e.name == "alice" && e.count == 2));
    assert!(entities.iter().any(|e| e.name == "rust" && e.count == 2));
}

#[tokio::test]
async fn test_delete_source_removes_items_and_search_rows() {
    let db = test_db().await;
    let source = db
        .create_source(&new_source("https://example.com/feed.xml"))
        .await
        .unwrap();
    db.insert_items(source, &[item("https://example.com/1", "Unique title", "body")])
        .await
        .unwrap();
    let run = db.start_fetch_run(source).await.unwrap();
    db.finish_fetch_run(run, true, 1, None).await.unwrap();

    assert!(db.delete_source(source).await.unwrap());

    assert_eq!(db.count_items(source).await.unwrap(), 0);
    assert!(db.search_items("Unique").await.unwrap().is_empty());
    assert!(db.fetch_history(source, 10).await.unwrap().is_empty());
    assert!(!db.delete_source(source).await.unwrap());
}

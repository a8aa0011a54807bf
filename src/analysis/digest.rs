//! Daily digests: one analysis per source per UTC day, stored as markdown.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Timelike, Utc};

use super::{AnalysisResult, Analyzer};
use crate::storage::{DailyDigest, Database, DigestItemRef, Item, NormalizedItem};

pub const EMPTY_SUMMARY: &str = "今日无新内容";
pub const EMPTY_INSIGHTS: &str = "暂无洞察";

const TOP_AUTHORS: usize = 3;
const TOP_TAGS: usize = 5;
const DETAILED_CONTENT_CHARS: usize = 100;

/// `[date 00:00:00Z, date 23:59:59Z)` as UNIX seconds.
fn day_window(date: NaiveDate) -> (i64, i64) {
    let start = date.and_time(chrono::NaiveTime::MIN).and_utc().timestamp();
    (start, start + 86_399)
}

/// Analyze a source's items for one day and upsert the digest.
///
/// A day without items yields an unstored placeholder digest. A failed
/// upsert is logged and the digest is still returned (with `id: None`).
pub async fn generate_daily_digest(
    db: &Database,
    analyzer: &Analyzer,
    source_id: i64,
    date: NaiveDate,
) -> Result<DailyDigest> {
    let source = db
        .get_source(source_id)
        .await?
        .with_context(|| format!("Source {} not found", source_id))?;

    let (start, end) = day_window(date);
    let items = db
        .items_published_between(source_id, start, end)
        .await
        .context("Failed to load items for digest")?;

    if items.is_empty() {
        tracing::info!(source_id, %date, "No items for digest date");
        return Ok(DailyDigest {
            id: None,
            source_id,
            date,
            summary_md: EMPTY_SUMMARY.to_string(),
            insights_md: EMPTY_INSIGHTS.to_string(),
            items: Vec::new(),
            created_at: Utc::now().timestamp(),
        });
    }

    let policy = match source.policy_id {
        Some(policy_id) => db.get_policy(policy_id).await?.map(|p| p.params),
        None => None,
    };

    let refs: Vec<DigestItemRef> = items
        .iter()
        .map(|i| DigestItemRef {
            id: i.id,
            title: i.title.clone(),
            url: i.url.clone(),
        })
        .collect();
    let insights_md = render_insights(&items);
    let normalized: Vec<NormalizedItem> = items.into_iter().map(NormalizedItem::from).collect();

    let analysis = analyzer
        .analyze_content(
            &normalized,
            &source.name,
            source.ai_focus.as_deref(),
            policy.as_ref(),
        )
        .await;

    let mut digest = DailyDigest {
        id: None,
        source_id,
        date,
        summary_md: render_summary(&source.name, date, &analysis),
        insights_md,
        items: refs,
        created_at: Utc::now().timestamp(),
    };

    match db.upsert_digest(&digest).await {
        Ok(id) => {
            digest.id = Some(id);
            tracing::info!(source_id, %date, items = digest.items.len(), "Stored daily digest");
        }
        Err(e) => {
            tracing::warn!(source_id, %date, error = %e, "Failed to store daily digest");
        }
    }

    Ok(digest)
}

fn bullets(lines: &[String]) -> String {
    lines
        .iter()
        .map(|l| format!("- {l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_summary(source_name: &str, date: NaiveDate, analysis: &AnalysisResult) -> String {
    format!(
        "# {source_name} - {date} 摘要\n\n\
         ## 📊 今日概览\n{}\n\n\
         ## 🔍 关键洞察\n{}\n\n\
         ## 📈 趋势分析\n{}\n\n\
         ## 💡 影响评估\n{}\n\n\
         ## 🎯 行动建议\n{}\n\n\
         ## 👥 关键实体\n{}\n",
        analysis.summary,
        bullets(&analysis.insights),
        bullets(&analysis.trends),
        analysis.impact,
        bullets(&analysis.recommendations),
        bullets(&analysis.key_entities),
    )
}

/// Most frequent keys, ties broken alphabetically.
fn top_counts<'a>(values: impl Iterator<Item = &'a str>, n: usize) -> Vec<&'a str> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for v in values.filter(|v| !v.is_empty()) {
        *counts.entry(v).or_default() += 1;
    }
    let mut ranked: Vec<(&str, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
    ranked.into_iter().take(n).map(|(k, _)| k).collect()
}

fn peak_hour(items: &[Item]) -> Option<(u32, usize)> {
    let mut hours = [0usize; 24];
    for item in items {
        if let Some(dt) = chrono::DateTime::from_timestamp(item.published_at, 0) {
            hours[dt.hour() as usize] += 1;
        }
    }
    // Earliest hour wins ties
    hours
        .iter()
        .enumerate()
        .filter(|(_, c)| **c > 0)
        .fold(None, |best: Option<(u32, usize)>, (h, c)| match best {
            Some((_, bc)) if bc >= *c => best,
            _ => Some((h as u32, *c)),
        })
}

pub fn render_insights(items: &[Item]) -> String {
    let authors = top_counts(items.iter().map(|i| i.author.as_str()), TOP_AUTHORS);
    let tags = top_counts(
        items.iter().flat_map(|i| i.tags.iter().map(String::as_str)),
        TOP_TAGS,
    );

    let time = match peak_hour(items) {
        Some((hour, count)) => format!("{hour}:00 ({count}条)"),
        None => "无数据".to_string(),
    };

    let total = items.len().max(1);
    let lengths: Vec<usize> = items.iter().map(|i| i.content.chars().count()).collect();
    let avg = lengths.iter().sum::<usize>() as f64 / total as f64;
    let detailed = lengths.iter().filter(|l| **l > DETAILED_CONTENT_CHARS).count();
    let share = detailed as f64 / total as f64 * 100.0;

    format!(
        "## 深度分析\n\n\
         ### 内容分布\n\
         - 总项目数: {}\n\
         - 主要作者: {}\n\
         - 热门标签: {}\n\n\
         ### 时间趋势\n\
         内容发布高峰时间: {}\n\n\
         ### 内容质量评估\n\
         平均内容长度: {}字符\n\
         详细内容比例: {}%\n",
        items.len(),
        authors.join(", "),
        tags.join(", "),
        time,
        avg.round() as i64,
        share.round() as i64,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::default_analysis;
    use crate::storage::{NewSource, Schedule, SourceKind};
    use pretty_assertions::assert_eq;

    fn stored(id: i64, author: &str, published_at: i64, content: &str, tags: &[&str]) -> Item {
        Item {
            id,
            source_id: 1,
            url: format!("https://example.com/{id}"),
            title: format!("Item {id}"),
            author: author.to_string(),
            published_at,
            content: content.to_string(),
            content_sha: String::new(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            metadata: serde_json::json!({}),
            fetched_at: 0,
        }
    }

    // 2024-05-01T00:00:00Z
    const DAY: i64 = 1_714_521_600;

    #[test]
    fn test_day_window() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(day_window(date), (DAY, DAY + 86_399));
    }

    #[test]
    fn test_render_insights() {
        let items = vec![
            stored(1, "alice", DAY + 9 * 3600, &"x".repeat(150), &["ai", "rust"]),
            stored(2, "bob", DAY + 9 * 3600 + 60, "short", &["rust"]),
            stored(3, "alice", DAY + 14 * 3600, "tiny", &["db"]),
            stored(4, "carol", DAY + 14 * 3600, "", &[]),
        ];
        let md = render_insights(&items);
        assert!(md.contains("- 总项目数: 4\n"));
        assert!(md.contains("- 主要作者: alice, bob, carol\n"));
        assert!(md.contains("- 热门标签: rust, ai, db\n"));
        // 9:00 and 14:00 tie at two items; the earlier hour wins
        assert!(md.contains("内容发布高峰时间: 9:00 (2条)"));
        // (150 + 5 + 4 + 0) / 4 = 39.75
        assert!(md.contains("平均内容长度: 40字符"));
        assert!(md.contains("详细内容比例: 25%"));
    }

    #[test]
    fn test_render_summary_sections() {
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let analysis = default_analysis(&[], "Blog");
        let md = render_summary("Blog", date, &analysis);
        assert!(md.starts_with("# Blog - 2024-05-01 摘要\n\n## 📊 今日概览\n"));
        assert!(md.contains("## 🔍 关键洞察\n- 内容更新频繁"));
        assert!(md.contains("## 🎯 行动建议\n- 持续关注相关技术发展"));
    }

    async fn seeded_db() -> (Database, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let id = db
            .create_source(&NewSource {
                name: "Blog".to_string(),
                kind: SourceKind::Rss,
                handle: "https://example.com/feed".to_string(),
                schedule: Schedule::Daily,
                ai_focus: Some("databases".to_string()),
                policy_id: None,
            })
            .await
            .unwrap();
        (db, id)
    }

    fn normalized(url: &str, published_at: i64) -> NormalizedItem {
        NormalizedItem {
            url: url.to_string(),
            title: "Post".to_string(),
            author: "alice".to_string(),
            published_at,
            content: "Body".to_string(),
            tags: vec!["sqlite".to_string()],
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn test_empty_day_is_not_stored() {
        let (db, id) = seeded_db().await;
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let digest = generate_daily_digest(&db, &Analyzer::offline(), id, date)
            .await
            .unwrap();
        assert_eq!(digest.summary_md, EMPTY_SUMMARY);
        assert_eq!(digest.insights_md, EMPTY_INSIGHTS);
        assert!(digest.items.is_empty());
        assert_eq!(digest.id, None);
        assert!(db.get_digest(id, date).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_digest_covers_only_that_day_and_upserts() {
        let (db, id) = seeded_db().await;
        db.insert_items(
            id,
            &[
                normalized("https://example.com/in", DAY + 3600),
                normalized("https://example.com/before", DAY - 1),
                normalized("https://example.com/last-second", DAY + 86_399),
            ],
        )
        .await
        .unwrap();

        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let analyzer = Analyzer::offline();
        let first = generate_daily_digest(&db, &analyzer, id, date).await.unwrap();
        assert_eq!(first.items.len(), 1);
        assert_eq!(first.items[0].url, "https://example.com/in");
        assert!(first.summary_md.contains("今日从 Blog 获取了 1 条新内容"));

        let second = generate_daily_digest(&db, &analyzer, id, date).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.list_digests(Some(id), 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_errors() {
        let db = Database::open(":memory:").await.unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let err = generate_daily_digest(&db, &Analyzer::offline(), 9, date)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

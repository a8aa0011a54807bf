use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::json;

use super::http::{FetchError, Fetcher};
use crate::storage::NormalizedItem;
use crate::util::{decode_entities, strip_control_chars, strip_markup};

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";

impl Fetcher {
    /// Fetch an RSS or Atom feed.
    pub async fn fetch_feed(&self, handle: &str) -> Result<Vec<NormalizedItem>, FetchError> {
        let bytes = self.get_bytes(handle, FEED_ACCEPT).await?;
        parse_feed_document(&bytes, handle)
    }
}

/// Normalize a feed document.
///
/// `feed-rs` handles well-formed RSS/Atom/JSON Feed. Documents it rejects go
/// through a lenient block scraper; if that finds no entries either, the
/// document is reported as a parse error.
pub fn parse_feed_document(bytes: &[u8], handle: &str) -> Result<Vec<NormalizedItem>, FetchError> {
    let github_tags = github_feed_tags(handle);

    match feed_rs::parser::parse(bytes) {
        Ok(feed) => {
            let mut skipped = 0usize;
            let items: Vec<NormalizedItem> = feed
                .entries
                .into_iter()
                .filter_map(|entry| {
                    let item = normalize_entry(entry, handle, github_tags);
                    if item.is_none() {
                        skipped += 1;
                    }
                    item
                })
                .collect();
            if skipped > 0 {
                tracing::warn!(feed = %handle, skipped = skipped, "Entries without title or link skipped");
            }
            Ok(items)
        }
        Err(parse_err) => {
            let text = String::from_utf8_lossy(bytes);
            let items = scrape_feed(&text, handle);
            if items.is_empty() {
                return Err(FetchError::Parse(parse_err.to_string()));
            }
            tracing::debug!(
                feed = %handle,
                error = %parse_err,
                items = items.len(),
                "Strict feed parse failed, recovered entries with lenient scraper"
            );
            Ok(items)
        }
    }
}

/// Extra tags for GitHub's per-repository Atom feeds.
fn github_feed_tags(handle: &str) -> &'static [&'static str] {
    if !handle.contains("github.com") {
        return &[];
    }
    if handle.contains("commits.atom") || handle.contains("/commits/") {
        &["commit", "github"]
    } else if handle.contains("releases.atom") {
        &["release", "github"]
    } else {
        &[]
    }
}

fn merge_tags(mut tags: Vec<String>, extra: &[&str]) -> Vec<String> {
    for tag in extra {
        if !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    tags
}

/// feed-rs reports Atom `html`/`xhtml` and RSS descriptions as `text/html`.
fn is_markup(content_type: &impl std::fmt::Display) -> bool {
    let ty = content_type.to_string();
    let essence = ty.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("text/html") || essence.eq_ignore_ascii_case("application/xhtml+xml")
}

/// feed-rs has already decoded entities, so plain text keeps any literal `<`.
fn text_body(content: &str, markup: bool) -> String {
    if markup {
        strip_markup(content)
    } else {
        strip_control_chars(content.trim()).into_owned()
    }
}

fn normalize_entry(
    entry: feed_rs::model::Entry,
    handle: &str,
    github_tags: &[&str],
) -> Option<NormalizedItem> {
    let title = entry
        .title
        .map(|t| text_body(&t.content, is_markup(&t.content_type)))
        .filter(|t| !t.is_empty())?;
    let url = entry
        .links
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
        .or_else(|| entry.links.first())
        .map(|l| l.href.trim().to_string())
        .filter(|u| !u.is_empty())?;

    let author = entry
        .authors
        .first()
        .map(|p| p.name.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "Unknown".to_string());

    let published_at = entry
        .published
        .or(entry.updated)
        .map_or_else(|| Utc::now().timestamp(), |d| d.timestamp());

    let body = entry
        .content
        .and_then(|c| {
            let markup = is_markup(&c.content_type);
            c.body.map(|b| text_body(&b, markup))
        })
        .filter(|b| !b.is_empty())
        .or_else(|| {
            entry
                .summary
                .map(|s| text_body(&s.content, is_markup(&s.content_type)))
        })
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| title.clone());

    let categories = entry
        .categories
        .into_iter()
        .map(|c| c.term.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    Some(NormalizedItem {
        url,
        title,
        author,
        published_at,
        content: body,
        tags: merge_tags(categories, github_tags),
        metadata: json!({ "type": "rss_item", "source": handle, "guid": entry.id }),
    })
}

// ============================================================================
// Lenient scraper
// ============================================================================

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

fn entry_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?is)<entry\b[^>]*>(.*?)</entry>")
}

fn item_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?is)<item\b[^>]*>(.*?)</item>")
}

fn title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?is)<title\b[^>]*>(.*?)</title>")
}

fn link_href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r#"(?is)<link\b[^>]*\bhref\s*=\s*["']([^"']+)["']"#)
}

fn link_text_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(&RE, r"(?is)<link\b[^>]*>(.*?)</link>")
}

fn author_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?is)<author\b[^>]*>\s*<name\b[^>]*>(.*?)</name>|<dc:creator\b[^>]*>(.*?)</dc:creator>",
    )
}

fn date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?is)<updated\b[^>]*>(.*?)</updated>|<published\b[^>]*>(.*?)</published>|<pubDate\b[^>]*>(.*?)</pubDate>",
    )
}

fn content_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r"(?is)<content\b[^>]*>(.*?)</content>|<summary\b[^>]*>(.*?)</summary>|<description\b[^>]*>(.*?)</description>",
    )
}

fn category_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    re(
        &RE,
        r#"(?is)<category\b[^>]*\bterm\s*=\s*["']([^"']+)["'][^>]*/?>|<category\b[^>]*>(.*?)</category>"#,
    )
}

/// First non-empty capture group of the first match.
fn first_capture<'a>(re: &Regex, block: &'a str) -> Option<&'a str> {
    re.captures(block).and_then(|caps| {
        caps.iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str())
            .find(|s| !s.trim().is_empty())
    })
}

fn unwrap_cdata(s: &str) -> &str {
    let t = s.trim();
    t.strip_prefix("<![CDATA[")
        .and_then(|inner| inner.strip_suffix("]]>"))
        .unwrap_or(t)
}

/// Strip tags, then decode entities once.
fn clean_text(raw: &str) -> String {
    strip_markup(unwrap_cdata(raw))
}

fn parse_date(raw: &str) -> Option<i64> {
    let s = raw.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()
        .map(|d| d.timestamp())
}

/// Pull `<entry>` (Atom) or else `<item>` (RSS) blocks out of a document too
/// broken for a strict parser.
pub(crate) fn scrape_feed(text: &str, handle: &str) -> Vec<NormalizedItem> {
    let github_tags = github_feed_tags(handle);
    let blocks: Vec<&str> = {
        let entries: Vec<&str> = entry_re()
            .captures_iter(text)
            .filter_map(|c| c.get(1).map(|m| m.as_str()))
            .collect();
        if entries.is_empty() {
            item_re()
                .captures_iter(text)
                .filter_map(|c| c.get(1).map(|m| m.as_str()))
                .collect()
        } else {
            entries
        }
    };

    let now = Utc::now().timestamp();
    blocks
        .into_iter()
        .filter_map(|block| {
            let title = first_capture(title_re(), block).map(clean_text)?;
            if title.is_empty() {
                return None;
            }
            let url = first_capture(link_href_re(), block)
                .or_else(|| first_capture(link_text_re(), block))
                .map(|l| decode_entities(unwrap_cdata(l)).trim().to_string())
                .filter(|l| !l.is_empty())?;

            let author = first_capture(author_re(), block)
                .map(clean_text)
                .filter(|a| !a.is_empty())
                .unwrap_or_else(|| "Unknown".to_string());
            let published_at = first_capture(date_re(), block)
                .and_then(parse_date)
                .unwrap_or(now);
            let content = first_capture(content_re(), block)
                .map(clean_text)
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| title.clone());
            let categories = category_re()
                .captures_iter(block)
                .filter_map(|c| c.get(1).or_else(|| c.get(2)))
                .map(|m| clean_text(m.as_str()))
                .filter(|t| !t.is_empty())
                .collect();

            Some(NormalizedItem {
                url,
                title,
                author,
                published_at,
                content,
                tags: merge_tags(categories, github_tags),
                metadata: json!({ "type": "rss_item", "source": handle }),
            })
        })
        .collect()
}

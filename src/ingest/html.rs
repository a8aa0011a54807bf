use std::sync::OnceLock;

use chrono::Utc;
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;
use serde_json::json;

use super::http::{FetchError, Fetcher};
use crate::storage::NormalizedItem;
use crate::util::{decode_entities, github_blob_to_raw, strip_markup, truncate_chars};

const HTML_ACCEPT: &str = "text/html, text/markdown;q=0.9, text/plain;q=0.8, */*;q=0.5";

/// Page bodies are cut to this many characters.
pub const MAX_PAGE_CHARS: usize = 10_000;

impl Fetcher {
    /// Fetch an HTML page or README.
    ///
    /// GitHub `blob` URLs are fetched from `raw.githubusercontent.com` so the
    /// markdown arrives without GitHub's page chrome.
    pub async fn fetch_html(&self, handle: &str) -> Result<Vec<NormalizedItem>, FetchError> {
        let fetch_url = github_blob_to_raw(handle);
        if fetch_url != handle {
            tracing::debug!(from = %handle, to = %fetch_url, "Rewrote GitHub blob URL to raw content");
        }
        let bytes = self.get_bytes(&fetch_url, HTML_ACCEPT).await?;
        let text = String::from_utf8_lossy(&bytes);
        Ok(parse_page(&text, handle))
    }
}

/// Turn a fetched page into items: one per paper in a "Papers last week"
/// section, otherwise a single item for the whole page.
pub fn parse_page(text: &str, page_url: &str) -> Vec<NormalizedItem> {
    if let Some(section) = find_papers_section(text) {
        let items = paper_items(&section, page_url);
        if !items.is_empty() {
            return items;
        }
    }
    vec![page_item(text, page_url)]
}

// ============================================================================
// README paper sections
// ============================================================================

#[derive(Debug, PartialEq)]
struct PapersSection<'a> {
    update_date: Option<String>,
    body: &'a str,
}

fn section_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(?:Papers last week, updated on ([^:\n]+)|Papers last week[^:\n]*|Latest papers[^:\n]*|Recent papers[^:\n]*):",
        )
        .expect("static regex")
    })
}

fn bullet_split_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\*\s*").expect("static regex"))
}

/// Locate the section and cut it at the first blank line or `##` heading.
fn find_papers_section(text: &str) -> Option<PapersSection<'_>> {
    let caps = section_heading_re().captures(text)?;
    let whole = caps.get(0)?;
    let update_date = caps.get(1).map(|m| m.as_str().trim().to_string());

    let rest = &text[whole.end()..];
    // The heading line may end in trailing spaces before its break
    let leading = rest.len() - rest.trim_start_matches([' ', '\t', '\r']).len();
    let rest = &rest[leading..];
    // Skip the newline that ends the heading itself
    let rest = rest.strip_prefix('\n').unwrap_or(rest);

    let end = ["\n\n", "\n\r\n", "\n##"]
        .iter()
        .filter_map(|marker| rest.find(marker))
        .min()
        .unwrap_or(rest.len());
    let body = rest[..end].trim();
    if body.is_empty() {
        return None;
    }
    Some(PapersSection { update_date, body })
}

/// Links in a markdown fragment, as `(text, destination)`.
fn markdown_links(markdown: &str) -> Vec<(String, String)> {
    let mut links = Vec::new();
    let mut current: Option<(String, String)> = None;

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Link { dest_url, .. }) => {
                current = Some((String::new(), dest_url.to_string()));
            }
            Event::Text(t) | Event::Code(t) => {
                if let Some((text, _)) = current.as_mut() {
                    text.push_str(&t);
                }
            }
            Event::End(TagEnd::Link) => {
                if let Some(link) = current.take() {
                    links.push(link);
                }
            }
            _ => {}
        }
    }
    links
}

/// Markdown reduced to its visible text.
fn markdown_text(markdown: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    for event in Parser::new(markdown) {
        match event {
            Event::Text(t) | Event::Code(t) => out.push_str(&t),
            Event::SoftBreak | Event::HardBreak => out.push(' '),
            Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item) => out.push('\n'),
            Event::Html(h) | Event::InlineHtml(h) => out.push_str(&strip_markup(&h)),
            _ => {}
        }
    }
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn paper_items(section: &PapersSection<'_>, page_url: &str) -> Vec<NormalizedItem> {
    let now = Utc::now().timestamp();
    let body = format!("\n{}", section.body);

    bullet_split_re()
        .split(&body)
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .filter_map(|(index, entry)| {
            let first_line = entry.lines().map(str::trim).find(|l| !l.is_empty())?;
            let title = markdown_text(first_line);
            let title = if title.is_empty() {
                first_line.to_string()
            } else {
                title
            };

            let links = markdown_links(entry);
            let url = links
                .first()
                .map(|(_, dest)| dest.clone())
                .unwrap_or_else(|| format!("{}#paper-{}", page_url, index + 1));

            Some(NormalizedItem {
                url,
                title,
                author: "Unknown".to_string(),
                published_at: now,
                content: entry.to_string(),
                tags: vec!["paper".to_string(), "readme".to_string()],
                metadata: json!({
                    "type": "readme_paper",
                    "update_date": section.update_date,
                    "links": links
                        .iter()
                        .map(|(text, dest)| json!({ "text": text, "url": dest }))
                        .collect::<Vec<_>>(),
                }),
            })
        })
        .collect()
}

// ============================================================================
// Whole-page items
// ============================================================================

fn html_title_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title>").expect("static regex"))
}

fn looks_like_html(text: &str) -> bool {
    let head = truncate_chars(text.trim_start(), 512).to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.contains("<html") || head.contains("<head")
}

fn is_readme(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("readme") || lower.ends_with(".md") || lower.contains("raw.githubusercontent.com")
}

/// First markdown heading of any level.
fn first_heading(markdown: &str) -> Option<String> {
    let mut in_heading = false;
    let mut text = String::new();
    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { .. }) => in_heading = true,
            Event::Text(t) | Event::Code(t) if in_heading => text.push_str(&t),
            Event::End(TagEnd::Heading(_)) if in_heading => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
                in_heading = false;
                text.clear();
            }
            _ => {}
        }
    }
    None
}

fn page_item(text: &str, page_url: &str) -> NormalizedItem {
    let readme = is_readme(page_url);
    let html = looks_like_html(text);

    let title = if html {
        html_title_re()
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| strip_markup(&decode_entities(m.as_str())))
            .filter(|t| !t.is_empty())
    } else {
        first_heading(text)
    };
    let title = title.unwrap_or_else(|| {
        if readme {
            "README".to_string()
        } else {
            page_url.to_string()
        }
    });

    let body = if html {
        strip_markup(text)
    } else {
        markdown_text(text)
    };
    let content = truncate_chars(&body, MAX_PAGE_CHARS).to_string();

    NormalizedItem {
        url: page_url.to_string(),
        title,
        author: "Unknown".to_string(),
        published_at: Utc::now().timestamp(),
        content,
        tags: vec![if readme { "readme" } else { "html" }.to_string()],
        metadata: json!({ "type": if readme { "readme" } else { "html_page" } }),
    }
}

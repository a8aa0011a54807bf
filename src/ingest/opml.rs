//! OPML subscription import: feeds become sources, folders become categories.

use std::collections::HashMap;

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

use crate::storage::{Database, NewSource, Schedule, SourceKind};
use crate::util::{parse_github_repo, validate_url};

/// SEC-003: Maximum allowed nesting depth for OPML outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// SEC-003: OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    #[error("XML parse error: {0}")]
    XmlParse(String),

    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A subscription extracted from an OPML `<outline xmlUrl=...>`.
#[derive(Debug, Clone, PartialEq)]
pub struct OpmlSource {
    /// `title`, else `text`, else the URL.
    pub name: String,
    pub handle: String,
    pub kind: SourceKind,
    /// Title of the innermost enclosing folder outline.
    pub folder: Option<String>,
}

/// What an import added.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub sources: usize,
    pub categories_created: usize,
}

/// Parse an OPML file from disk.
///
/// # Security
///
/// - SEC-002: quick-xml (0.37) never expands `<!ENTITY>` declarations, so XXE
///   payloads either fail to decode or stay literal.
/// - URLs pointing at localhost, private ranges or non-HTTP schemes are skipped.
pub async fn parse(path: &str) -> Result<Vec<OpmlSource>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path))?;
    parse_opml_content(&content)
}

/// Pick a fetcher for an imported URL. An explicit `type` attribute naming a
/// known kind wins; GitHub repository roots and `.md` files are recognized.
fn infer_kind(handle: &str, type_attr: Option<&str>) -> SourceKind {
    if let Some(kind) = type_attr.and_then(|t| t.parse().ok()) {
        if kind != SourceKind::Rss {
            return kind;
        }
    }
    let lower = handle.to_ascii_lowercase();
    if lower.ends_with(".md") {
        SourceKind::Html
    } else if parse_github_repo(handle).is_some()
        && !lower.contains(".atom")
        && !lower.contains("/blob/")
    {
        SourceKind::GithubRepo
    } else {
        SourceKind::Rss
    }
}

fn parse_opml_content(content: &str) -> Result<Vec<OpmlSource>> {
    // SEC-002: decode_and_unescape_value() only resolves the 5 XML builtins;
    // custom entities produce EscapeError::UnrecognizedEntity.
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut sources = Vec::new();
    let mut buf = Vec::new();
    // One entry per open <outline>: Some(title) for folders, None for feeds
    let mut folders: Vec<Option<String>> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if folders.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                let outline = parse_outline_attributes(&e, &reader)?;
                match outline {
                    Outline::Feed(mut source) => {
                        source.folder = innermost_folder(&folders);
                        sources.push(*source);
                        folders.push(None);
                    }
                    Outline::Folder(title) => folders.push(title),
                    Outline::Skipped => folders.push(None),
                }
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                if let Outline::Feed(mut source) = parse_outline_attributes(&e, &reader)? {
                    source.folder = innermost_folder(&folders);
                    sources.push(*source);
                }
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                folders.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(sources)
}

fn innermost_folder(folders: &[Option<String>]) -> Option<String> {
    folders.iter().rev().find_map(|f| f.clone())
}

enum Outline {
    Feed(Box<OpmlSource>),
    Folder(Option<String>),
    /// Feed outline whose URL failed validation.
    Skipped,
}

fn parse_outline_attributes(
    e: &quick_xml::events::BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Outline> {
    let mut xml_url = None;
    let mut title = None;
    let mut text = None;
    let mut type_attr = None;

    for attr_result in e.attributes() {
        let attr = match attr_result {
            Ok(attr) => attr,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                continue;
            }
        };
        let decoder = reader.decoder();
        match attr.key.as_ref() {
            b"xmlUrl" => xml_url = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"title" => title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"text" => text = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"type" => type_attr = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            _ => {}
        }
    }

    let label = title
        .or(text)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty());

    let Some(url) = xml_url else {
        return Ok(Outline::Folder(label));
    };

    match validate_url(&url) {
        Ok(_) => Ok(Outline::Feed(Box::new(OpmlSource {
            name: label.unwrap_or_else(|| url.clone()),
            kind: infer_kind(&url, type_attr.as_deref()),
            handle: url,
            folder: None,
        }))),
        Err(e) => {
            tracing::warn!(url = %url, error = %e, "Skipping invalid feed URL");
            Ok(Outline::Skipped)
        }
    }
}

/// Register parsed subscriptions, creating root categories for their folders.
///
/// Handles already registered are kept (and still linked to their folder's
/// category). Folder names match existing root categories case-sensitively.
pub async fn import_sources(db: &Database, entries: &[OpmlSource]) -> Result<ImportSummary> {
    let new_sources: Vec<NewSource> = entries
        .iter()
        .map(|e| NewSource {
            name: e.name.clone(),
            kind: e.kind,
            handle: e.handle.clone(),
            schedule: Schedule::Daily,
            ai_focus: None,
            policy_id: None,
        })
        .collect();
    let ids = db.create_sources_batch(&new_sources).await?;

    let mut by_name: HashMap<String, i64> = db
        .get_categories_tree()
        .await?
        .into_iter()
        .filter(|c| c.parent_id.is_none())
        .map(|c| (c.name, c.id))
        .collect();

    let mut summary = ImportSummary {
        sources: ids.len(),
        categories_created: 0,
    };

    for (entry, source_id) in entries.iter().zip(ids) {
        let Some(folder) = entry.folder.as_deref() else {
            continue;
        };
        let category_id = match by_name.get(folder) {
            Some(id) => *id,
            None => {
                let id = db.create_category(folder, None).await?;
                summary.categories_created += 1;
                by_name.insert(folder.to_string(), id);
                id
            }
        };
        db.assign_source_category(source_id, category_id).await?;
    }

    tracing::info!(
        sources = summary.sources,
        categories = summary.categories_created,
        "Imported OPML subscriptions"
    );
    Ok(summary)
}

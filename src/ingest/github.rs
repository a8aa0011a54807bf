//! GitHub repository sources: repository info, recent commits and releases.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::http::{FetchError, Fetcher};
use crate::storage::NormalizedItem;
use crate::util::parse_github_repo;

const GITHUB_ACCEPT: &str = "application/vnd.github+json";
const COMMITS_PER_PAGE: u32 = 10;
const RELEASES_PER_PAGE: u32 = 5;

#[derive(Debug, Deserialize)]
struct RepoOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    name: String,
    html_url: String,
    description: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    language: Option<String>,
    #[serde(default)]
    topics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    name: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
    author: Option<CommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    sha: String,
    html_url: String,
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct ReleaseEntry {
    html_url: String,
    name: Option<String>,
    tag_name: String,
    author: Option<RepoOwner>,
    published_at: Option<DateTime<Utc>>,
    body: Option<String>,
}

impl Fetcher {
    /// Fetch repository info, the latest commits and the latest releases.
    ///
    /// Only the repository request is fatal; commit and release failures
    /// yield no items for that part.
    pub async fn fetch_github_repo(&self, handle: &str) -> Result<Vec<NormalizedItem>, FetchError> {
        let normalized = if handle.contains("://") {
            handle.trim().to_string()
        } else {
            format!("https://{}", handle.trim())
        };
        let repo = parse_github_repo(&normalized)
            .ok_or_else(|| FetchError::InvalidGithubUrl(handle.to_string()))?;
        let base = format!("{}/repos/{}/{}", self.github_api_base, repo.owner, repo.repo);

        let info: RepoInfo = self.get_json(&base, GITHUB_ACCEPT).await?;

        let commits: Vec<CommitEntry> = match self
            .get_json(&format!("{base}/commits?per_page={COMMITS_PER_PAGE}"), GITHUB_ACCEPT)
            .await
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(repo = %base, error = %e, "Failed to fetch commits, continuing without them");
                Vec::new()
            }
        };

        let releases: Vec<ReleaseEntry> = match self
            .get_json(&format!("{base}/releases?per_page={RELEASES_PER_PAGE}"), GITHUB_ACCEPT)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(repo = %base, error = %e, "Failed to fetch releases, continuing without them");
                Vec::new()
            }
        };

        let items = build_items(&repo.owner, info, commits, releases);
        tracing::debug!(repo = %base, items = items.len(), "Fetched GitHub repository");
        Ok(items)
    }
}

fn build_items(
    owner: &str,
    info: RepoInfo,
    commits: Vec<CommitEntry>,
    releases: Vec<ReleaseEntry>,
) -> Vec<NormalizedItem> {
    let now = Utc::now().timestamp();
    let mut items = Vec::with_capacity(1 + commits.len() + releases.len());

    items.push(NormalizedItem {
        url: info.html_url,
        title: format!("Repository Update: {}", info.name),
        author: owner.to_string(),
        published_at: info.updated_at.map_or(now, |d| d.timestamp()),
        content: info
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| "No description available".to_string()),
        tags: info.topics,
        metadata: json!({
            "stars": info.stargazers_count,
            "forks": info.forks_count,
            "language": info.language,
            "type": "repository_info",
        }),
    });

    for entry in commits {
        let first_line = entry.commit.message.lines().next().unwrap_or("").trim().to_string();
        let (author, date) = match entry.commit.author {
            Some(a) => (a.name, a.date),
            None => (None, None),
        };
        items.push(NormalizedItem {
            url: entry.html_url,
            title: format!("Commit: {}", first_line),
            author: author.unwrap_or_else(|| "Unknown".to_string()),
            published_at: date.map_or(now, |d| d.timestamp()),
            content: entry.commit.message,
            tags: vec!["commit".to_string()],
            metadata: json!({ "sha": entry.sha, "type": "commit" }),
        });
    }

    for release in releases {
        let name = release
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| release.tag_name.clone());
        items.push(NormalizedItem {
            url: release.html_url,
            title: format!("Release: {}", name),
            author: release
                .author
                .map(|a| a.login)
                .unwrap_or_else(|| "Unknown".to_string()),
            published_at: release.published_at.map_or(now, |d| d.timestamp()),
            content: release
                .body
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| "No release notes".to_string()),
            tags: vec!["release".to_string()],
            metadata: json!({ "tag_name": release.tag_name, "type": "release" }),
        });
    }

    items
}

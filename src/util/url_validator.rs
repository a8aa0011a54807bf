use std::net::IpAddr;
use thiserror::Error;
use url::Url;

/// Errors that can occur during URL validation.
///
/// Parsing failures plus the security policy that keeps source handles from
/// pointing the fetcher at internal services (SSRF).
#[derive(Error, Debug)]
pub enum UrlValidationError {
    /// The URL string could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The URL uses a scheme other than http or https.
    #[error("Unsupported scheme: {0} (only http/https allowed)")]
    UnsupportedScheme(String),
    /// The URL points to a private/internal IP address.
    #[error("Private IP address not allowed: {0}")]
    PrivateIp(String),
    /// The URL points to localhost.
    #[error("Localhost not allowed")]
    Localhost,
}

/// Validates a URL string for use as a source handle.
///
/// Rejects non-HTTP(S) schemes, localhost and private/link-local ranges.
///
/// ```
/// use newsintel::util::validate_url;
///
/// assert!(validate_url("https://example.com/feed.xml").is_ok());
/// assert!(validate_url("http://localhost/feed").is_err());
/// assert!(validate_url("http://192.168.1.1/feed").is_err());
/// assert!(validate_url("file:///etc/passwd").is_err());
/// ```
pub fn validate_url(url_str: &str) -> Result<Url, UrlValidationError> {
    let url = Url::parse(url_str.trim())?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => return Err(UrlValidationError::UnsupportedScheme(scheme.to_owned())),
    }

    if let Some(host) = url.host_str() {
        if host.eq_ignore_ascii_case("localhost") {
            return Err(UrlValidationError::Localhost);
        }

        let bare = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if let Ok(ip) = bare.parse::<IpAddr>() {
            if ip.is_loopback() {
                return Err(UrlValidationError::Localhost);
            }
            if is_private_ip(&ip) {
                return Err(UrlValidationError::PrivateIp(ip.to_string()));
            }
        }
    }

    Ok(url)
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local() || v4.is_unspecified(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            // fc00::/7 unique local, fe80::/10 link local
            v6.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Owner and repository name parsed out of a GitHub URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRepo {
    pub owner: String,
    pub repo: String,
}

/// Extract `owner/repo` from anything under `github.com/<owner>/<repo>`.
///
/// Extra path segments (`/blob/main/README.md`, `/commits.atom`) and a
/// trailing `.git` are ignored. Returns `None` for non-GitHub URLs.
pub fn parse_github_repo(handle: &str) -> Option<GithubRepo> {
    let url = Url::parse(handle.trim()).ok()?;
    let host = url.host_str()?;
    if !host.eq_ignore_ascii_case("github.com") && !host.eq_ignore_ascii_case("www.github.com") {
        return None;
    }

    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?.to_string();
    let repo = segments.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    // "commits.atom" style URLs put the feed name where a repo would be
    if repo.is_empty() || repo.ends_with(".atom") {
        return None;
    }

    Some(GithubRepo {
        owner,
        repo: repo.to_string(),
    })
}

/// Rewrite `github.com/<o>/<r>/blob/<ref>/<path>` to its raw content URL.
///
/// Other URLs are returned unchanged.
pub fn github_blob_to_raw(handle: &str) -> String {
    let Ok(url) = Url::parse(handle.trim()) else {
        return handle.to_string();
    };
    if url.host_str() != Some("github.com") {
        return handle.to_string();
    }

    let segments: Vec<&str> = match url.path_segments() {
        Some(s) => s.collect(),
        None => return handle.to_string(),
    };

    match segments.as_slice() {
        [owner, repo, "blob", reference, path @ ..] if !path.is_empty() => format!(
            "https://raw.githubusercontent.com/{}/{}/{}/{}",
            owner,
            repo,
            reference,
            path.join("/")
        ),
        _ => handle.to_string(),
    }
}

use std::time::Duration;

use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::config::Config;

/// Hard cap on any fetched body.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching and normalizing a source.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the per-request timeout
    #[error("Request timed out")]
    Timeout,
    /// Document could not be parsed as the expected format
    #[error("Parse error: {0}")]
    Parse(String),
    /// Handle of a `github_repo` source does not name a repository
    #[error("Invalid GitHub repository URL: {0}")]
    InvalidGithubUrl(String),
    /// No source with this ID
    #[error("Source {0} not found")]
    SourceNotFound(i64),
    /// Database operation failed while loading the source or storing items
    #[error("Database error: {0}")]
    Database(String),
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    /// Response body exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Response was incomplete (received fewer bytes than Content-Length)
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
}

/// Retry schedule for 429, 5xx and truncated responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Delay before the first retry; doubles each attempt (2s, 4s, 8s by default).
    pub base_delay: Duration,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub(crate) fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Shared HTTP client plus the endpoints and credentials the fetchers need.
#[derive(Clone)]
pub struct Fetcher {
    pub(crate) client: reqwest::Client,
    pub(crate) retry: RetryPolicy,
    pub(crate) github_api_base: String,
    pub(crate) github_token: Option<SecretString>,
}

impl Fetcher {
    pub fn new(
        user_agent: &str,
        retry: RetryPolicy,
        github_api_base: &str,
        github_token: Option<SecretString>,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(retry.timeout)
            .build()?;
        Ok(Self {
            client,
            retry,
            github_api_base: github_api_base.trim_end_matches('/').to_string(),
            github_token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        let retry = RetryPolicy {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
            timeout: config.request_timeout(),
        };
        Self::new(
            &config.user_agent,
            retry,
            &config.github_api_base,
            config.github_token(),
        )
    }

    /// GET `url` with retry/backoff, returning the (size-limited) body.
    pub(crate) async fn get_bytes(&self, url: &str, accept: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry_count = 0;

        loop {
            let mut request = self.client.get(url).header(reqwest::header::ACCEPT, accept);
            if let Some(token) = &self.github_token {
                // Only the API host ever sees the token
                if url.starts_with(&self.github_api_base) {
                    request = request.bearer_auth(token.expose_secret());
                }
            }

            let response = tokio::time::timeout(self.retry.timeout, request.send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(|e| {
                    if e.is_timeout() {
                        FetchError::Timeout
                    } else {
                        FetchError::Network(e)
                    }
                })?;

            let status = response.status();

            // EDGE-004: Rate limiting with exponential backoff
            if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                if retry_count >= self.retry.max_retries {
                    return Err(FetchError::RateLimited(self.retry.max_retries));
                }
                let delay = self.retry.delay_for(retry_count);
                tracing::warn!(
                    url = %url,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            if status.is_server_error() {
                if retry_count >= self.retry.max_retries {
                    return Err(FetchError::HttpStatus(status.as_u16()));
                }
                let delay = self.retry.delay_for(retry_count);
                tracing::warn!(
                    url = %url,
                    status = %status,
                    retry = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "Server error, retrying after delay"
                );
                tokio::time::sleep(delay).await;
                retry_count += 1;
                continue;
            }

            // 4xx fails immediately
            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }

            match read_limited_bytes(response, MAX_BODY_SIZE).await {
                Ok(bytes) => return Ok(bytes),
                Err(FetchError::IncompleteResponse { expected, received }) => {
                    // EDGE-005: Retry truncated downloads
                    if retry_count >= self.retry.max_retries {
                        return Err(FetchError::IncompleteResponse { expected, received });
                    }
                    let delay = self.retry.delay_for(retry_count);
                    tracing::debug!(
                        url = %url,
                        expected = expected,
                        received = received,
                        attempt = retry_count + 1,
                        "Retrying incomplete download"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// GET and deserialize a JSON document.
    pub(crate) async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        accept: &str,
    ) -> Result<T, FetchError> {
        let bytes = self.get_bytes(url, accept).await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Parse(format!("{url}: {e}")))
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: check Content-Length header
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        // A connection closed mid-body surfaces as a body/decode error
        let chunk = chunk.map_err(|e| {
            if e.is_body() || e.is_decode() {
                FetchError::IncompleteResponse {
                    expected: expected_length.unwrap_or(0),
                    received: bytes.len(),
                }
            } else {
                FetchError::Network(e)
            }
        })?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}

#[cfg(test)]
pub(crate) fn test_fetcher(api_base: &str) -> Fetcher {
    let retry = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_millis(1),
        timeout: Duration::from_secs(5),
    };
    Fetcher::new("newsintel-test/1.0", retry, api_base, None).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use wiremock::matchers::{any, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_404_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = test_fetcher(&server.uri());
        let err = fetcher
            .get_bytes(&format!("{}/feed", server.uri()), "*/*")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(404)));
    }

    #[tokio::test]
    async fn test_500_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(4) // Initial request + 3 retries
            .mount(&server)
            .await;

        let fetcher = test_fetcher(&server.uri());
        let err = fetcher
            .get_bytes(&format!("{}/feed", server.uri()), "*/*")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus(500)));
    }

    #[tokio::test]
    async fn test_503_then_success() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let fetcher = test_fetcher(&server.uri());
        let body = fetcher
            .get_bytes(&format!("{}/feed", server.uri()), "*/*")
            .await
            .unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn test_429_exhausts_into_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let fetcher = test_fetcher(&server.uri());
        let err = fetcher
            .get_bytes(&format!("{}/feed", server.uri()), "*/*")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RateLimited(3)));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![b'a'; MAX_BODY_SIZE + 1]))
            .mount(&server)
            .await;

        let fetcher = test_fetcher(&server.uri());
        let err = fetcher
            .get_bytes(&format!("{}/big", server.uri()), "*/*")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::ResponseTooLarge));
    }

    #[tokio::test]
    async fn test_token_sent_only_to_api_host() {
        let api = MockServer::start().await;
        Mock::given(path("/repos/a/b"))
            .and(header("authorization", "Bearer ghp_test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&api)
            .await;

        let retry = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
        };
        let fetcher = Fetcher::new(
            "t",
            retry,
            &api.uri(),
            Some(SecretString::from("ghp_test".to_string())),
        )
        .unwrap();
        fetcher
            .get_bytes(&format!("{}/repos/a/b", api.uri()), "application/json")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_truncated_body_is_retried() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&connections);
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                seen.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\nhello")
                    .await;
                let _ = socket.shutdown().await;
            }
        });

        let fetcher = test_fetcher(&format!("http://{addr}"));
        let err = fetcher
            .get_bytes(&format!("http://{addr}/feed"), "*/*")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FetchError::IncompleteResponse { expected: 100, .. }
        ));
        // Initial request + 3 retries
        assert_eq!(connections.load(Ordering::SeqCst), 4);
    }
}

//! Source fetching and normalization.
//!
//! Every source kind is turned into a list of [`NormalizedItem`]s:
//!
//! - [`feed`] - RSS/Atom via `feed-rs`, with a lenient regex scraper for
//!   documents it rejects
//! - [`github`] - repository info, commits and releases from the GitHub API
//! - [`html`] - HTML pages and README files, including weekly paper lists
//! - [`opml`] - subscription import
//!
//! [`pipeline`] ties a fetch to storage: fetch runs, deduplication and the
//! per-source circuit breaker.

mod feed;
mod github;
mod html;
mod http;
pub mod opml;
mod pipeline;

pub use crate::storage::{NormalizedItem, SourceKind};
pub use feed::parse_feed_document;
pub use html::parse_page;
pub use http::{FetchError, Fetcher, RetryPolicy, MAX_BODY_SIZE};
pub use pipeline::{
    fetch_all, fetch_and_save, fetch_history, FetchOutcome, FetchResult,
    DEFAULT_FETCH_CONCURRENCY,
};

//! Utility functions shared by ingestion, analysis and the CLI.
//!
//! - **URL handling**: SSRF-safe validation of source handles plus the
//!   GitHub-specific URL rewrites the fetchers rely on
//! - **Text processing**: control-character stripping, markup removal,
//!   entity decoding and width/char-aware truncation
//!
//! # Examples
//!
//! ```
//! use newsintel::util::{parse_github_repo, strip_markup, truncate_chars};
//!
//! let repo = parse_github_repo("https://github.com/rust-lang/rust").unwrap();
//! assert_eq!(repo.owner, "rust-lang");
//!
//! assert_eq!(strip_markup("<p>Hello <b>world</b></p>"), "Hello world");
//! assert_eq!(truncate_chars("abcdef", 3), "abc");
//! ```

mod text;
mod url_validator;

pub use text::{
    decode_entities, display_width, strip_control_chars, strip_markup, truncate_chars,
    truncate_to_width,
};
pub use url_validator::{
    github_blob_to_raw, parse_github_repo, validate_url, GithubRepo, UrlValidationError,
};

/// Lowercase hex SHA-256 of `input`.
pub fn sha256_hex(input: &str) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_hex_is_lowercase_64_chars() {
        let h = sha256_hex("https://example.com/1Title body");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}

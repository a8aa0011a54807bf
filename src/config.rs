//! Configuration file parser for ~/.config/newsintel/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde but logged as warnings so typos surface.
//! API keys in the environment (`OPENAI_API_KEY`, `CLAUDE_API_KEY`,
//! `GITHUB_TOKEN`) take precedence over the file.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("HOME environment variable not set")]
    NoHome,
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// SEC-015: Custom Debug impl masks every API key and token.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database location. `None` → `<config dir>/newsintel.db`.
    pub database_path: Option<PathBuf>,

    /// User-Agent sent to GitHub and feed hosts.
    pub user_agent: String,

    /// Per-request timeout for source fetches.
    pub request_timeout_secs: u64,

    /// Retries for 429/5xx/truncated responses.
    pub max_retries: u32,

    /// First backoff delay; doubles on each retry.
    pub retry_base_delay_ms: u64,

    /// Sources fetched simultaneously by `fetch --all`.
    pub fetch_concurrency: usize,

    pub github_api_base: String,
    pub github_token: Option<String>,

    /// `claude`, `openai` or `none`. Unset → Claude if its key is present, else OpenAI.
    pub llm_provider: Option<String>,
    pub openai_model: String,
    pub claude_model: String,
    pub openai_api_base: String,
    pub claude_api_base: String,
    pub openai_api_key: Option<String>,
    pub claude_api_key: Option<String>,
    pub llm_max_tokens: u32,
    pub llm_temperature: f32,
    pub llm_timeout_secs: u64,

    /// Items sent to the LLM per analysis.
    pub max_analysis_items: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            user_agent: "NewsIntelligence/1.0".to_string(),
            request_timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 2000,
            fetch_concurrency: 8,
            github_api_base: "https://api.github.com".to_string(),
            github_token: None,
            llm_provider: None,
            openai_model: "gpt-3.5-turbo".to_string(),
            claude_model: "claude-3-haiku-20240307".to_string(),
            openai_api_base: "https://api.openai.com/v1".to_string(),
            claude_api_base: "https://api.anthropic.com/v1".to_string(),
            openai_api_key: None,
            claude_api_key: None,
            llm_max_tokens: 1000,
            llm_temperature: 0.7,
            llm_timeout_secs: 60,
            max_analysis_items: 10,
        }
    }
}

fn redact(value: &Option<String>) -> Option<&'static str> {
    value.as_ref().map(|_| "[REDACTED]")
}

/// SEC-015: Mask secrets in Debug output to prevent leakage into logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("user_agent", &self.user_agent)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("fetch_concurrency", &self.fetch_concurrency)
            .field("github_api_base", &self.github_api_base)
            .field("github_token", &redact(&self.github_token))
            .field("llm_provider", &self.llm_provider)
            .field("openai_model", &self.openai_model)
            .field("claude_model", &self.claude_model)
            .field("openai_api_base", &self.openai_api_base)
            .field("claude_api_base", &self.claude_api_base)
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("claude_api_key", &redact(&self.claude_api_key))
            .field("llm_max_tokens", &self.llm_max_tokens)
            .field("llm_temperature", &self.llm_temperature)
            .field("llm_timeout_secs", &self.llm_timeout_secs)
            .field("max_analysis_items", &self.max_analysis_items)
            .finish()
    }
}

const KNOWN_KEYS: &[&str] = &[
    "database_path",
    "user_agent",
    "request_timeout_secs",
    "max_retries",
    "retry_base_delay_ms",
    "fetch_concurrency",
    "github_api_base",
    "github_token",
    "llm_provider",
    "openai_model",
    "claude_model",
    "openai_api_base",
    "claude_api_base",
    "openai_api_key",
    "claude_api_key",
    "llm_max_tokens",
    "llm_temperature",
    "llm_timeout_secs",
    "max_analysis_items",
];

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// `~/.config/newsintel/`
    pub fn default_dir() -> Result<PathBuf, ConfigError> {
        let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome)?;
        Ok(PathBuf::from(home).join(".config").join("newsintel"))
    }

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Database path, falling back to the config directory.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(p) => Ok(p.clone()),
            None => Ok(Self::default_dir()?.join("newsintel.db")),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// OpenAI key: `OPENAI_API_KEY` wins over the file.
    pub fn openai_key(&self) -> Option<SecretString> {
        env_or(&self.openai_api_key, "OPENAI_API_KEY")
    }

    /// Claude key: `CLAUDE_API_KEY` (or `ANTHROPIC_API_KEY`) wins over the file.
    pub fn claude_key(&self) -> Option<SecretString> {
        env_or(&self.claude_api_key, "CLAUDE_API_KEY")
            .or_else(|| non_empty_env("ANTHROPIC_API_KEY").map(SecretString::from))
    }

    pub fn github_token(&self) -> Option<SecretString> {
        env_or(&self.github_token, "GITHUB_TOKEN")
    }
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn env_or(file_value: &Option<String>, var: &str) -> Option<SecretString> {
    non_empty_env(var)
        .or_else(|| file_value.clone().filter(|v| !v.trim().is_empty()))
        .map(SecretString::from)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(name: &str, content: &str) -> (PathBuf, PathBuf) {
        let dir = std::env::temp_dir().join(format!("newsintel_config_test_{name}"));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.user_agent, "NewsIntelligence/1.0");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.openai_model, "gpt-3.5-turbo");
        assert_eq!(config.llm_max_tokens, 1000);
        assert_eq!(config.max_analysis_items, 10);
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/newsintel_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.fetch_concurrency, 8);
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let (dir, path) = write_config("whitespace", "   \n  \n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_retries, 3);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let (dir, path) = write_config("partial", "max_retries = 5\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.request_timeout_secs, 30);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
database_path = "/var/lib/newsintel/data.db"
user_agent = "Tester/2.0"
request_timeout_secs = 10
fetch_concurrency = 2
github_api_base = "https://ghe.example.com/api/v3"
llm_provider = "openai"
openai_model = "gpt-4o-mini"
openai_api_key = "sk-file-key"
llm_temperature = 0.2
max_analysis_items = 5
"#;
        let (dir, path) = write_config("full", content);
        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/var/lib/newsintel/data.db")
        );
        assert_eq!(config.user_agent, "Tester/2.0");
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.fetch_concurrency, 2);
        assert_eq!(config.llm_provider.as_deref(), Some("openai"));
        assert_eq!(config.openai_model, "gpt-4o-mini");
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-file-key"));
        assert!((config.llm_temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.max_analysis_items, 5);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let (dir, path) = write_config("invalid", "this is not [valid toml");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let (dir, path) = write_config("unknown", "max_retries = 1\ntotally_fake_key = 42\n");
        let config = Config::load(&path).unwrap();
        assert_eq!(config.max_retries, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let (dir, path) = write_config("wrongtype", "max_retries = \"three\"\n");
        assert!(Config::load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let (dir, path) = write_config("too_large", &"a".repeat(1_048_577));
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        std::fs::remove_dir_all(&dir).ok();
    }

    // SEC-015: Debug output masks secrets
    #[test]
    fn test_debug_masks_secrets() {
        let config = Config {
            openai_api_key: Some("sk-super-secret-12345".to_string()),
            github_token: Some("ghp_secret_token".to_string()),
            ..Config::default()
        };

        let debug_output = format!("{:?}", config);
        assert!(!debug_output.contains("sk-super-secret-12345"));
        assert!(!debug_output.contains("ghp_secret_token"));
        assert!(debug_output.contains("[REDACTED]"));
    }

    #[test]
    fn test_blank_file_key_is_ignored() {
        let config = Config {
            github_token: Some("   ".to_string()),
            ..Config::default()
        };
        // Only meaningful when the env var is unset in the test environment
        if std::env::var("GITHUB_TOKEN").is_err() {
            assert!(config.github_token().is_none());
        }
    }
}

//! Chat-completion clients for Claude and OpenAI.

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use thiserror::Error;

use crate::config::Config;
use crate::util::sha256_hex;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const CACHE_CAPACITY: usize = 256;
const MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,
    #[error("LLM network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("LLM rate limited")]
    RateLimited,
    #[error("LLM HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Unexpected LLM response: {0}")]
    Parse(String),
    #[error("Unknown LLM provider: {0} (expected claude or openai)")]
    UnknownProvider(String),
}

impl LlmError {
    /// Returns true if this error is transient and the request should be retried.
    fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Network(_) | LlmError::RateLimited => true,
            LlmError::HttpStatus(status) => *status >= 500,
            LlmError::Parse(_) | LlmError::UnknownProvider(_) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Claude,
    OpenAi,
}

impl Provider {
    pub fn label(self) -> &'static str {
        match self {
            Provider::Claude => "Claude",
            Provider::OpenAi => "OpenAI",
        }
    }
}

impl FromStr for Provider {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" | "anthropic" => Ok(Provider::Claude),
            "openai" => Ok(Provider::OpenAi),
            other => Err(LlmError::UnknownProvider(other.to_string())),
        }
    }
}

/// Provider to use and its key. Claude is preferred when both keys are set,
/// unless `llm_provider` pins one whose key is available.
pub fn select_provider(config: &Config) -> Result<Option<(Provider, SecretString)>, LlmError> {
    let key_for = |provider| match provider {
        Provider::Claude => config.claude_key(),
        Provider::OpenAi => config.openai_key(),
    };

    if let Some(name) = config.llm_provider.as_deref().filter(|p| !p.trim().is_empty()) {
        let pinned: Provider = name.parse()?;
        if let Some(key) = key_for(pinned) {
            return Ok(Some((pinned, key)));
        }
        tracing::warn!(provider = pinned.label(), "Configured LLM provider has no API key");
    }

    Ok([Provider::Claude, Provider::OpenAi]
        .into_iter()
        .find_map(|p| key_for(p).map(|key| (p, key))))
}

/// Everything a client needs to call one provider.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: Provider,
    pub model: String,
    pub api_base: String,
    pub api_key: SecretString,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Delay before the first retry; doubles per attempt (1s, 2s, 4s by default).
    pub retry_base_delay: Duration,
}

impl LlmSettings {
    pub fn from_config(config: &Config) -> Result<Option<Self>, LlmError> {
        let Some((provider, api_key)) = select_provider(config)? else {
            return Ok(None);
        };
        let (model, api_base) = match provider {
            Provider::Claude => (&config.claude_model, &config.claude_api_base),
            Provider::OpenAi => (&config.openai_model, &config.openai_api_base),
        };
        Ok(Some(Self {
            provider,
            model: model.clone(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key,
            max_tokens: config.llm_max_tokens,
            temperature: config.llm_temperature,
            timeout: Duration::from_secs(config.llm_timeout_secs),
            retry_base_delay: Duration::from_secs(1),
        }))
    }
}

pub struct LlmClient {
    http: reqwest::Client,
    settings: LlmSettings,
    cache: Mutex<LruCache<String, String>>,
}

impl LlmClient {
    pub fn new(settings: LlmSettings) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder().timeout(settings.timeout).build()?;
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            http,
            settings,
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn provider(&self) -> Provider {
        self.settings.provider
    }

    pub fn model(&self) -> &str {
        &self.settings.model
    }

    fn cache_key(&self, system: &str, user: &str) -> String {
        let mut input = String::with_capacity(self.settings.model.len() + system.len() + user.len() + 2);
        input.push_str(&self.settings.model);
        input.push('\0');
        input.push_str(system);
        input.push('\0');
        input.push_str(user);
        sha256_hex(&input)
    }

    /// One chat completion. Identical prompts are served from the cache.
    pub async fn complete(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let key = self.cache_key(system, user);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                tracing::debug!(model = %self.settings.model, "LLM cache hit");
                return Ok(hit.clone());
            }
        }

        let text = self.complete_with_retry(system, user).await?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, text.clone());
        }
        Ok(text)
    }

    async fn complete_with_retry(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let mut retry_count = 0;
        loop {
            match self.request(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && retry_count < MAX_RETRIES => {
                    let delay = self
                        .settings
                        .retry_base_delay
                        .saturating_mul(1u32 << retry_count);
                    tracing::debug!(
                        error = %e,
                        retry = retry_count + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying LLM request after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    retry_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn request(&self, system: &str, user: &str) -> Result<String, LlmError> {
        let s = &self.settings;
        let request = match s.provider {
            Provider::Claude => self
                .http
                .post(format!("{}/messages", s.api_base))
                .header("x-api-key", s.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&json!({
                    "model": s.model,
                    "max_tokens": s.max_tokens,
                    "temperature": s.temperature,
                    "system": system,
                    "messages": [{ "role": "user", "content": user }],
                })),
            Provider::OpenAi => self
                .http
                .post(format!("{}/chat/completions", s.api_base))
                .bearer_auth(s.api_key.expose_secret())
                .json(&json!({
                    "model": s.model,
                    "max_tokens": s.max_tokens,
                    "temperature": s.temperature,
                    "messages": [
                        { "role": "system", "content": system },
                        { "role": "user", "content": user },
                    ],
                })),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                LlmError::Timeout
            } else {
                LlmError::Network(e)
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            return Err(LlmError::HttpStatus(status.as_u16()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))?;

        let text = match s.provider {
            Provider::Claude => body["content"][0]["text"].as_str(),
            Provider::OpenAi => body["choices"][0]["message"]["content"].as_str(),
        };
        text.map(str::to_string)
            .ok_or_else(|| LlmError::Parse("missing completion text".to_string()))
    }
}

#[cfg(test)]
pub(crate) fn test_settings(provider: Provider, api_base: &str) -> LlmSettings {
    LlmSettings {
        provider,
        model: "test-model".to_string(),
        api_base: api_base.to_string(),
        api_key: SecretString::from("sk-test".to_string()),
        max_tokens: 1000,
        temperature: 0.7,
        timeout: Duration::from_secs(5),
        retry_base_delay: Duration::from_millis(1),
    }
}

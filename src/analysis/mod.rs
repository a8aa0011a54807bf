//! LLM-backed analysis of fetched items.
//!
//! [`Analyzer::analyze_content`] never fails: without an API key, or when the
//! provider errors after retries, it returns [`default_analysis`] instead.

pub mod digest;
mod llm;
mod parse;
mod prompts;

use std::collections::HashSet;

use serde::Serialize;

use crate::config::Config;
use crate::storage::{NormalizedItem, PolicyParams};

pub use digest::generate_daily_digest;
pub use llm::{select_provider, LlmClient, LlmError, LlmSettings, Provider};
pub use parse::parse_analysis_response;
pub use prompts::{build_system_prompt, build_user_prompt, policy_directives, MAX_PROMPT_ITEMS};

const MAX_DEFAULT_ENTITIES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub summary: String,
    pub insights: Vec<String>,
    pub trends: Vec<String>,
    pub impact: String,
    pub recommendations: Vec<String>,
    pub key_entities: Vec<String>,
}

/// Canned analysis used when no LLM is available.
pub fn default_analysis(items: &[NormalizedItem], source_name: &str) -> AnalysisResult {
    let mut seen = HashSet::new();
    let mut key_entities = Vec::new();
    for item in items {
        let author = item.author.trim();
        if !author.is_empty() && author != "Unknown" && seen.insert(author.to_string()) {
            key_entities.push(author.to_string());
        }
        for tag in &item.tags {
            if tag.chars().count() > 2 && seen.insert(tag.clone()) {
                key_entities.push(tag.clone());
            }
        }
    }
    key_entities.truncate(MAX_DEFAULT_ENTITIES);

    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();

    AnalysisResult {
        summary: format!(
            "今日从 {} 获取了 {} 条新内容，涵盖了多个重要主题。",
            source_name,
            items.len()
        ),
        insights: owned(&[
            "内容更新频繁，显示活跃的社区参与",
            "涉及多个技术领域，体现了跨学科的特点",
            "质量较高，包含详细的技术讨论",
        ]),
        trends: owned(&["技术发展持续加速", "开源项目活跃度提升", "跨领域合作增多"]),
        impact: "这些内容对相关技术领域的发展具有积极影响，为开发者提供了宝贵的参考。".to_string(),
        recommendations: owned(&[
            "持续关注相关技术发展",
            "参与社区讨论和贡献",
            "将新技术应用到实际项目中",
        ]),
        key_entities,
    }
}

/// Runs analyses against the configured provider, if any.
pub struct Analyzer {
    client: Option<LlmClient>,
    max_items: usize,
}

impl Analyzer {
    pub fn new(client: Option<LlmClient>, max_items: usize) -> Self {
        Self {
            client,
            max_items: max_items.max(1),
        }
    }

    /// Errors only on an unknown pinned `llm_provider` or HTTP client setup.
    pub fn from_config(config: &Config) -> Result<Self, LlmError> {
        let client = match LlmSettings::from_config(config)? {
            Some(settings) => Some(LlmClient::new(settings)?),
            None => None,
        };
        Ok(Self::new(client, config.max_analysis_items))
    }

    /// An analyzer that always returns the canned analysis.
    pub fn offline() -> Self {
        Self::new(None, MAX_PROMPT_ITEMS)
    }

    pub fn provider(&self) -> Option<Provider> {
        self.client.as_ref().map(LlmClient::provider)
    }

    pub async fn analyze_content(
        &self,
        items: &[NormalizedItem],
        source_name: &str,
        ai_focus: Option<&str>,
        policy: Option<&PolicyParams>,
    ) -> AnalysisResult {
        let Some(client) = &self.client else {
            tracing::debug!(source = %source_name, "No LLM configured, using default analysis");
            return default_analysis(items, source_name);
        };

        let limited = &items[..items.len().min(self.max_items)];
        let system = format!(
            "{}\n\n{}",
            build_system_prompt(source_name, ai_focus),
            policy_directives(policy)
        );
        let user = build_user_prompt(limited);

        match client.complete(&system, &user).await {
            Ok(text) => {
                tracing::debug!(
                    source = %source_name,
                    provider = client.provider().label(),
                    model = client.model(),
                    chars = text.len(),
                    "LLM analysis complete"
                );
                parse_analysis_response(&text)
            }
            Err(e) => {
                tracing::warn!(
                    source = %source_name,
                    provider = client.provider().label(),
                    error = %e,
                    "LLM analysis failed, using default analysis"
                );
                default_analysis(items, source_name)
            }
        }
    }
}

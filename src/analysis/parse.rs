use super::AnalysisResult;
use crate::util::truncate_chars;

const SUMMARY_MAX_CHARS: usize = 200;
const IMPACT_MAX_CHARS: usize = 150;
const MAX_INSIGHTS: usize = 5;
const MAX_TRENDS: usize = 3;
const MAX_RECOMMENDATIONS: usize = 3;
const MAX_ENTITIES: usize = 5;

const SUMMARY_WORDS: &[&str] = &["摘要", "总结", "summary"];
const TREND_WORDS: &[&str] = &["趋势", "发展", "trend", "development"];
const IMPACT_WORDS: &[&str] = &["影响", "意义", "impact", "significance"];
const RECOMMEND_WORDS: &[&str] = &["建议", "推荐", "recommend", "suggest"];
const ENTITY_WORDS: &[&str] = &["实体", "关键", "entit", "key "];

const DEFAULT_IMPACT: &str = "这些内容对相关领域具有重要影响。";
const DEFAULT_INSIGHTS: &[&str] = &["内容更新活跃", "质量较高", "涉及多个领域"];
const DEFAULT_TRENDS: &[&str] = &["技术发展加速", "社区活跃", "跨领域合作"];
const DEFAULT_RECOMMENDATIONS: &[&str] = &["持续关注", "积极参与", "实践应用"];
const DEFAULT_ENTITIES: &[&str] = &["技术社区", "开源项目", "开发者"];

fn mentions(line: &str, words: &[&str]) -> bool {
    let lower = line.to_lowercase();
    words.iter().any(|w| lower.contains(w))
}

/// Returns the bullet text if `line` is a `-`, `•` or `*` list item.
/// Bold markers (`**`) do not count as bullets.
fn bullet_text(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = if let Some(rest) = trimmed.strip_prefix('-') {
        rest
    } else if let Some(rest) = trimmed.strip_prefix('•') {
        rest
    } else if trimmed.starts_with("**") {
        return None;
    } else {
        trimmed.strip_prefix('*')?
    };
    let text = rest.trim();
    (!text.is_empty()).then_some(text)
}

fn or_defaults(found: Vec<String>, defaults: &[&str]) -> Vec<String> {
    if found.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        found
    }
}

fn collect(lines: &[&str], words: &[&str], max: usize) -> Vec<String> {
    lines
        .iter()
        .filter(|l| mentions(l, words))
        .take(max)
        .map(|l| l.trim().to_string())
        .collect()
}

/// Heuristically split free-text LLM output into analysis fields.
pub fn parse_analysis_response(text: &str) -> AnalysisResult {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();

    let summary = match lines.iter().find(|l| mentions(l, SUMMARY_WORDS)) {
        Some(line) => line.trim().to_string(),
        None => lines
            .iter()
            .take(3)
            .map(|l| l.trim())
            .collect::<Vec<_>>()
            .join(" "),
    };

    let insights = lines
        .iter()
        .filter_map(|l| bullet_text(l))
        .take(MAX_INSIGHTS)
        .map(str::to_string)
        .collect();

    let impact = lines
        .iter()
        .find(|l| mentions(l, IMPACT_WORDS))
        .map(|l| l.trim())
        .unwrap_or(DEFAULT_IMPACT);

    AnalysisResult {
        summary: truncate_chars(&summary, SUMMARY_MAX_CHARS).to_string(),
        insights: or_defaults(insights, DEFAULT_INSIGHTS),
        trends: or_defaults(collect(&lines, TREND_WORDS, MAX_TRENDS), DEFAULT_TRENDS),
        impact: truncate_chars(impact, IMPACT_MAX_CHARS).to_string(),
        recommendations: or_defaults(
            collect(&lines, RECOMMEND_WORDS, MAX_RECOMMENDATIONS),
            DEFAULT_RECOMMENDATIONS,
        ),
        key_entities: or_defaults(collect(&lines, ENTITY_WORDS, MAX_ENTITIES), DEFAULT_ENTITIES),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const RESPONSE: &str = "\
**摘要**：今日多篇蛋白质设计论文发布。

**关键洞察**
- 扩散模型成为主流
- 结构预测精度提升
• 开源工具增多

技术趋势：生成式方法快速发展
影响评估：对药物研发意义重大
建议：跟进最新基准
推荐：复现关键实验
关键实体：DeepMind, Baker Lab";

    #[test]
    fn test_parse_chinese_response() {
        let result = parse_analysis_response(RESPONSE);
        assert_eq!(result.summary, "**摘要**：今日多篇蛋白质设计论文发布。");
        assert_eq!(
            result.insights,
            vec!["扩散模型成为主流", "结构预测精度提升", "开源工具增多"]
        );
        assert_eq!(result.trends, vec!["技术趋势：生成式方法快速发展"]);
        assert_eq!(result.impact, "影响评估：对药物研发意义重大");
        assert_eq!(result.recommendations, vec!["建议：跟进最新基准", "推荐：复现关键实验"]);
        assert_eq!(
            result.key_entities,
            vec!["**关键洞察**", "关键实体：DeepMind, Baker Lab"]
        );
    }

    #[test]
    fn test_parse_english_response() {
        let text = "Summary: Rust 2024 ships.\n* Faster builds\nTrend: async everywhere\nImpact: fewer bugs\nWe recommend upgrading";
        let result = parse_analysis_response(text);
        assert_eq!(result.summary, "Summary: Rust 2024 ships.");
        assert_eq!(result.insights, vec!["Faster builds"]);
        assert_eq!(result.trends, vec!["Trend: async everywhere"]);
        assert_eq!(result.impact, "Impact: fewer bugs");
        assert_eq!(result.recommendations, vec!["We recommend upgrading"]);
    }

    #[test]
    fn test_unstructured_text_falls_back() {
        let result = parse_analysis_response("one\ntwo\n\nthree\nfour");
        assert_eq!(result.summary, "one two three");
        assert_eq!(result.insights, DEFAULT_INSIGHTS);
        assert_eq!(result.trends, DEFAULT_TRENDS);
        assert_eq!(result.impact, DEFAULT_IMPACT);
        assert_eq!(result.recommendations, DEFAULT_RECOMMENDATIONS);
        assert_eq!(result.key_entities, DEFAULT_ENTITIES);
    }

    #[test]
    fn test_caps_and_truncation() {
        let bullets: String = (0..8).map(|i| format!("- point {i}\n")).collect();
        let text = format!("总结 {}\n{bullets}影响 {}", "长".repeat(300), "大".repeat(300));
        let result = parse_analysis_response(&text);
        assert_eq!(result.insights.len(), MAX_INSIGHTS);
        assert_eq!(result.summary.chars().count(), SUMMARY_MAX_CHARS);
        assert_eq!(result.impact.chars().count(), IMPACT_MAX_CHARS);
    }
}

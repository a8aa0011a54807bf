use crate::storage::{NormalizedItem, PolicyParams};
use crate::util::truncate_chars;

/// Items enumerated in a general prompt.
pub const MAX_PROMPT_ITEMS: usize = 10;
const ITEM_EXCERPT_CHARS: usize = 200;
const README_EXCERPT_CHARS: usize = 2000;

fn is_readme_source(source_name: &str) -> bool {
    source_name.contains("README") || source_name.contains("github")
}

fn is_readme_content(items: &[NormalizedItem]) -> bool {
    items.iter().any(|item| {
        item.title.contains("README")
            || item.content.contains("Papers last week")
            || item.content.contains("## ")
            || item.content.contains("### ")
    })
}

pub fn build_system_prompt(source_name: &str, ai_focus: Option<&str>) -> String {
    let base = format!(
        "You are a professional news analyst covering content from \"{}\".",
        source_name
    );

    if is_readme_source(source_name) {
        return format!(
            "{base}\n\n\
             **GitHub README analysis:**\n\
             You are reading the README of a GitHub repository. Concentrate on:\n\n\
             1. **Latest updates**: the newest papers and update dates the README marks\n\
             2. **Paper list**: titles, authors and venues of newly added papers\n\
             3. **Technical trends**: directions visible in the paper titles and descriptions\n\
             4. **Key findings**: notable breakthroughs and research progress\n\
             5. **Update digest**: what changed recently and why it matters\n\n\
             Be concise and center the analysis on what is new."
        );
    }

    match ai_focus.map(str::trim).filter(|f| !f.is_empty()) {
        Some(focus) => format!(
            "{base}\n\n**Analysis focus:**\n{focus}\n\n\
             Keep the analysis strictly on these points."
        ),
        None => format!("{base}\n\nProvide a comprehensive analysis of the content."),
    }
}

pub fn build_user_prompt(items: &[NormalizedItem]) -> String {
    if is_readme_content(items) {
        let readme = items.first().map(|i| i.content.as_str()).unwrap_or("");
        return format!(
            "Analyze the following GitHub README content:\n\n\
             **README content:**\n{}...\n\n\
             **Please cover:**\n\n\
             1. **Latest updates** (100-150 characters): the newest papers and updates the README marks\n\
             2. **New papers** (3-5 entries): titles, authors and publication details\n\
             3. **Technical trends**: current research directions from the paper titles\n\
             4. **Breakthroughs**: important technical advances\n\
             5. **Update digest**: a short summary of what changed recently",
            truncate_chars(readme, README_EXCERPT_CHARS)
        );
    }

    let listing = items
        .iter()
        .take(MAX_PROMPT_ITEMS)
        .enumerate()
        .map(|(i, item)| {
            format!(
                "{}. {}\n   {}...\n   URL: {}\n",
                i + 1,
                item.title,
                truncate_chars(&item.content, ITEM_EXCERPT_CHARS),
                item.url
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Analyze the following recent content:\n\n{listing}\n\
         Please provide:\n\n\
         1. **Summary** (100-150 characters): the main content and direction of the day\n\
         2. **Key insights** (3-5 bullets): important findings and trends\n\
         3. **Impact**: what this means for the field\n\
         4. **Recommendations** (3 bullets): concrete next steps\n\
         5. **Key entities**: people, organizations or projects mentioned"
    )
}

/// Instructions derived from a policy, appended to the system prompt.
///
/// Without a policy the defaults apply, so the answer language is always set.
pub fn policy_directives(policy: Option<&PolicyParams>) -> String {
    let defaults = PolicyParams::default();
    let p = policy.unwrap_or(&defaults);
    let language = match p.summary.language.as_str() {
        "english" => "English",
        _ => "Chinese",
    };

    let mut out = format!(
        "Answer in {language}. Keep the summary near {} characters in a {} style.",
        p.summary.target_length, p.summary.style
    );
    if p.summary.uncertainty_handling == "explicit" {
        out.push_str(" State uncertainty explicitly instead of guessing.");
    }
    if !p.insights.focus_areas.is_empty() {
        out.push_str(&format!(
            "\nGive {} insights covering: {}.",
            p.insights.count,
            p.insights.focus_areas.join(", ")
        ));
    }
    for (domain, fields) in &p.extraction.fields {
        out.push_str(&format!(
            "\nFor {domain} content, extract {} when confidence is at least {:.2}.",
            fields.join(", "),
            p.extraction.confidence_threshold
        ));
    }
    out.push_str(&format!(
        "\nOffer {} recommendations for {}.",
        p.recommendations.count, p.recommendations.target_audience
    ));
    out
}

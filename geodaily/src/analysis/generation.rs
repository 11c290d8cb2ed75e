//! Stage 4: narrative content for selected stories.

use serde::{Deserialize, Serialize};

use super::category::CategoryAnalysis;
use crate::llm::parse_json_reply;
use crate::models::{
    ArticleCluster, StoryScores, PREDICTION_WORDS, WHAT_OVERLOOKED_WORDS, WHY_IMPORTANT_WORDS,
};
use crate::text::truncate_words;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub story_title: String,
    pub why_important: String,
    pub what_overlooked: String,
    pub prediction: String,
    pub scores: StoryScores,
    pub confidence: f64,
}

pub fn prompt(cluster: &ArticleCluster, analysis: &CategoryAnalysis) -> String {
    let main = cluster.main_article();
    let coverage = cluster
        .members()
        .iter()
        .map(|a| {
            if a.summary.is_empty() {
                format!("- [{}] {}", a.source, a.title)
            } else {
                format!("- [{}] {}: {}", a.source, a.title, a.summary)
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Task: content_generation

Write the briefing entry for this {content_type} story in the {category} section.
Limits: why_important at most {why} words, what_overlooked at most {gap} words, prediction at most {pred} words.
Scores are 1-10, confidence is 0-1.

OUTPUT FORMAT (strict JSON):
{{
  "story_title": "concise headline",
  "why_important": "...",
  "what_overlooked": "...",
  "prediction": "...",
  "scores": {{"urgency": 6, "scope": 7, "novelty": 5, "credibility": 8, "impact": 7}},
  "confidence": 0.8
}}

HEADLINE: {title}
ANALYST NOTE: {reasoning}
COVERAGE:
{coverage}
"#,
        content_type = analysis.content_type.as_str(),
        category = cluster.category().as_str(),
        why = WHY_IMPORTANT_WORDS,
        gap = WHAT_OVERLOOKED_WORDS,
        pred = PREDICTION_WORDS,
        title = main.title,
        reasoning = analysis.reasoning,
        coverage = coverage,
    )
}

pub fn parse(reply: &str) -> Result<GeneratedContent, String> {
    let content: GeneratedContent = parse_json_reply(reply)?;
    if content.story_title.trim().is_empty() || content.why_important.trim().is_empty() {
        return Err("reply is missing the story title or importance".to_string());
    }
    Ok(content)
}

/// Template narrative built from the cluster's own headlines.
pub fn heuristic(cluster: &ArticleCluster, analysis: &CategoryAnalysis) -> GeneratedContent {
    let main = cluster.main_article();
    let sources = cluster.distinct_sources();
    let why_important = if main.summary.trim().is_empty() {
        format!(
            "{} Reported by {} source{} with {} implications.",
            main.title,
            sources,
            if sources == 1 { "" } else { "s" },
            cluster.category().as_str()
        )
    } else {
        truncate_words(&main.summary, WHY_IMPORTANT_WORDS)
    };
    GeneratedContent {
        story_title: main.title.clone(),
        why_important,
        what_overlooked: format!(
            "Second-order {} effects beyond the headline remain underreported.",
            cluster.category().as_str()
        ),
        prediction: "Expect follow-up developments as parties respond in coming days.".to_string(),
        scores: analysis.scores,
        confidence: 0.4,
    }
}

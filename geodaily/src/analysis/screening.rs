//! Stage 1: relevance screening.

use serde::{Deserialize, Serialize};

use crate::llm::parse_json_reply;
use crate::models::{clamp_score, ArticleCluster, ContentType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub overall: f64,
    pub geopolitical_relevance: f64,
    pub urgency: f64,
    pub source_quality: f64,
    pub content_richness: f64,
    #[serde(default)]
    pub reasoning: String,
}

impl ScreeningResult {
    fn clamped(self) -> Self {
        Self {
            overall: clamp_score(self.overall),
            geopolitical_relevance: clamp_score(self.geopolitical_relevance),
            urgency: clamp_score(self.urgency),
            source_quality: clamp_score(self.source_quality),
            content_richness: clamp_score(self.content_richness),
            reasoning: self.reasoning,
        }
    }
}

pub fn prompt(cluster: &ArticleCluster) -> String {
    let main = cluster.main_article();
    let coverage = cluster
        .members()
        .iter()
        .map(|a| format!("- [{}] {}", a.source, a.title))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Task: relevance_screening

You screen news stories for a daily geopolitical briefing. Rate this story on a 1-10 scale.

OUTPUT FORMAT (strict JSON):
{{
  "overall": 7.5,
  "geopolitical_relevance": 8,
  "urgency": 6,
  "source_quality": 7,
  "content_richness": 6,
  "reasoning": "one sentence"
}}

HEADLINE: {}
SUMMARY: {}
COVERAGE ({} articles from {} sources):
{}
"#,
        main.title,
        main.summary,
        cluster.members().len(),
        cluster.distinct_sources(),
        coverage
    )
}

pub fn parse(reply: &str) -> Result<ScreeningResult, String> {
    parse_json_reply::<ScreeningResult>(reply).map(ScreeningResult::clamped)
}

/// Deterministic screening from relevance, content type, source mix and coverage depth.
pub fn heuristic(cluster: &ArticleCluster, source_quality: f64) -> ScreeningResult {
    let geopolitical_relevance = clamp_score(4.0 + 3.0 * cluster.max_relevance());
    let urgency = match cluster.content_type() {
        ContentType::BreakingNews => 8.0,
        ContentType::Trend => 6.0,
        ContentType::Analysis => 5.0,
    };
    let source_quality = clamp_score(4.0 + 5.0 * source_quality);
    let has_summary = cluster.members().iter().any(|a| a.summary.chars().count() > 100);
    let content_richness = clamp_score(
        4.0 + 1.5 * (cluster.members().len() as f64 - 1.0) + if has_summary { 2.0 } else { 0.0 },
    );
    let overall = 0.4 * geopolitical_relevance + 0.2 * urgency + 0.2 * source_quality + 0.2 * content_richness;
    ScreeningResult {
        overall,
        geopolitical_relevance,
        urgency,
        source_quality,
        content_richness,
        reasoning: "heuristic screening from keyword relevance and coverage".to_string(),
    }
}

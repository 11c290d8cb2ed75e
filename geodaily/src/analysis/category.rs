//! Stage 2: category-specific analysis.

use serde::{Deserialize, Serialize};

use super::screening::ScreeningResult;
use crate::llm::parse_json_reply;
use crate::models::{clamp_score, ArticleCluster, ContentType, StoryCategory, StoryScores};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryAnalysis {
    pub category_score: f64,
    pub scores: StoryScores,
    pub content_type: ContentType,
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct Reply {
    category_score: f64,
    urgency: f64,
    scope: f64,
    novelty: f64,
    credibility: f64,
    impact: f64,
    content_type: String,
    #[serde(default)]
    reasoning: String,
}

fn focus(category: StoryCategory) -> &'static str {
    match category {
        StoryCategory::Strategic => {
            "Focus on shifts in alliances, great-power competition and long-term policy direction."
        }
        StoryCategory::Economic => {
            "Focus on trade flows, sanctions, energy and financial stability, and who bears the cost."
        }
        StoryCategory::Security => {
            "Focus on force posture, escalation risk, weapons programs and deterrence."
        }
        StoryCategory::Regional => {
            "Focus on how local dynamics could spill over into wider regional or global consequences."
        }
    }
}

pub fn prompt(cluster: &ArticleCluster, screening: &ScreeningResult) -> String {
    let main = cluster.main_article();
    let sources = cluster
        .members()
        .iter()
        .map(|a| a.source.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"Task: category_analysis

You are a {category} affairs analyst. {focus}
Score the story on a 1-10 scale and classify it as breaking_news, analysis or trend.

OUTPUT FORMAT (strict JSON):
{{
  "category_score": 7,
  "urgency": 6,
  "scope": 7,
  "novelty": 5,
  "credibility": 8,
  "impact": 7,
  "content_type": "analysis",
  "reasoning": "one sentence"
}}

HEADLINE: {title}
SUMMARY: {summary}
SOURCES: {sources}
SCREENING: overall {overall:.1}, relevance {relevance:.1}
"#,
        category = cluster.category().as_str(),
        focus = focus(cluster.category()),
        title = main.title,
        summary = main.summary,
        sources = sources,
        overall = screening.overall,
        relevance = screening.geopolitical_relevance,
    )
}

pub fn parse(reply: &str) -> Result<CategoryAnalysis, String> {
    let reply: Reply = parse_json_reply(reply)?;
    let content_type = ContentType::parse(&reply.content_type)
        .ok_or_else(|| format!("unknown content type '{}'", reply.content_type))?;
    Ok(CategoryAnalysis {
        category_score: clamp_score(reply.category_score),
        scores: StoryScores {
            urgency: reply.urgency,
            scope: reply.scope,
            novelty: reply.novelty,
            credibility: reply.credibility,
            impact: reply.impact,
        }
        .clamped(),
        content_type,
        reasoning: reply.reasoning,
    })
}

pub fn heuristic(cluster: &ArticleCluster, screening: &ScreeningResult) -> CategoryAnalysis {
    let novelty = match cluster.content_type() {
        ContentType::Trend => 6.0,
        _ => 5.0,
    };
    CategoryAnalysis {
        category_score: clamp_score(screening.overall),
        scores: StoryScores {
            urgency: screening.urgency,
            scope: 3.0 + 1.5 * cluster.distinct_sources() as f64,
            novelty,
            credibility: screening.source_quality,
            impact: screening.geopolitical_relevance,
        }
        .clamped(),
        content_type: cluster.content_type(),
        reasoning: format!("heuristic {} assessment", cluster.category().as_str()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Article, SourceCategory};
    use chrono::{TimeZone, Utc};

    fn screening() -> ScreeningResult {
        ScreeningResult {
            overall: 7.2,
            geopolitical_relevance: 8.0,
            urgency: 6.0,
            source_quality: 7.5,
            content_richness: 6.0,
            reasoning: String::new(),
        }
    }

    fn cluster(category: StoryCategory) -> ArticleCluster {
        let at = Utc.with_ymd_and_hms(2024, 9, 1, 0, 0, 0).unwrap();
        let members = vec![
            Article::new("a", SourceCategory::Mainstream, "Troops mass at border", "https://a.test/1", at),
            Article::new("b", SourceCategory::ThinkTank, "Border buildup explained", "https://b.test/1", at),
        ];
        ArticleCluster::new("c", members, 0, 1.0, category, ContentType::Trend, 0).unwrap()
    }

    #[test]
    fn prompt_is_specific_to_category() {
        let security = prompt(&cluster(StoryCategory::Security), &screening());
        let economic = prompt(&cluster(StoryCategory::Economic), &screening());
        assert!(security.contains("security affairs analyst"));
        assert!(security.contains("deterrence"));
        assert!(economic.contains("sanctions"));
        assert_ne!(security, economic);
    }

    #[test]
    fn parse_requires_known_content_type() {
        let ok = r#"{"category_score": 8, "urgency": 7, "scope": 12, "novelty": 4, "credibility": 8, "impact": 9, "content_type": "Breaking News"}"#;
        let parsed = parse(ok).expect("valid reply");
        assert_eq!(parsed.content_type, ContentType::BreakingNews);
        assert_eq!(parsed.scores.scope, 10.0);

        let bad = r#"{"category_score": 8, "urgency": 7, "scope": 6, "novelty": 4, "credibility": 8, "impact": 9, "content_type": "opinion"}"#;
        assert!(parse(bad).is_err());
    }

    #[test]
    fn heuristic_carries_screening_signals() {
        let analysis = heuristic(&cluster(StoryCategory::Security), &screening());
        assert_eq!(analysis.scores.impact, 8.0);
        assert_eq!(analysis.scores.credibility, 7.5);
        assert_eq!(analysis.scores.scope, 6.0);
        assert_eq!(analysis.scores.novelty, 6.0);
        assert_eq!(analysis.content_type, ContentType::Trend);
    }
}

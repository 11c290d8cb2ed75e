use common::{ScoringConfig, SourceWeights};

use crate::models::Article;

/// Keyword-weighted relevance, scaled by source weight and content quality.
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    keywords: Vec<(String, f64)>,
    source_weights: SourceWeights,
}

impl RelevanceScorer {
    pub fn new(config: &ScoringConfig) -> Self {
        Self {
            keywords: config
                .keywords
                .iter()
                .filter(|k| !k.term.trim().is_empty())
                .map(|k| (k.term.trim().to_lowercase(), k.weight))
                .collect(),
            source_weights: config.source_weights.clone(),
        }
    }

    pub fn source_weights(&self) -> &SourceWeights {
        &self.source_weights
    }

    /// Configured keywords found, case-insensitively, in the article's title or summary.
    pub fn matched_keywords<'a>(&'a self, article: &Article) -> Vec<(&'a str, f64)> {
        let haystack = format!("{} {}", article.title, article.summary).to_lowercase();
        self.keywords
            .iter()
            .filter(|(term, _)| haystack.contains(term.as_str()))
            .map(|(term, weight)| (term.as_str(), *weight))
            .collect()
    }

    pub fn score(&self, article: &Article) -> f64 {
        let keyword_sum: f64 = self.matched_keywords(article).iter().map(|(_, w)| w).sum();
        keyword_sum * article.weighted_quality(&self.source_weights)
    }

    pub fn score_all(&self, articles: Vec<Article>) -> Vec<Article> {
        articles
            .into_iter()
            .map(|a| {
                let score = self.score(&a);
                a.with_relevance(score)
            })
            .collect()
    }
}

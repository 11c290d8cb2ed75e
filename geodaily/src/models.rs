//! Core records flowing through the engine: articles, clusters and analyses.

use chrono::{DateTime, Utc};
use common::SourceWeights;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::text;

/// Editorial category of the outlet an article came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    Mainstream,
    Analysis,
    ThinkTank,
    Regional,
}

impl SourceCategory {
    pub fn weight(self, weights: &SourceWeights) -> f64 {
        match self {
            SourceCategory::Mainstream => weights.mainstream,
            SourceCategory::Analysis => weights.analysis,
            SourceCategory::ThinkTank => weights.think_tank,
            SourceCategory::Regional => weights.regional,
        }
    }
}

/// A single collected news item. Scoring produces a new value rather than mutating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub source: String,
    pub source_category: SourceCategory,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub summary: String,
    pub published_at: DateTime<Utc>,
    #[serde(default)]
    pub author: Option<String>,
    /// Collector-assigned quality in [0, 1]; derived from the text when absent
    #[serde(default)]
    pub content_quality: Option<f64>,
    #[serde(default)]
    pub relevance_score: f64,
}

impl Article {
    pub fn new(
        source: impl Into<String>,
        source_category: SourceCategory,
        title: impl Into<String>,
        url: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source: source.into(),
            source_category,
            title: title.into(),
            url: url.into(),
            summary: String::new(),
            published_at,
            author: None,
            content_quality: None,
            relevance_score: 0.0,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_quality(mut self, quality: f64) -> Self {
        self.content_quality = Some(quality);
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance_score = relevance;
        self
    }

    /// Articles with neither a title nor a URL cannot be identified.
    pub fn is_malformed(&self) -> bool {
        self.title.trim().is_empty() && self.url.trim().is_empty()
    }

    /// Content quality in [0, 1].
    ///
    /// Uses the collector's value when present, otherwise starts at 0.5 and adds
    /// 0.25 for a 5–15 word title and 0.25 for a summary over 100 characters.
    pub fn quality(&self) -> f64 {
        if let Some(q) = self.content_quality {
            return if q.is_finite() { q.clamp(0.0, 1.0) } else { 0.0 };
        }
        let mut q = 0.5;
        let words = self.title.split_whitespace().count();
        if (5..=15).contains(&words) {
            q += 0.25;
        }
        if self.summary.chars().count() > 100 {
            q += 0.25;
        }
        q
    }

    /// Source category weight multiplied by content quality.
    pub fn weighted_quality(&self, weights: &SourceWeights) -> f64 {
        self.source_category.weight(weights) * self.quality()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoryCategory {
    Strategic,
    Regional,
    Economic,
    Security,
}

impl StoryCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            StoryCategory::Strategic => "strategic",
            StoryCategory::Regional => "regional",
            StoryCategory::Economic => "economic",
            StoryCategory::Security => "security",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    BreakingNews,
    Analysis,
    Trend,
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::BreakingNews => "breaking_news",
            ContentType::Analysis => "analysis",
            ContentType::Trend => "trend",
        }
    }

    /// Lenient parse of the labels the analysis service returns.
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().replace([' ', '-'], "_").as_str() {
            "breaking_news" | "breaking" => Some(ContentType::BreakingNews),
            "analysis" => Some(ContentType::Analysis),
            "trend" => Some(ContentType::Trend),
            _ => None,
        }
    }
}

/// Group of articles covering one underlying story.
///
/// The main article is stored as an index into `members`, so it is always a member.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArticleCluster {
    id: String,
    members: Vec<Article>,
    main_index: usize,
    cluster_score: f64,
    category: StoryCategory,
    content_type: ContentType,
    order: usize,
}

impl ArticleCluster {
    /// Builds a cluster, sorting members by descending relevance.
    ///
    /// `main` indexes into `members` as given; returns `None` when out of range.
    pub fn new(
        id: impl Into<String>,
        members: Vec<Article>,
        main: usize,
        cluster_score: f64,
        category: StoryCategory,
        content_type: ContentType,
        order: usize,
    ) -> Option<Self> {
        if main >= members.len() {
            return None;
        }
        let mut indexed: Vec<(usize, Article)> = members.into_iter().enumerate().collect();
        indexed.sort_by(|(ia, a), (ib, b)| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then(ia.cmp(ib))
        });
        let main_index = indexed.iter().position(|(i, _)| *i == main)?;
        Some(Self {
            id: id.into(),
            members: indexed.into_iter().map(|(_, a)| a).collect(),
            main_index,
            cluster_score,
            category,
            content_type,
            order,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn with_id(mut self, id: String) -> Self {
        self.id = id;
        self
    }

    pub fn main_article(&self) -> &Article {
        &self.members[self.main_index]
    }

    pub fn members(&self) -> &[Article] {
        &self.members
    }

    pub fn cluster_score(&self) -> f64 {
        self.cluster_score
    }

    pub fn category(&self) -> StoryCategory {
        self.category
    }

    pub fn content_type(&self) -> ContentType {
        self.content_type
    }

    /// Collection-order index of the earliest member.
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn max_relevance(&self) -> f64 {
        self.members
            .iter()
            .map(|a| a.relevance_score)
            .fold(0.0, f64::max)
    }

    pub fn distinct_sources(&self) -> usize {
        let mut sources: Vec<&str> = self.members.iter().map(|a| a.source.as_str()).collect();
        sources.sort_unstable();
        sources.dedup();
        sources.len()
    }

    pub fn urls(&self) -> Vec<String> {
        self.members.iter().map(|a| a.url.clone()).collect()
    }
}

/// Where an analysis came from. Ordered from most to least trustworthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Real,
    Mock,
    Degraded,
}

impl Provenance {
    pub fn worst(self, other: Provenance) -> Provenance {
        self.max(other)
    }
}

/// Sub-scores on a 1–10 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoryScores {
    pub urgency: f64,
    pub scope: f64,
    pub novelty: f64,
    pub credibility: f64,
    pub impact: f64,
}

impl StoryScores {
    pub fn clamped(self) -> Self {
        Self {
            urgency: clamp_score(self.urgency),
            scope: clamp_score(self.scope),
            novelty: clamp_score(self.novelty),
            credibility: clamp_score(self.credibility),
            impact: clamp_score(self.impact),
        }
    }
}

/// Clamp into [1, 10]; non-finite values fall to the floor.
pub fn clamp_score(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(1.0, 10.0)
    } else {
        1.0
    }
}

pub const WHY_IMPORTANT_WORDS: usize = 80;
pub const WHAT_OVERLOOKED_WORDS: usize = 40;
pub const PREDICTION_WORDS: usize = 30;

/// Final narrated analysis for one selected cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAnalysis {
    pub cluster_id: String,
    pub story_title: String,
    pub why_important: String,
    pub what_overlooked: String,
    pub prediction: String,
    pub content_type: ContentType,
    pub scores: StoryScores,
    pub sources: Vec<String>,
    pub confidence: f64,
    pub cost_incurred: f64,
    pub tokens_used: u64,
    pub provenance: Provenance,
}

impl AiAnalysis {
    /// Applies the narrative word limits and score ranges.
    pub fn normalized(mut self) -> Self {
        self.why_important = text::truncate_words(&self.why_important, WHY_IMPORTANT_WORDS);
        self.what_overlooked = text::truncate_words(&self.what_overlooked, WHAT_OVERLOOKED_WORDS);
        self.prediction = text::truncate_words(&self.prediction, PREDICTION_WORDS);
        self.scores = self.scores.clamped();
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }
}

/// Orders by a float descending, with NaN treated as the lowest value.
pub(crate) fn desc(a: f64, b: f64) -> Ordering {
    let a = if a.is_nan() { f64::NEG_INFINITY } else { a };
    let b = if b.is_nan() { f64::NEG_INFINITY } else { b };
    b.total_cmp(&a)
}

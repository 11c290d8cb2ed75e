use chrono::{DateTime, Utc};
use common::ClusteringConfig;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info};

use crate::grouping::{candidate_pairs, DisjointSet};
use crate::models::{desc, Article, ArticleCluster, ContentType, StoryCategory};
use crate::scoring::RelevanceScorer;
use crate::text;

const STRATEGIC_SIGNALS: &[&str] = &["analysis", "implications", "strategic", "policy", "diplomacy"];
const ECONOMIC_SIGNALS: &[&str] = &["economic", "economy", "trade", "sanctions", "finance", "tariff", "market"];
const SECURITY_SIGNALS: &[&str] = &["military", "defense", "defence", "security", "nato", "missile", "troops"];
const BREAKING_SIGNALS: &[&str] = &["breaking", "urgent", "developing"];
const TREND_SIGNALS: &[&str] = &["trend", "shift", "changing"];

/// 0.5^(hours since publication / half-life); future timestamps count as fresh.
pub fn recency_factor(published_at: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    let hours = ((now - published_at).num_seconds() as f64 / 3600.0).max(0.0);
    0.5f64.powf(hours / half_life_hours)
}

fn count_signals(text: &str, signals: &[&str]) -> usize {
    signals.iter().filter(|s| text.contains(*s)).count()
}

/// Category with the most signal hits; ties resolve strategic, economic, security.
fn categorize(text: &str) -> StoryCategory {
    let counts = [
        (StoryCategory::Strategic, count_signals(text, STRATEGIC_SIGNALS)),
        (StoryCategory::Economic, count_signals(text, ECONOMIC_SIGNALS)),
        (StoryCategory::Security, count_signals(text, SECURITY_SIGNALS)),
    ];
    let mut best = (StoryCategory::Regional, 0);
    for (category, count) in counts {
        if count > best.1 {
            best = (category, count);
        }
    }
    best.0
}

fn content_type_hint(titles: &str) -> ContentType {
    if count_signals(titles, BREAKING_SIGNALS) > 0 {
        ContentType::BreakingNews
    } else if count_signals(titles, TREND_SIGNALS) > 0 {
        ContentType::Trend
    } else {
        ContentType::Analysis
    }
}

/// Single-linkage grouping of scored articles into ranked story clusters.
#[derive(Debug, Clone)]
pub struct Clusterer {
    config: ClusteringConfig,
    scorer: RelevanceScorer,
    pairwise_limit: usize,
}

impl Clusterer {
    pub fn new(config: ClusteringConfig, scorer: RelevanceScorer, pairwise_limit: usize) -> Self {
        Self {
            config,
            scorer,
            pairwise_limit,
        }
    }

    /// Groups `articles` (already scored, in collection order) relative to `now`.
    ///
    /// Two articles link when their normalized titles are similar enough and their
    /// significant tokens plus matched keywords overlap enough. Output is sorted by
    /// cluster score, then collection order, then main URL, and ids follow that order.
    pub fn cluster(&self, articles: Vec<Article>, now: DateTime<Utc>) -> Vec<ArticleCluster> {
        if articles.is_empty() {
            return Vec::new();
        }
        let titles: Vec<String> = articles.iter().map(|a| text::normalize_title(&a.title)).collect();
        let matched: Vec<Vec<(&str, f64)>> = articles
            .iter()
            .map(|a| self.scorer.matched_keywords(a))
            .collect();
        let tokens: Vec<HashSet<String>> = titles
            .iter()
            .zip(&matched)
            .map(|(title, keywords)| {
                let mut set = text::significant_tokens(title);
                set.extend(keywords.iter().map(|(term, _)| term.to_string()));
                set
            })
            .collect();

        let mut sets = DisjointSet::new(articles.len());
        for (i, j) in candidate_pairs(&tokens, self.pairwise_limit) {
            if sets.find(i) == sets.find(j) {
                continue;
            }
            let similarity = text::normalized_similarity(&titles[i], &titles[j]);
            if similarity < self.config.similarity_threshold {
                continue;
            }
            if text::jaccard(&tokens[i], &tokens[j]) >= self.config.min_token_overlap {
                sets.union(i, j);
            }
        }

        let weights = self.scorer.source_weights();
        let mut slots: Vec<Option<Article>> = articles.into_iter().map(Some).collect();
        let mut clusters = Vec::new();
        for group in sets.groups() {
            let recency: Vec<f64> = group
                .iter()
                .map(|&i| {
                    slots[i]
                        .as_ref()
                        .map(|a| recency_factor(a.published_at, now, self.config.recency_half_life_hours))
                        .unwrap_or(0.0)
                })
                .collect();
            let members: Vec<Article> = group.iter().filter_map(|&i| slots[i].take()).collect();
            if members.len() != group.len() {
                continue;
            }

            let main = (0..members.len())
                .min_by(|&a, &b| {
                    let sa = members[a].weighted_quality(weights) * recency[a];
                    let sb = members[b].weighted_quality(weights) * recency[b];
                    desc(sa, sb).then(a.cmp(&b))
                })
                .unwrap_or(0);

            let mut keyword_hits: BTreeMap<&str, f64> = BTreeMap::new();
            for &i in &group {
                for (term, weight) in &matched[i] {
                    keyword_hits.insert(*term, *weight);
                }
            }
            let keyword_score: f64 = keyword_hits.values().sum();

            let mut sources: Vec<&str> = members.iter().map(|a| a.source.as_str()).collect();
            sources.sort_unstable();
            sources.dedup();
            let max_relevance = members.iter().map(|a| a.relevance_score).fold(0.0, f64::max);

            let score = self.config.w_diversity * sources.len() as f64
                + self.config.w_relevance * max_relevance
                + self.config.w_keywords * keyword_score
                + self.config.w_recency * recency[main];

            let body = members
                .iter()
                .map(|a| format!("{} {}", a.title, a.summary))
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            let headlines = members
                .iter()
                .map(|a| a.title.as_str())
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();

            let order = group[0];
            if let Some(cluster) = ArticleCluster::new(
                String::new(),
                members,
                main,
                score,
                categorize(&body),
                content_type_hint(&headlines),
                order,
            ) {
                clusters.push(cluster);
            }
        }

        clusters.sort_by(|a, b| {
            desc(a.cluster_score(), b.cluster_score())
                .then(a.order().cmp(&b.order()))
                .then_with(|| a.main_article().url.cmp(&b.main_article().url))
        });
        let clusters: Vec<ArticleCluster> = clusters
            .into_iter()
            .enumerate()
            .map(|(rank, c)| c.with_id(format!("cluster_{:03}", rank)))
            .collect();

        for c in &clusters {
            debug!(
                cluster = c.id(),
                members = c.members().len(),
                score = c.cluster_score(),
                category = c.category().as_str(),
                "cluster built"
            );
        }
        info!(clusters = clusters.len(), "clustering complete");
        clusters
    }
}

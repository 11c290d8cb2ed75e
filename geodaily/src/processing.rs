use chrono::{DateTime, Utc};
use common::Config;
use serde::Serialize;
use tracing::info;

use crate::clustering::Clusterer;
use crate::dedup::Deduplicator;
use crate::models::{Article, ArticleCluster};
use crate::scoring::RelevanceScorer;

/// Counters for one pass of the pre-analysis pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub collected: usize,
    pub malformed: usize,
    pub after_dedup: usize,
    pub url_duplicates: usize,
    pub title_duplicates: usize,
    pub clusters: usize,
    /// Share of well-formed articles removed as duplicates
    pub dedup_rate: f64,
}

#[derive(Debug, Clone)]
pub struct ProcessingOutput {
    pub clusters: Vec<ArticleCluster>,
    pub stats: ProcessingStats,
}

/// Deduplicate, score and cluster a collected batch. Pure and deterministic for a given `now`.
pub fn process_articles(config: &Config, articles: Vec<Article>, now: DateTime<Utc>) -> ProcessingOutput {
    let scorer = RelevanceScorer::new(&config.scoring);
    let dedup = Deduplicator::new(config.dedup.clone(), config.scoring.source_weights.clone());
    let clusterer = Clusterer::new(config.clustering.clone(), scorer.clone(), config.dedup.pairwise_limit);

    let deduped = dedup.deduplicate(articles);
    let scored = scorer.score_all(deduped.articles);
    let clusters = clusterer.cluster(scored, now);

    let well_formed = deduped.stats.input - deduped.stats.malformed;
    let removed = deduped.stats.url_duplicates + deduped.stats.title_duplicates;
    let dedup_rate = if well_formed == 0 {
        0.0
    } else {
        removed as f64 / well_formed as f64
    };
    let stats = ProcessingStats {
        collected: deduped.stats.input,
        malformed: deduped.stats.malformed,
        after_dedup: deduped.stats.output,
        url_duplicates: deduped.stats.url_duplicates,
        title_duplicates: deduped.stats.title_duplicates,
        clusters: clusters.len(),
        dedup_rate,
    };
    info!(
        collected = stats.collected,
        after_dedup = stats.after_dedup,
        clusters = stats.clusters,
        dedup_rate = stats.dedup_rate,
        "processing complete"
    );
    ProcessingOutput { clusters, stats }
}

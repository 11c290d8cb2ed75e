use common::{DedupConfig, SourceWeights};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::grouping::{candidate_pairs, DisjointSet};
use crate::models::{desc, Article};
use crate::text;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DedupStats {
    pub input: usize,
    pub malformed: usize,
    pub url_duplicates: usize,
    pub title_duplicates: usize,
    pub output: usize,
}

#[derive(Debug, Clone)]
pub struct DedupOutput {
    pub articles: Vec<Article>,
    pub stats: DedupStats,
}

struct Identity {
    url: String,
    title: String,
    tokens: HashSet<String>,
}

/// Collapses articles that share a URL or carry near-identical titles.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    config: DedupConfig,
    source_weights: SourceWeights,
}

impl Deduplicator {
    pub fn new(config: DedupConfig, source_weights: SourceWeights) -> Self {
        Self {
            config,
            source_weights,
        }
    }

    /// Returns the surviving articles in collection order.
    ///
    /// Duplicate relations are merged transitively, and each group keeps the article with the
    /// highest weighted quality, then the earliest publication, then the earliest position.
    pub fn deduplicate(&self, articles: Vec<Article>) -> DedupOutput {
        let input = articles.len();
        let (valid, malformed): (Vec<Article>, Vec<Article>) =
            articles.into_iter().partition(|a| !a.is_malformed());
        if !malformed.is_empty() {
            warn!(count = malformed.len(), "dropping articles without title or url");
        }

        let identities: Vec<Identity> = valid
            .iter()
            .map(|a| {
                let title = text::normalize_title(&a.title);
                let tokens = text::significant_tokens(&title);
                Identity {
                    url: text::normalize_url(&a.url),
                    title,
                    tokens,
                }
            })
            .collect();

        let mut sets = DisjointSet::new(valid.len());

        let mut first_by_url: HashMap<&str, usize> = HashMap::new();
        for (i, id) in identities.iter().enumerate() {
            if id.url.is_empty() {
                continue;
            }
            match first_by_url.get(id.url.as_str()) {
                Some(&first) => sets.union(first, i),
                None => {
                    first_by_url.insert(id.url.as_str(), i);
                }
            }
        }

        let tokens: Vec<HashSet<String>> = identities.iter().map(|id| id.tokens.clone()).collect();
        for (i, j) in candidate_pairs(&tokens, self.config.pairwise_limit) {
            let (a, b) = (&identities[i], &identities[j]);
            if a.title.is_empty() || b.title.is_empty() || sets.find(i) == sets.find(j) {
                continue;
            }
            if text::normalized_similarity(&a.title, &b.title) >= self.config.title_threshold {
                sets.union(i, j);
            }
        }

        let weighted: Vec<f64> = valid
            .iter()
            .map(|a| a.weighted_quality(&self.source_weights))
            .collect();

        let mut keep = vec![false; valid.len()];
        let mut url_duplicates = 0;
        let mut title_duplicates = 0;
        for group in sets.groups() {
            let winner = group
                .iter()
                .copied()
                .min_by(|&a, &b| {
                    desc(weighted[a], weighted[b])
                        .then(valid[a].published_at.cmp(&valid[b].published_at))
                        .then(a.cmp(&b))
                })
                .unwrap_or(group[0]);
            keep[winner] = true;
            for &i in group.iter().filter(|&&i| i != winner) {
                let url = &identities[i].url;
                let shares_url = !url.is_empty()
                    && group.iter().any(|&k| k != i && identities[k].url == *url);
                if shares_url {
                    url_duplicates += 1;
                } else {
                    title_duplicates += 1;
                }
            }
        }

        let survivors: Vec<Article> = valid
            .into_iter()
            .zip(keep)
            .filter_map(|(a, kept)| kept.then_some(a))
            .collect();

        let stats = DedupStats {
            input,
            malformed: malformed.len(),
            url_duplicates,
            title_duplicates,
            output: survivors.len(),
        };
        info!(
            input = stats.input,
            output = stats.output,
            malformed = stats.malformed,
            url_duplicates = stats.url_duplicates,
            title_duplicates = stats.title_duplicates,
            "deduplication complete"
        );
        DedupOutput {
            articles: survivors,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceCategory;
    use chrono::{Duration, TimeZone, Utc};

    fn dedup(pairwise_limit: usize) -> Deduplicator {
        Deduplicator::new(
            DedupConfig {
                title_threshold: 0.85,
                pairwise_limit,
            },
            SourceWeights::default(),
        )
    }

    fn article(source: &str, category: SourceCategory, title: &str, url: &str, minute: i64) -> Article {
        let base = Utc.with_ymd_and_hms(2024, 6, 3, 6, 0, 0).unwrap();
        Article::new(source, category, title, url, base + Duration::minutes(minute)).with_quality(0.8)
    }

    #[test]
    fn shared_url_keeps_exactly_one() {
        let mut articles = Vec::new();
        for i in 0..95 {
            articles.push(article("feed", SourceCategory::Regional, "", &format!("https://n.test/{}", i), i));
        }
        for i in 0..5 {
            articles.push(article(
                &format!("outlet-{}", i),
                SourceCategory::Mainstream,
                &format!("Headline variant {}", ["one", "two", "three", "four", "five"][i]),
                "https://wire.test/shared-story",
                100 + i as i64,
            ));
        }
        let out = dedup(500).deduplicate(articles);
        assert_eq!(out.articles.len(), 96);
        assert_eq!(out.stats.url_duplicates, 4);
        let shared = out
            .articles
            .iter()
            .filter(|a| a.url == "https://wire.test/shared-story")
            .count();
        assert_eq!(shared, 1);
    }

    #[test]
    fn reworded_title_collapses_to_higher_weight_source() {
        let articles = vec![
            article("wire", SourceCategory::Mainstream, "Putin meets Xi in Moscow", "https://a.test/1", 0),
            article("institute", SourceCategory::ThinkTank, "Putin and Xi hold talks in Moscow", "https://b.test/2", 5),
        ];
        let out = dedup(500).deduplicate(articles);
        assert_eq!(out.articles.len(), 1);
        assert_eq!(out.articles[0].source, "institute");
        assert_eq!(out.stats.title_duplicates, 1);
    }

    #[test]
    fn bucketed_comparison_still_finds_shared_token_duplicates() {
        let articles = vec![
            article("wire", SourceCategory::Mainstream, "Putin meets Xi in Moscow", "https://a.test/1", 0),
            article("oil", SourceCategory::Analysis, "Oil prices rise after OPEC cut", "https://c.test/3", 1),
            article("wire2", SourceCategory::Mainstream, "Putin and Xi hold talks in Moscow", "https://b.test/2", 5),
        ];
        let out = dedup(1).deduplicate(articles);
        assert_eq!(out.articles.len(), 2);
        assert_eq!(out.articles[0].title, "Putin meets Xi in Moscow");
        assert_eq!(out.articles[1].title, "Oil prices rise after OPEC cut");
    }

    #[test]
    fn bucketed_comparison_covers_titles_of_short_words() {
        let articles = vec![
            article("wire", SourceCategory::Mainstream, "US, EU and UK", "https://a.test/1", 0),
            article("oil", SourceCategory::Analysis, "Oil prices rise after OPEC cut", "https://c.test/3", 1),
            article("desk", SourceCategory::Mainstream, "US / EU / UK", "https://b.test/2", 5),
            article("gas", SourceCategory::Analysis, "Gas storage refill slows", "https://d.test/4", 6),
        ];
        let out = dedup(2).deduplicate(articles);
        assert_eq!(out.articles.len(), 3);
        assert_eq!(out.stats.title_duplicates, 1);
        assert_eq!(out.articles[0].title, "US, EU and UK");
    }

    #[test]
    fn tracking_parameters_do_not_hide_duplicates() {
        let articles = vec![
            article("a", SourceCategory::Regional, "Arctic shipping lanes open", "https://x.test/arctic/?utm_source=rss", 0),
            article("b", SourceCategory::Regional, "Completely different wording here", "https://X.test/arctic#comments", 1),
        ];
        let out = dedup(500).deduplicate(articles);
        assert_eq!(out.articles.len(), 1);
        assert_eq!(out.stats.url_duplicates, 1);
    }

    #[test]
    fn ties_prefer_earliest_publication_then_position() {
        let later_first = vec![
            article("a", SourceCategory::Regional, "Story", "https://s.test/x", 10),
            article("b", SourceCategory::Regional, "Story", "https://s.test/x", 2),
        ];
        let out = dedup(500).deduplicate(later_first);
        assert_eq!(out.articles[0].source, "b");

        let same_time = vec![
            article("a", SourceCategory::Regional, "Story", "https://s.test/x", 0),
            article("b", SourceCategory::Regional, "Story", "https://s.test/x", 0),
        ];
        let out = dedup(500).deduplicate(same_time);
        assert_eq!(out.articles[0].source, "a");
    }

    #[test]
    fn malformed_and_untitled_articles() {
        let articles = vec![
            article("broken", SourceCategory::Regional, " ", "", 0),
            article("a", SourceCategory::Regional, "", "https://u.test/1", 1),
            article("b", SourceCategory::Regional, "", "https://u.test/2", 2),
        ];
        let out = dedup(500).deduplicate(articles);
        assert_eq!(out.stats.malformed, 1);
        assert_eq!(out.articles.len(), 2);
    }

    #[test]
    fn survivors_have_unique_urls_and_dissimilar_titles() {
        let titles = [
            "Putin meets Xi in Moscow",
            "Putin and Xi hold talks in Moscow",
            "NATO expands Baltic air patrols",
            "NATO expands Baltic air patrol mission",
            "Semiconductor export curbs tighten",
            "Oil prices rise after OPEC cut",
        ];
        let articles: Vec<Article> = titles
            .iter()
            .enumerate()
            .map(|(i, t)| article(&format!("s{}", i), SourceCategory::Analysis, t, &format!("https://d.test/{}", i % 5), i as i64))
            .collect();
        let out = dedup(500).deduplicate(articles);
        let mut urls = HashSet::new();
        for a in &out.articles {
            assert!(urls.insert(text::normalize_url(&a.url)));
        }
        for (i, a) in out.articles.iter().enumerate() {
            for b in &out.articles[i + 1..] {
                assert!(text::title_similarity(&a.title, &b.title) < 0.85);
            }
        }
    }
}

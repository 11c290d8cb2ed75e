//! Stage 3: strategic selection. Local and deterministic.

use serde::Serialize;
use tracing::warn;

use crate::models::{desc, ContentType, StoryScores};

/// One analyzed cluster competing for a slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub cluster_id: String,
    /// Rank of the cluster in clustering output; breaks score ties.
    pub position: usize,
    pub content_type: ContentType,
    pub scores: StoryScores,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    /// Selected cluster ids in final story order
    pub selected: Vec<String>,
    pub not_selected: Vec<String>,
    /// Whether the breaking-news cap had to be relaxed to fill the target
    pub relaxed: bool,
}

pub fn composite(scores: &StoryScores) -> f64 {
    0.35 * scores.impact + 0.25 * scores.urgency + 0.20 * scores.novelty + 0.20 * scores.credibility
}

/// Picks up to `target` candidates by composite score with at most
/// floor(target * breaking_ratio) breaking stories. When too few other candidates
/// exist, the remaining slots are filled from skipped breaking stories in score order.
pub fn select(candidates: &[Candidate], target: usize, breaking_ratio: f64) -> Selection {
    let mut ranked: Vec<(&Candidate, f64)> = candidates.iter().map(|c| (c, composite(&c.scores))).collect();
    ranked.sort_by(|(a, sa), (b, sb)| {
        desc(*sa, *sb)
            .then(a.position.cmp(&b.position))
            .then_with(|| a.cluster_id.cmp(&b.cluster_id))
    });

    let max_breaking = (target as f64 * breaking_ratio.clamp(0.0, 1.0)).floor() as usize;
    let mut picked: Vec<usize> = Vec::new();
    let mut held_back: Vec<usize> = Vec::new();
    let mut breaking = 0;
    for (i, (candidate, _)) in ranked.iter().enumerate() {
        if picked.len() == target {
            break;
        }
        if candidate.content_type == ContentType::BreakingNews {
            if breaking >= max_breaking {
                held_back.push(i);
                continue;
            }
            breaking += 1;
        }
        picked.push(i);
    }

    let mut relaxed = false;
    if picked.len() < target && !held_back.is_empty() {
        let missing = target - picked.len();
        warn!(
            target,
            max_breaking,
            filling = missing.min(held_back.len()),
            "not enough non-breaking stories; relaxing breaking news cap"
        );
        picked.extend(held_back.into_iter().take(missing));
        relaxed = true;
    }
    picked.sort_unstable();

    let selected: Vec<String> = picked.iter().map(|&i| ranked[i].0.cluster_id.clone()).collect();
    let not_selected = ranked
        .iter()
        .enumerate()
        .filter(|(i, _)| picked.binary_search(i).is_err())
        .map(|(_, (c, _))| c.cluster_id.clone())
        .collect();
    Selection {
        selected,
        not_selected,
        relaxed,
    }
}

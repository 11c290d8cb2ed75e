//! Union-find and candidate-pair generation shared by dedup and clustering.

use std::collections::{BTreeSet, HashMap, HashSet};

/// Disjoint sets over `0..n` with path halving. The root of a set is its smallest index.
#[derive(Debug)]
pub(crate) struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    pub(crate) fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    pub(crate) fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        let (low, high) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[high] = low;
    }

    /// Members of every set, each set and the list ordered by smallest index.
    pub(crate) fn groups(&mut self) -> Vec<Vec<usize>> {
        let mut by_root: HashMap<usize, Vec<usize>> = HashMap::new();
        for i in 0..self.parent.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(i);
        }
        let mut groups: Vec<Vec<usize>> = by_root.into_values().collect();
        groups.sort_by_key(|g| g[0]);
        groups
    }
}

const PREFIX_CHARS: usize = 4;

/// Blocking keys of one item: each token and its leading characters, so inflected forms
/// ("talk", "talks") land in the same bucket.
fn blocking_keys(set: &HashSet<String>) -> HashSet<&str> {
    let mut keys = HashSet::new();
    for token in set {
        keys.insert(token.as_str());
        if let Some((end, _)) = token.char_indices().nth(PREFIX_CHARS) {
            keys.insert(&token[..end]);
        }
    }
    keys
}

/// Index pairs `(i, j)` with `i < j` worth comparing.
///
/// Up to `pairwise_limit` items every pair is returned. Beyond that items are paired when
/// they share a token or a token prefix, and items with no tokens at all are paired with
/// every other item.
pub(crate) fn candidate_pairs(tokens: &[HashSet<String>], pairwise_limit: usize) -> Vec<(usize, usize)> {
    let n = tokens.len();
    if n <= pairwise_limit {
        return (0..n)
            .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
            .collect();
    }
    let mut buckets: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut pairs = BTreeSet::new();
    for (i, set) in tokens.iter().enumerate() {
        if set.is_empty() {
            for j in (0..n).filter(|&j| j != i) {
                pairs.insert((i.min(j), i.max(j)));
            }
            continue;
        }
        for key in blocking_keys(set) {
            buckets.entry(key).or_default().push(i);
        }
    }
    for members in buckets.values() {
        for (k, &i) in members.iter().enumerate() {
            for &j in &members[k + 1..] {
                pairs.insert((i.min(j), i.max(j)));
            }
        }
    }
    pairs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(words: &[&str]) -> HashSet<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn union_find_groups_transitively() {
        let mut sets = DisjointSet::new(5);
        sets.union(3, 1);
        sets.union(1, 4);
        assert_eq!(sets.groups(), vec![vec![0], vec![1, 3, 4], vec![2]]);
    }

    #[test]
    fn small_inputs_compare_every_pair() {
        let tokens = vec![set(&["a"]), set(&["b"]), set(&["c"])];
        assert_eq!(candidate_pairs(&tokens, 10), vec![(0, 1), (0, 2), (1, 2)]);
    }

    #[test]
    fn large_inputs_only_pair_shared_tokens() {
        let tokens = vec![
            set(&["putin", "moscow"]),
            set(&["oil", "opec"]),
            set(&["moscow", "talks"]),
            set(&["opec"]),
        ];
        assert_eq!(candidate_pairs(&tokens, 2), vec![(0, 2), (1, 3)]);
    }

    #[test]
    fn large_inputs_pair_tokenless_items_with_everything() {
        let tokens = vec![
            set(&["putin", "moscow"]),
            HashSet::new(),
            set(&["oil", "opec"]),
            HashSet::new(),
        ];
        assert_eq!(
            candidate_pairs(&tokens, 2),
            vec![(0, 1), (0, 3), (1, 2), (1, 3), (2, 3)]
        );
    }

    #[test]
    fn large_inputs_pair_inflected_tokens() {
        let tokens = vec![set(&["talks", "stall"]), set(&["talk", "stalled"]), set(&["opec"])];
        assert_eq!(candidate_pairs(&tokens, 1), vec![(0, 1)]);
    }
}

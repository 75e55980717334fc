// Copyright (C) 2025-2026 Michael Herstine <sp1ff@pobox.com>
//
// This file is part of drover.
//
// drover is free software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// drover is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without
// even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with drover.  If not,
// see <http://www.gnu.org/licenses/>.

//! # rec_tree
//!
//! The adaptive bootstrap decision-tree ensemble.
//!
//! Each tree is ternary: a node carries a splitting item and `like` / `unknown` / `dislike`
//! branches chosen by how a record scored that item (at or above half the score range, below it,
//! or not at all). Roots are the most frequently scored items; descending a tree with a user's
//! scores yields the traversed items as *primary* candidates and the terminal leaf's top-N list
//! as *secondary* candidates. The splitting criterion ranks a candidate item `e` within a bucket
//! by `(sum(e)^2 - sum_sq(e)) / n(e)` — a larger value means more records score `e`, and score it
//! consistently.
//!
//! This is a heuristic; no optimality claim is made. All iteration orders are fixed (frequency
//! then item id) so a rebuild over the same records produces the same ensemble.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::entities::{ItemId, ScoreMap};

/// Knobs for [build]; the caller (the recommender shard) sources these from configuration.
#[derive(Clone, Copy, Debug)]
pub struct BuildParams {
    pub max_depth: u32,
    pub max_score: u8,
    pub num_of_trees: usize,
    /// Leaf list length per branch.
    pub max_secondary: usize,
}

/// A surfaced leaf candidate: the item, its bucket score, and its in-bucket average rating.
#[derive(Clone, Copy, Debug)]
pub struct LeafEntry {
    pub item: ItemId,
    pub score: f64,
    pub avg: f64,
}

enum Branch {
    Node(Box<Node>),
    Leaf(Vec<LeafEntry>),
}

struct Node {
    value: ItemId,
    like: Branch,
    unknown: Branch,
    dislike: Branch,
}

pub struct Ensemble {
    trees: Vec<Node>,
    max_score: u8,
    /// When set, query results may include items the caller already rated; used only to measure
    /// prediction quality against held-out data.
    test_mode: bool,
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            building                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Copy, Default)]
struct Acc {
    n: u64,
    sum: u64,
    sum_sq: u64,
}

impl Acc {
    fn push(&mut self, score: u8) {
        let s = score as u64;
        self.n += 1;
        self.sum += s;
        self.sum_sq += s * s;
    }
    /// The bucket score `(sum^2 - sum_sq) / n`; zero when the item was never scored here.
    fn score(&self) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        let sum = self.sum as f64;
        (sum * sum - self.sum_sq as f64) / self.n as f64
    }
    fn avg(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum as f64 / self.n as f64
        }
    }
}

struct Builder<'a> {
    records: &'a [ScoreMap],
    params: BuildParams,
    half: f64,
    /// Nodes smaller than a tenth of the record set stop splitting.
    min_split: usize,
}

/// Build an ensemble plus the per-item global score averages.
///
/// `num_of_trees` is clamped to the number of distinct items before root selection.
pub fn build(records: &[ScoreMap], params: BuildParams) -> (Ensemble, HashMap<ItemId, f64>) {
    let mut global: BTreeMap<ItemId, Acc> = BTreeMap::new();
    for record in records {
        for (&item, &score) in record {
            global.entry(item).or_default().push(score);
        }
    }
    let avgs: HashMap<ItemId, f64> = global.iter().map(|(&i, acc)| (i, acc.avg())).collect();

    let mut by_freq: Vec<(&ItemId, &Acc)> = global.iter().collect();
    by_freq.sort_by(|a, b| b.1.n.cmp(&a.1.n).then(a.0.cmp(b.0)));
    let num_trees = params.num_of_trees.min(by_freq.len());

    let builder = Builder {
        records,
        params,
        half: params.max_score as f64 / 2.0,
        min_split: records.len() / 10,
    };

    let all: Vec<usize> = (0..records.len()).collect();
    let trees = by_freq[..num_trees]
        .iter()
        .map(|&(&root, _)| {
            let pool: BTreeSet<ItemId> = global.keys().copied().filter(|&i| i != root).collect();
            builder.node(root, &pool, &all, 0)
        })
        .collect();

    (
        Ensemble {
            trees,
            max_score: params.max_score,
            test_mode: false,
        },
        avgs,
    )
}

impl Builder<'_> {
    fn node(&self, value: ItemId, pool: &BTreeSet<ItemId>, idxs: &[usize], depth: u32) -> Node {
        // Partition on the splitting item: rated at or above half the range, below it, or absent.
        let mut like = Vec::new();
        let mut hate = Vec::new();
        let mut unknown = Vec::new();
        for &i in idxs {
            match self.records[i].get(&value) {
                Some(&s) if s as f64 >= self.half => like.push(i),
                Some(_) => hate.push(i),
                None => unknown.push(i),
            }
        }

        let terminal = depth > self.params.max_depth || idxs.len() < self.min_split;
        let branch = |bucket: &[usize]| -> Branch {
            let stats = self.bucket_stats(bucket, pool);
            if terminal {
                return Branch::Leaf(self.leaf_entries(&stats));
            }
            match self.winner(&stats) {
                // Recurse only where the winning item is genuinely liked within the bucket;
                // each branch drops its own winner from the candidate pool.
                Some((item, acc)) if !bucket.is_empty() && acc.avg() >= self.half + 1.0 => {
                    let mut narrowed = pool.clone();
                    narrowed.remove(&item);
                    Branch::Node(Box::new(self.node(item, &narrowed, bucket, depth + 1)))
                }
                _ => Branch::Leaf(self.leaf_entries(&stats)),
            }
        };

        Node {
            value,
            like: branch(&like),
            unknown: branch(&unknown),
            dislike: branch(&hate),
        }
    }

    fn bucket_stats(&self, idxs: &[usize], pool: &BTreeSet<ItemId>) -> BTreeMap<ItemId, Acc> {
        let mut stats: BTreeMap<ItemId, Acc> = BTreeMap::new();
        for &i in idxs {
            for (item, &score) in &self.records[i] {
                if pool.contains(item) {
                    stats.entry(*item).or_default().push(score);
                }
            }
        }
        stats
    }

    /// The candidate with the highest bucket score. Ascending-id iteration with a strict
    /// comparison makes the tie-break the smallest item id.
    fn winner(&self, stats: &BTreeMap<ItemId, Acc>) -> Option<(ItemId, Acc)> {
        let mut best: Option<(ItemId, Acc)> = None;
        for (&item, acc) in stats {
            if acc.n == 0 {
                continue;
            }
            match best {
                Some((_, b)) if acc.score() <= b.score() => {}
                _ => best = Some((item, *acc)),
            }
        }
        best
    }

    fn leaf_entries(&self, stats: &BTreeMap<ItemId, Acc>) -> Vec<LeafEntry> {
        let mut entries: Vec<LeafEntry> = stats
            .iter()
            .filter(|(_, acc)| acc.n > 0)
            .map(|(&item, acc)| LeafEntry {
                item,
                score: acc.score(),
                avg: acc.avg(),
            })
            .collect();
        entries.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.item.cmp(&b.item)));
        entries.truncate(self.params.max_secondary);
        entries
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                            querying                                            //
////////////////////////////////////////////////////////////////////////////////////////////////////

impl Ensemble {
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn set_test_mode(&mut self, on: bool) {
        self.test_mode = on;
    }

    /// Descend every tree with the caller's scores and compile up to `max_recs` recommendations:
    /// deepest-first, primary candidates (traversed node items) before secondary candidates (the
    /// terminal leaves' lists, ranked by bucket score). Items the caller already rated are
    /// skipped unless test mode is on; the result never contains duplicates.
    pub fn recommend(&self, scores: &ScoreMap, max_recs: usize) -> Vec<ItemId> {
        let half = self.max_score as f64 / 2.0;
        let mut primaries: Vec<(u32, ItemId)> = Vec::new();
        let mut secondaries: Vec<LeafEntry> = Vec::new();
        for tree in &self.trees {
            let mut node = tree;
            let mut depth = 0u32;
            loop {
                primaries.push((depth, node.value));
                let branch = match scores.get(&node.value) {
                    Some(&s) if s as f64 >= half => &node.like,
                    Some(_) => &node.dislike,
                    None => &node.unknown,
                };
                match branch {
                    Branch::Node(next) => {
                        node = next.as_ref();
                        depth += 1;
                    }
                    Branch::Leaf(entries) => {
                        secondaries.extend_from_slice(entries);
                        break;
                    }
                }
            }
        }

        primaries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        secondaries.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.item.cmp(&b.item)));

        let mut seen: HashSet<ItemId> = HashSet::new();
        let mut recs = Vec::with_capacity(max_recs);
        let candidates = primaries
            .into_iter()
            .map(|(_, item)| item)
            .chain(secondaries.into_iter().map(|e| e.item));
        for item in candidates {
            if recs.len() == max_recs {
                break;
            }
            if !self.test_mode && scores.contains_key(&item) {
                continue;
            }
            if seen.insert(item) {
                recs.push(item);
            }
        }
        recs
    }
}

/// Root-mean-square deviation between the (implicitly "liked") recommendations and the held-out
/// records' actual scores, over the items where they overlap. `None` when nothing overlapped.
/// Callers must have test mode on for the overlap to be non-trivial.
pub fn rmsd(ensemble: &Ensemble, held_out: &[ScoreMap], per_query: usize) -> Option<f64> {
    let max = ensemble.max_score as f64;
    let mut quad = 0.0f64;
    let mut compared = 0usize;
    for record in held_out {
        for item in ensemble.recommend(record, per_query) {
            if let Some(&score) = record.get(&item) {
                let err = 1.0 - score as f64 / max;
                quad += err * err;
                compared += 1;
            }
        }
    }
    (compared > 0).then(|| (quad / compared as f64).sqrt())
}

#[cfg(test)]
mod test {
    use super::*;

    fn record(pairs: &[(ItemId, u8)]) -> ScoreMap {
        pairs.iter().copied().collect()
    }

    /// Two "taste clusters" over disjoint item ranges: members rate their own cluster high, and
    /// the occasional record pans one item from the other cluster.
    fn clustered(n: usize) -> Vec<ScoreMap> {
        (0..n)
            .map(|i| {
                let base: ItemId = if i % 2 == 0 { 0 } else { 100 };
                let other: ItemId = if i % 2 == 0 { 100 } else { 0 };
                let mut r = ScoreMap::new();
                for j in 0..6u64 {
                    r.insert(base + j, 4 + ((i as u64 + j) % 2) as u8);
                }
                if i % 10 == 0 {
                    r.insert(other, 2);
                }
                r
            })
            .collect()
    }

    fn params() -> BuildParams {
        BuildParams {
            max_depth: 10,
            max_score: 5,
            num_of_trees: 4,
            max_secondary: 20,
        }
    }

    fn walk_paths(node: &Node, path: &mut Vec<ItemId>) {
        assert!(
            !path.contains(&node.value),
            "item {} repeats along a root-to-leaf path",
            node.value
        );
        path.push(node.value);
        for branch in [&node.like, &node.unknown, &node.dislike] {
            if let Branch::Node(next) = branch {
                walk_paths(next, path);
            }
        }
        path.pop();
    }

    #[test]
    fn paths_never_repeat_items() {
        let (ensemble, _) = build(&clustered(200), params());
        assert!(!ensemble.is_empty());
        for tree in &ensemble.trees {
            walk_paths(tree, &mut Vec::new());
        }
    }

    #[test]
    fn recommendations_skip_rated_items_and_never_duplicate() {
        let (ensemble, _) = build(&clustered(200), params());
        let query = record(&[(0, 5), (1, 4)]);
        let recs = ensemble.recommend(&query, 10);
        assert!(!recs.is_empty());
        let unique: HashSet<_> = recs.iter().collect();
        assert_eq!(unique.len(), recs.len());
        assert!(!recs.contains(&0) && !recs.contains(&1));
        // the rest of the liked cluster should be reachable
        assert!(recs.iter().any(|&i| (2..6).contains(&i)));
    }

    #[test]
    fn test_mode_admits_rated_items() {
        let (mut ensemble, _) = build(&clustered(200), params());
        ensemble.set_test_mode(true);
        let query = record(&[(0, 5), (2, 5), (3, 4)]);
        let recs = ensemble.recommend(&query, 10);
        assert!(recs.iter().any(|i| query.contains_key(i)));
    }

    #[test]
    fn ensemble_size_clamps_to_distinct_items() {
        let records = vec![record(&[(1, 5), (2, 4)]); 50];
        let (ensemble, _) = build(
            &records,
            BuildParams {
                num_of_trees: 10,
                ..params()
            },
        );
        assert_eq!(ensemble.len(), 2);
    }

    #[test]
    fn max_recs_beyond_pool_returns_what_exists() {
        let (ensemble, _) = build(&clustered(100), params());
        let recs = ensemble.recommend(&record(&[(0, 5)]), 10_000);
        assert!(!recs.is_empty());
        assert!(recs.len() < 10_000);
    }

    #[test]
    fn rebuild_is_deterministic() {
        let records = clustered(150);
        let (a, avg_a) = build(&records, params());
        let (b, avg_b) = build(&records, params());
        let query = record(&[(100, 5), (101, 5)]);
        assert_eq!(a.recommend(&query, 8), b.recommend(&query, 8));
        assert_eq!(avg_a.len(), avg_b.len());
    }

    #[test]
    fn global_averages() {
        let records = vec![record(&[(7, 4)]), record(&[(7, 2)])];
        let (_, avgs) = build(&records, params());
        assert!((avgs[&7] - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn clustered_data_predicts_well() {
        let training = clustered(400);
        let held_out = clustered(40);
        let (mut ensemble, _) = build(&training, params());
        ensemble.set_test_mode(true);
        let deviation = rmsd(&ensemble, &held_out, 10).expect("no overlapping items");
        assert!(deviation <= 0.3, "rmsd {deviation} over 0.3");
    }
}

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

//! The prediction-quality gate: train on 10,000 synthetic records, hold 1,000 out, and require
//! the root-mean-square deviation between what the ensemble surfaces and what the held-out users
//! actually scored to stay at or under 0.3.

use std::collections::HashMap;

use rand::{rngs::StdRng, Rng, SeedableRng};

use drover::rec_tree::{build, rmsd, BuildParams};

const CLUSTERS: u64 = 20;
const ITEMS_PER_CLUSTER: u64 = 30;
const RATINGS_PER_RECORD: usize = 12;

/// Taste-clustered records: each belongs to one cluster and rates a dozen of its items, mostly
/// favourably, with the occasional middling or sour score so the full 1..=5 range appears.
fn synthesize(n: usize, rng: &mut StdRng) -> Vec<HashMap<u64, u8>> {
    (0..n)
        .map(|_| {
            let cluster = rng.gen_range(0..CLUSTERS);
            let picks = rand::seq::index::sample(rng, ITEMS_PER_CLUSTER as usize, RATINGS_PER_RECORD);
            picks
                .iter()
                .map(|offset| {
                    let item = cluster * ITEMS_PER_CLUSTER + offset as u64;
                    let score = match rng.gen_range(0..100u32) {
                        0..=54 => 5,
                        55..=89 => 4,
                        90..=96 => 3,
                        97..=98 => 2,
                        _ => 1,
                    };
                    (item, score)
                })
                .collect()
        })
        .collect()
}

#[test]
fn rmsd_stays_under_the_gate() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let training = synthesize(10_000, &mut rng);
    let held_out = synthesize(1_000, &mut rng);

    let (mut ensemble, _) = build(
        &training,
        BuildParams {
            max_depth: 50,
            max_score: 5,
            num_of_trees: 3,
            max_secondary: 20,
        },
    );
    assert_eq!(ensemble.len(), 3);
    ensemble.set_test_mode(true);

    let deviation = rmsd(&ensemble, &held_out, 10).expect("no overlapping items at all");
    assert!(
        deviation <= 0.3,
        "root-mean-square deviation {deviation} exceeds the 0.3 gate"
    );
}

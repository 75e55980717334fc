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

//! End-to-end scenarios: whole instances over shared in-memory backends, talking real HTTP.

use std::time::Duration;

use drover_test::{Harness, BACKUP_PREFIX, USER};

async fn insert(
    harness: &Harness,
    index: usize,
    group: &str,
    key: &str,
    id: u64,
    scores: &serde_json::Value,
) -> (u16, String) {
    harness
        .post_form(
            index,
            "/rec",
            &[
                ("uid", USER),
                ("key", key),
                ("group", group),
                ("id", &id.to_string()),
                ("scores", &scores.to_string()),
                ("insert", "true"),
            ],
        )
        .await
}

async fn query(
    harness: &Harness,
    index: usize,
    group: &str,
    key: &str,
    id: u64,
    scores: &str,
    max_recs: u32,
) -> (u16, serde_json::Value) {
    harness
        .post_json(
            index,
            "/rec",
            &[
                ("uid", USER),
                ("key", key),
                ("group", group),
                ("id", &id.to_string()),
                ("scores", scores),
                ("max_recs", &max_recs.to_string()),
            ],
        )
        .await
}

/// Ten scored items for record `r`, drawn from a twenty-item universe.
fn synthetic_scores(r: u64) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = (0..10u64)
        .map(|j| (((r + j) % 20).to_string(), serde_json::json!((r + j) % 6)))
        .collect();
    serde_json::Value::Object(map)
}

/// Poll until a query comes back `success: true` (the first tree has been built).
async fn wait_for_recommendations(
    harness: &Harness,
    index: usize,
    group: &str,
    key: &str,
    max_recs: u32,
) -> serde_json::Value {
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let (status, body) = query(harness, index, group, key, 200, r#"{"0": 5}"#, max_recs).await;
        if status == 200 && body["success"] == serde_json::json!(true) {
            return body;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no recommendations in time; last response {status}: {body}"
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_instance_ingest_and_query() {
    let harness = Harness::start(1).await;
    let (group, key) = harness.add_group(0, "g1", "s", 1, 5).await;
    harness
        .wait_for_owners(0, &group, &key, 1, Duration::from_secs(10))
        .await;

    for r in 0..100u64 {
        let (status, body) = insert(&harness, 0, &group, &key, r, &synthetic_scores(r)).await;
        assert_eq!(status, 200, "insert failed: {body}");
    }

    let body = wait_for_recommendations(&harness, 0, &group, &key, 3).await;
    let recs = body["recs"].as_array().expect("no recs array");
    assert_eq!(recs.len(), 3, "expected exactly three recommendations");
    assert!(
        !recs.contains(&serde_json::json!(0)),
        "recommended an item the caller already rated: {recs:?}"
    );
    assert!(body["stored_elements"].as_u64().unwrap() > 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn requests_forward_to_the_owner() {
    let harness = Harness::start(2).await;
    let (group, key) = harness.add_group(0, "movies", "s", 1, 5).await;
    // both instances have to know who owns the shard before we can route through either
    harness
        .wait_for_owners(0, &group, &key, 1, Duration::from_secs(10))
        .await;
    harness
        .wait_for_owners(1, &group, &key, 1, Duration::from_secs(10))
        .await;

    let owner = harness.owner_index(&group).expect("nobody owns the shard");
    let other = 1 - owner;

    // ingest through the non-owner: every one of these is relayed
    for r in 0..100u64 {
        let (status, body) = insert(&harness, other, &group, &key, r, &synthetic_scores(r)).await;
        assert_eq!(status, 200, "forwarded insert failed: {body}");
    }

    let direct = wait_for_recommendations(&harness, owner, &group, &key, 5).await;
    let (status, relayed) = query(&harness, other, &group, &key, 200, r#"{"0": 5}"#, 5).await;
    assert_eq!(status, 200);
    // the non-owner's answer is the owner's answer, relayed verbatim
    assert_eq!(relayed["success"], serde_json::json!(true));
    assert_eq!(direct["recs"], relayed["recs"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn query_rate_limits_return_429() {
    let harness = Harness::start(1).await;
    // the "tiny" tier allows ten queries a second per shard
    let (group, key) = harness.add_group(0, "busy", "tiny", 1, 5).await;
    harness
        .wait_for_owners(0, &group, &key, 1, Duration::from_secs(10))
        .await;

    let mut saw_limit = false;
    'bursts: for _ in 0..5 {
        for _ in 0..15 {
            let (status, _) = query(&harness, 0, &group, &key, 1, r#"{"1": 3}"#, 1).await;
            if status == 429 {
                saw_limit = true;
                break 'bursts;
            }
        }
    }
    assert!(saw_limit, "fifteen queries in a second never hit the limit");

    // once the window rotates, service resumes
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let (status, body) = query(&harness, 0, &group, &key, 1, r#"{"1": 3}"#, 1).await;
    assert_ne!(status, 429, "still limited after the window: {body}");
}

#[tokio::test(flavor = "multi_thread")]
async fn ownership_fails_over_after_a_crash() {
    let mut harness = Harness::start(3).await;
    let (group, key) = harness.add_group(0, "fo", "s", 2, 5).await;
    // a second group so three instances' admission shares cover all four shards
    harness.add_group(0, "pad", "s", 2, 5).await;

    let owners = harness
        .wait_for_owners(0, &group, &key, 2, Duration::from_secs(15))
        .await;
    assert_eq!(owners.len(), 2);

    let victim = harness.owner_index(&group).expect("nobody owns a shard");
    let victim_host = harness.instances[victim].hostname.clone();
    harness.crash(victim);
    let survivor = (0..3).find(|&i| i != victim).expect("no survivor");

    // within lease-ttl + renewal the fleet re-owns the orphaned shard
    let deadline = std::time::Instant::now() + Duration::from_secs(20);
    loop {
        let info = harness.info(survivor, &group, &key).await;
        if info.len() == 2 && !info.contains_key(&victim_host) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no failover; owners now {:?}",
            info.keys().collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn snapshots_survive_an_instance_generation() {
    let mut harness = Harness::start(1).await;
    let (group, key) = harness.add_group(0, "snap", "s", 1, 5).await;
    harness
        .wait_for_owners(0, &group, &key, 1, Duration::from_secs(10))
        .await;

    // 500 records, one scored cell each, scores in 1..=5
    for r in 0..500u64 {
        let scores = serde_json::json!({ (r % 50).to_string(): 1 + r % 5 });
        let (status, body) = insert(&harness, 0, &group, &key, r, &scores).await;
        assert_eq!(status, 200, "insert failed: {body}");
    }

    // wait for the rebuild loop to persist a snapshot covering the full ingest
    let blob_key = drover::recommender::snapshot_key(BACKUP_PREFIX, &format!("{group}:0"));
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while !harness.blobs.contains(&blob_key) {
        assert!(std::time::Instant::now() < deadline, "no snapshot written");
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    tokio::time::sleep(Duration::from_millis(2500)).await; // one more pass banks the tail

    harness.stop(0).await;
    let fresh = harness.add_instance().await;
    harness
        .wait_for_owners(fresh, &group, &key, 1, Duration::from_secs(15))
        .await;

    let info = harness.info(fresh, &group, &key).await;
    let host = harness.instances[fresh].hostname.clone();
    let blob = info.get(&host).expect("the fresh instance isn't an owner");
    assert_eq!(
        blob["stored_elements"],
        serde_json::json!(500),
        "restored shard is missing records: {blob}"
    );
    assert_eq!(blob["rec_tree_status"], serde_json::json!("ACTIVE"));
}

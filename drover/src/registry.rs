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

//! # registry
//!
//! Instance liveness over the coordination store. Every instance heartbeats a row keyed by its
//! hostname; consumers enumerate the currently-live set. A row older than the instance TTL is
//! dead, and any observer that notices a dead row (other than its own) deletes it — cleanup is
//! cooperative, not centralised.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{
    config::CoordinatorConfig,
    entities::Hostname,
    storage::{RowBackend, RowData},
};

pub const INSTANCES_TABLE: &str = "instances";

pub struct Registry {
    rows: Arc<dyn RowBackend + Send + Sync>,
    table: String,
    hostname: Hostname,
    cfg: CoordinatorConfig,
    alive: Mutex<Vec<Hostname>>,
}

impl Registry {
    pub fn new(
        rows: Arc<dyn RowBackend + Send + Sync>,
        prefix: &str,
        hostname: Hostname,
        cfg: CoordinatorConfig,
    ) -> Arc<Registry> {
        Arc::new(Registry {
            rows,
            table: format!("{}_{}", prefix, INSTANCES_TABLE),
            hostname,
            cfg,
            alive: Mutex::new(Vec::new()),
        })
    }

    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    /// The live hostnames, sorted. A copy — callers hold no lock.
    pub fn live_instances(&self) -> Vec<Hostname> {
        self.alive.lock().unwrap().clone()
    }

    /// The local admission ceiling given the global shard count: an even share, with the
    /// lexicographically last live host absorbing the remainder. Zero while we can't see any
    /// live instance (including ourselves) — better to admit nothing than everything.
    pub fn max_shards_for(&self, total_shards: usize) -> usize {
        let alive = self.alive.lock().unwrap();
        if alive.is_empty() {
            return 0;
        }
        let mut share = total_shards / alive.len();
        if alive.last() == Some(&self.hostname) {
            share += total_shards % alive.len();
        }
        share
    }

    /// Write our liveness row and refresh the live set once.
    pub async fn beat(&self) {
        let now = chrono::Utc::now().timestamp();
        let row = RowData::new(
            self.hostname.as_str(),
            json!({ "hostname": self.hostname, "ts": now }).to_string(),
        )
        .with_attr("ts", now.to_string());
        if let Err(err) = self.rows.put(&self.table, &row).await {
            error!(%err, "failed to register the local instance; will retry");
        }
        self.refresh(now).await;
    }

    async fn refresh(&self, now: i64) {
        let scanned = match self.rows.scan(&self.table).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%err, "failed to scan the instances table; keeping the previous live set");
                return;
            }
        };

        let mut live = Vec::new();
        for row in scanned {
            let ts: i64 = row.attr("ts").and_then(|s| s.parse().ok()).unwrap_or(0);
            if now - ts <= self.cfg.instance_ttl_secs {
                live.push(Hostname::new(row.key.clone()));
            } else if row.key != self.hostname.as_str() {
                info!(instance = %row.key, "removing a dead instance row");
                if let Err(err) = self.rows.delete(&self.table, &row.key).await {
                    error!(instance = %row.key, %err, "failed to remove a dead instance row");
                }
            }
        }
        live.sort();
        debug!(?live, "instances alive");
        *self.alive.lock().unwrap() = live;
    }

    /// Spawn the heartbeat loop; `shutdown` stops it.
    pub fn spawn_heartbeat(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                registry.beat().await;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(registry.cfg.heartbeat_secs)) => (),
                    _ = shutdown.notified() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::MemoryRows;

    fn registry(rows: &Arc<MemoryRows>, host: &str) -> Arc<Registry> {
        Registry::new(
            rows.clone() as Arc<dyn RowBackend + Send + Sync>,
            "test",
            Hostname::new(host),
            CoordinatorConfig {
                instance_ttl_secs: 30,
                ..CoordinatorConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn heartbeat_and_enumeration() {
        let rows = Arc::new(MemoryRows::new());
        let a = registry(&rows, "host-a");
        let b = registry(&rows, "host-b");
        a.beat().await;
        b.beat().await;
        a.beat().await; // see b's row
        assert_eq!(
            a.live_instances(),
            vec![Hostname::new("host-a"), Hostname::new("host-b")]
        );
    }

    #[tokio::test]
    async fn stale_rows_are_dropped_and_deleted() {
        let rows = Arc::new(MemoryRows::new());
        let stale = RowData::new("host-dead", "{}").with_attr("ts", "1");
        rows.put("test_instances", &stale).await.unwrap();
        let a = registry(&rows, "host-a");
        a.beat().await;
        assert_eq!(a.live_instances(), vec![Hostname::new("host-a")]);
        assert!(rows
            .get_consistent("test_instances", "host-dead")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn shard_share_arithmetic() {
        let rows = Arc::new(MemoryRows::new());
        let a = registry(&rows, "host-a");
        let b = registry(&rows, "host-b");
        a.beat().await;
        b.beat().await;
        a.beat().await;
        b.beat().await;
        // 7 shards over two hosts: even share of 3, the lexicographically last absorbs the rest
        assert_eq!(a.max_shards_for(7), 3);
        assert_eq!(b.max_shards_for(7), 4);
    }

    #[tokio::test]
    async fn no_live_instances_admits_nothing() {
        let rows = Arc::new(MemoryRows::new());
        let a = registry(&rows, "host-a");
        assert_eq!(a.max_shards_for(10), 0);
    }
}

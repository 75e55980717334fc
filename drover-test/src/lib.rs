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

//! # The drover Integration Test Framework
//!
//! Stands up a whole fleet in one process: N instances sharing one in-memory coordination store
//! and one in-memory blob store, each bound to its own loopback address (`127.0.0.2`,
//! `127.0.0.3`, ...) on a common port so request forwarding works exactly as it does across real
//! hosts.
//!
//! Each instance runs on its **own** tokio runtime. That buys the tests a realistic kill switch:
//! [Harness::crash] tears the runtime down without any shutdown handshake, so the instance's
//! lease renewals stop mid-flight and the rest of the fleet has to recover through the TTL, just
//! as it would after a real crash. [Harness::stop] is the polite variant (releases leases).
//!
//! All the coordinator intervals are dialed way down; a failover that takes a lease TTL in
//! production takes a few seconds here.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::oneshot;

use drover::{
    api::make_router,
    config::{Config, Tier},
    entities::{GroupId, Hostname, UserId},
    groups::Groups,
    identity::MemoryProvider,
    manager::{Manager, NoopBilling},
    registry::Registry,
    storage::{BlobBackend, MemoryBlobs, MemoryRows, RowBackend},
};

pub const USER: &str = "u1";
pub const USER_KEY: &str = "k1";
pub const ADMIN: &str = "admin@example.com";
pub const ADMIN_KEY: &str = "adminkey";
pub const BACKUP_PREFIX: &str = "testing";

pub struct Instance {
    pub hostname: String,
    pub manager: Arc<Manager>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Instance {
    fn kill(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct Harness {
    pub rows: Arc<MemoryRows>,
    pub blobs: Arc<MemoryBlobs>,
    pub port: u16,
    pub instances: Vec<Instance>,
    pub client: reqwest::Client,
    next_host: u8,
}

/// The coordinator cadence for tests: a four-second lease, one-second ticks.
fn test_config(hostname: &str, port: u16) -> Config {
    let mut cfg = Config::default();
    cfg.http.hostname = Hostname::new(hostname);
    cfg.http.port = port;
    cfg.backups.prefix = BACKUP_PREFIX.to_owned();
    cfg.coordinator.lease_ttl_secs = 4;
    cfg.coordinator.renewal_secs = 1;
    cfg.coordinator.group_refresh_secs = 1;
    cfg.coordinator.stabilization_ms = 25;
    cfg.coordinator.instance_ttl_secs = 3;
    cfg.coordinator.heartbeat_secs = 1;
    cfg.coordinator.rebuild_secs = 1;
    cfg.coordinator.eviction_ms = 50;
    cfg.coordinator.acquire_secs = 1;
    cfg.recommender.min_records_to_start = 50;
    cfg.admin_user = Some(ADMIN.to_owned());
    cfg.tiers = [
        (
            "s".to_owned(),
            Tier {
                reqs: 1000,
                records: 1000,
            },
        ),
        (
            "tiny".to_owned(),
            Tier {
                reqs: 10,
                records: 100_000,
            },
        ),
    ]
    .into();
    cfg
}

impl Harness {
    pub async fn start(instances: usize) -> Harness {
        // probe for a free port; every instance shares it on a distinct loopback address
        let port = {
            let probe = std::net::TcpListener::bind("127.0.0.1:0").expect("no free port");
            probe.local_addr().expect("no local addr").port()
        };
        let mut harness = Harness {
            rows: Arc::new(MemoryRows::new()),
            blobs: Arc::new(MemoryBlobs::new()),
            port,
            instances: Vec::new(),
            client: reqwest::Client::new(),
            next_host: 2,
        };
        for _ in 0..instances {
            harness.add_instance().await;
        }
        harness
    }

    /// Boot one more instance into the fleet; returns its index.
    pub async fn add_instance(&mut self) -> usize {
        let hostname = format!("127.0.0.{}", self.next_host);
        self.next_host += 1;
        let cfg = test_config(&hostname, self.port);

        let rows = Arc::clone(&self.rows) as Arc<dyn RowBackend + Send + Sync>;
        let blobs = Arc::clone(&self.blobs) as Arc<dyn BlobBackend + Send + Sync>;
        let registry = Registry::new(
            Arc::clone(&rows),
            &cfg.aws.prefix,
            cfg.http.hostname.clone(),
            cfg.coordinator.clone(),
        );
        let groups = Groups::new(
            rows,
            &cfg.aws.prefix,
            cfg.http.hostname.clone(),
            Some(UserId::new(ADMIN)),
            cfg.coordinator.clone(),
        );
        let identity = MemoryProvider::new()
            .with_user(USER, USER_KEY, false)
            .with_user(ADMIN, ADMIN_KEY, true);
        let manager = Manager::new(
            cfg,
            Arc::clone(&groups),
            Arc::clone(&registry),
            blobs,
            Arc::new(identity),
            Arc::new(NoopBilling),
        );

        // The instance lives on its own runtime so a test can kill it like a real process.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("failed to build an instance runtime");
        let (ready_tx, ready_rx) = oneshot::channel();
        let boot_manager = Arc::clone(&manager);
        let addr = (hostname.clone(), self.port);
        runtime.spawn(async move {
            registry.beat().await;
            groups.refresh().await;
            let shutdown = Arc::new(tokio::sync::Notify::new());
            let _heartbeat = registry.spawn_heartbeat(Arc::clone(&shutdown));
            let _refresher = groups.spawn_refresh(Arc::clone(&shutdown));
            let _loops = boot_manager.start();
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .expect("failed to bind an instance listener");
            let _ = ready_tx.send(());
            let _ = axum::serve(listener, make_router(boot_manager)).await;
        });
        ready_rx.await.expect("instance failed to boot");

        self.instances.push(Instance {
            hostname,
            manager,
            runtime: Some(runtime),
        });
        self.instances.len() - 1
    }

    /// Kill an instance without any shutdown courtesy: leases stay claimed until the TTL lapses.
    pub fn crash(&mut self, index: usize) {
        self.instances[index].kill();
    }

    /// Polite shutdown: the instance releases every lease before dying.
    pub async fn stop(&mut self, index: usize) {
        let manager = Arc::clone(&self.instances[index].manager);
        manager.shutdown();
        manager.wait_finished().await;
        self.instances[index].kill();
    }

    pub fn url(&self, index: usize, path: &str) -> String {
        format!(
            "http://{}:{}{}",
            self.instances[index].hostname, self.port, path
        )
    }

    /// POST a form; returns `(status, body)`.
    pub async fn post_form(
        &self,
        index: usize,
        path: &str,
        fields: &[(&str, &str)],
    ) -> (u16, String) {
        let rsp = self
            .client
            .post(self.url(index, path))
            .form(fields)
            .send()
            .await
            .expect("request failed");
        let status = rsp.status().as_u16();
        let body = rsp.text().await.expect("unreadable response body");
        (status, body)
    }

    pub async fn post_json(
        &self,
        index: usize,
        path: &str,
        fields: &[(&str, &str)],
    ) -> (u16, serde_json::Value) {
        let (status, body) = self.post_form(index, path, fields).await;
        let value = serde_json::from_str(&body)
            .unwrap_or_else(|_| panic!("non-JSON response from {path}: {body}"));
        (status, value)
    }

    /// Create a group through the admin API; returns `(group_id, secret)`.
    pub async fn add_group(
        &self,
        index: usize,
        tag: &str,
        tier: &str,
        shards: u32,
        max_score: u8,
    ) -> (String, String) {
        let shards = shards.to_string();
        let max_score = max_score.to_string();
        let (status, body) = self
            .post_json(
                index,
                "/add_group",
                &[
                    ("u", USER),
                    ("uk", USER_KEY),
                    ("guid", tag),
                    ("gt", tier),
                    ("shards", &shards),
                    ("maxscore", &max_score),
                ],
            )
            .await;
        assert_eq!(status, 200, "add_group failed: {body}");
        (
            body["group_id"].as_str().expect("no group_id").to_owned(),
            body["key"].as_str().expect("no key").to_owned(),
        )
    }

    /// Poll `/info` through `index` until the owner map is non-empty (or the deadline passes);
    /// returns the owner hostnames.
    pub async fn wait_for_owners(
        &self,
        index: usize,
        group: &str,
        key: &str,
        want: usize,
        deadline: Duration,
    ) -> Vec<String> {
        let start = std::time::Instant::now();
        loop {
            let (status, body) = self
                .post_json(
                    index,
                    "/info",
                    &[("uid", USER), ("key", key), ("group", group)],
                )
                .await;
            if status == 200 {
                if let Some(map) = body.as_object() {
                    if map.len() >= want {
                        let mut owners: Vec<String> = map.keys().cloned().collect();
                        owners.sort();
                        return owners;
                    }
                }
            }
            assert!(
                start.elapsed() < deadline,
                "no owners for {group} within {deadline:?}; last response: {body}"
            );
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// The `/info` stats map for a group, via `index`.
    pub async fn info(&self, index: usize, group: &str, key: &str) -> HashMap<String, serde_json::Value> {
        let (status, body) = self
            .post_json(
                index,
                "/info",
                &[("uid", USER), ("key", key), ("group", group)],
            )
            .await;
        assert_eq!(status, 200, "info failed: {body}");
        serde_json::from_value(body).expect("malformed info map")
    }

    /// Which harness instance currently owns a shard of the group, if any.
    pub fn owner_index(&self, group: &str) -> Option<usize> {
        let gid = GroupId::new(group);
        self.instances
            .iter()
            .position(|instance| instance.runtime.is_some() && instance.manager.owns(&gid))
    }
}

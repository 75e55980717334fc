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

//! # manager
//!
//! The per-instance shard manager: competes for shards through the ownership coordinator, admits
//! them against local capacity, runs each owned shard's background workers, and exposes the
//! local-vs-remote routing state the HTTP layer consults.
//!
//! Every owned shard carries four workers: the lease renewal writer, the owner watcher (which
//! also pushes group-metadata mutations down into the live recommender), the one-second stats
//! rotator, and the LRU eviction sweep. Workers hold no locks across ticks and observe the
//! manager's ownership map — a tick that finds its shard gone simply exits.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info};

use crate::{
    config::Config,
    entities::{GroupId, UserId},
    groups::{Acquire, Group, Groups},
    identity,
    recommender::{snapshot_key, Recommender, Status},
    registry::Registry,
    storage::BlobBackend,
};

/// How long the per-second ring is; one entry per rotator tick.
const SECS_RING: usize = 60;
/// How long the per-minute ring is — a day.
const MINS_RING: usize = 1440;

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                       per-shard statistics                                     //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-instance stats blob `/info` aggregates across owners.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StatsBlob {
    pub rec_tree_status: String,
    pub stored_elements: u64,
    pub queries_by_sec: Vec<u64>,
    pub queries_by_min: Vec<u64>,
}

#[derive(Default)]
struct Rings {
    by_sec: VecDeque<u64>,
    by_min: VecDeque<u64>,
    ticks: u32,
}

/// Rate counters and their history rings for one owned shard.
///
/// The counters are plain atomics: the serving path increments without taking a lock, and the
/// unlocked rate-check read may overshoot by at most one second's worth of requests. The rotator
/// owns the rings.
#[derive(Default)]
pub struct ShardStats {
    queries: AtomicU64,
    inserts: AtomicU64,
    rings: Mutex<Rings>,
}

impl ShardStats {
    pub fn new() -> Arc<ShardStats> {
        Arc::new(ShardStats::default())
    }

    pub fn note_query(&self) -> u64 {
        self.queries.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn note_insert(&self) -> u64 {
        self.inserts.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn queries_now(&self) -> u64 {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn inserts_now(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    /// One rotator tick: bank the second's query count, reset both counters, and every sixty
    /// ticks roll the banked minute into the per-minute ring.
    pub fn rotate(&self) {
        let queries = self.queries.swap(0, Ordering::Relaxed);
        self.inserts.swap(0, Ordering::Relaxed);
        let mut rings = self.rings.lock().unwrap();
        rings.by_sec.push_back(queries);
        if rings.by_sec.len() > SECS_RING {
            rings.by_sec.pop_front();
        }
        rings.ticks += 1;
        if rings.ticks == SECS_RING as u32 {
            rings.ticks = 0;
            let minute: u64 = rings.by_sec.iter().sum();
            rings.by_min.push_back(minute);
            if rings.by_min.len() > MINS_RING {
                rings.by_min.pop_front();
            }
        }
    }

    fn blob(&self, status: Status, stored_elements: u64) -> StatsBlob {
        let rings = self.rings.lock().unwrap();
        StatsBlob {
            rec_tree_status: status.as_str().to_owned(),
            stored_elements,
            queries_by_sec: rings.by_sec.iter().copied().collect(),
            queries_by_min: rings.by_min.iter().copied().collect(),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                      billing attribution                                       //
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Billing aggregation itself is an external collaborator; the manager only hands it shard-count
/// snapshots keyed by `{tier}:{group}` whenever attribution-relevant state changes.
pub trait BillingHook: Send + Sync {
    fn record_attribution(&self, user_id: &UserId, owners_by_group: BTreeMap<String, usize>);
}

pub struct NoopBilling;

impl BillingHook for NoopBilling {
    fn record_attribution(&self, _user_id: &UserId, _owners_by_group: BTreeMap<String, usize>) {}
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                          the manager                                           //
////////////////////////////////////////////////////////////////////////////////////////////////////

struct OwnedShard {
    shard_index: u32,
    rec: Arc<Recommender>,
    stats: Arc<ShardStats>,
    // Held so a hard shutdown can abort stragglers; workers normally exit on their own when the
    // shard leaves the ownership map.
    tasks: Vec<JoinHandle<()>>,
}

pub struct Manager {
    cfg: Config,
    groups: Arc<Groups>,
    registry: Arc<Registry>,
    blobs: Arc<dyn BlobBackend + Send + Sync>,
    identity: Arc<dyn identity::Provider + Send + Sync>,
    billing: Arc<dyn BillingHook>,
    http: reqwest::Client,
    active: AtomicBool,
    finished: AtomicBool,
    finished_notify: Notify,
    owned: Mutex<HashMap<GroupId, OwnedShard>>,
}

impl Manager {
    pub fn new(
        cfg: Config,
        groups: Arc<Groups>,
        registry: Arc<Registry>,
        blobs: Arc<dyn BlobBackend + Send + Sync>,
        identity: Arc<dyn identity::Provider + Send + Sync>,
        billing: Arc<dyn BillingHook>,
    ) -> Arc<Manager> {
        Arc::new(Manager {
            cfg,
            groups,
            registry,
            blobs,
            identity,
            billing,
            http: reqwest::Client::new(),
            active: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            finished_notify: Notify::new(),
            owned: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn groups(&self) -> &Arc<Groups> {
        &self.groups
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn identity(&self) -> &Arc<dyn identity::Provider + Send + Sync> {
        &self.identity
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn owns(&self, group_id: &GroupId) -> bool {
        self.owned.lock().unwrap().contains_key(group_id)
    }

    pub fn owned_count(&self) -> usize {
        self.owned.lock().unwrap().len()
    }

    /// The local serving state for a group, if this instance owns one of its shards.
    pub fn local_shard(&self, group_id: &GroupId) -> Option<(Arc<Recommender>, Arc<ShardStats>)> {
        self.owned
            .lock()
            .unwrap()
            .get(group_id)
            .map(|shard| (Arc::clone(&shard.rec), Arc::clone(&shard.stats)))
    }

    /// The local stats blob for `/info`, if this instance owns a shard of the group.
    pub fn stats_blob(&self, group_id: &GroupId) -> Option<StatsBlob> {
        self.owned.lock().unwrap().get(group_id).map(|shard| {
            shard
                .stats
                .blob(shard.rec.status(), shard.rec.stored_cells())
        })
    }

    /// Spawn the acquisition and rebuild loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let acquirer = Arc::clone(self);
        let rebuilder = Arc::clone(self);
        vec![
            tokio::spawn(async move { acquirer.acquisition_loop().await }),
            tokio::spawn(async move { rebuilder.rebuild_loop().await }),
        ]
    }

    /// Ask the manager to wind down: the acquisition loop notices, releases every lease, stops
    /// every worker, and flags completion for [wait_finished](Manager::wait_finished).
    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub async fn wait_finished(&self) {
        loop {
            let notified = self.finished_notify.notified();
            if self.finished.load(Ordering::Relaxed) {
                return;
            }
            notified.await;
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                      acquisition loop                                      //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    async fn acquisition_loop(self: Arc<Self>) {
        while self.active.load(Ordering::Relaxed) {
            self.acquisition_tick().await;
            tokio::time::sleep(Duration::from_secs(self.cfg.coordinator.acquire_secs)).await;
        }

        let released = self.groups.release_all().await;
        info!(released, "released all acquired shards");
        let shards: Vec<(GroupId, OwnedShard)> = self.owned.lock().unwrap().drain().collect();
        for (group_id, shard) in shards {
            shard.rec.stop();
            for task in shard.tasks {
                task.abort();
            }
            debug!(%group_id, "stopped shard workers");
        }
        self.finished.store(true, Ordering::Relaxed);
        self.finished_notify.notify_waiters();
    }

    /// One pass over every group: admit what capacity allows, then refresh billing attribution
    /// for every tenant seen.
    pub async fn acquisition_tick(self: &Arc<Self>) {
        let mut users: BTreeMap<UserId, ()> = BTreeMap::new();
        for group in self.groups.all_groups() {
            if !self.active.load(Ordering::Relaxed) {
                break;
            }
            users.insert(group.meta.user_id.clone(), ());
            if !self.can_acquire(&group) {
                continue;
            }
            match self.groups.acquire(&group.meta.group_id).await {
                Ok(Acquire::Acquired(index)) => self.install_shard(&group, index).await,
                Ok(outcome) => debug!(group_id = %group.meta.group_id, ?outcome, "skipped"),
                Err(err) => {
                    // transient store trouble: log it and let the next tick retry
                    error!(group_id = %group.meta.group_id, %err, "acquisition attempt failed")
                }
            }
        }
        for user_id in users.keys() {
            self.attribute_billing(user_id);
        }
    }

    /// Admission: stay inside this instance's share of the global shard count, and inside its
    /// memory budget (in scored cells).
    fn can_acquire(&self, group: &Group) -> bool {
        let ceiling = self.registry.max_shards_for(self.groups.total_shards());
        let owned = self.owned.lock().unwrap();
        if owned.len() >= ceiling {
            return false;
        }
        let budget = self.cfg.mem.instance_mem_gb * self.cfg.mem.records_per_gb;
        let committed: u64 = owned.values().map(|s| s.rec.max_elements()).sum();
        committed + group.meta.max_elements <= budget
    }

    /// Bring an acquired shard into service: restore its snapshot, build the first tree, start
    /// its workers, and make it routable.
    async fn install_shard(self: &Arc<Self>, group: &Group, shard_index: u32) {
        let group_id = group.meta.group_id.clone();
        let identifier = format!("{}:{}", group_id, shard_index);
        let rec = Recommender::new(
            &self.cfg.backups.prefix,
            &identifier,
            group.meta.max_elements,
            group.meta.max_score,
            self.cfg.recommender.clone(),
            Arc::clone(&self.blobs),
        );
        match rec.load_snapshot().await {
            Ok(true) => debug!(%identifier, "snapshot restored"),
            Ok(false) => (),
            Err(err) => error!(%identifier, %err, "snapshot restore failed; starting empty"),
        }
        rec.rebuild();

        let stats = ShardStats::new();
        let tasks = vec![
            self.spawn_renewal(group_id.clone(), shard_index),
            self.spawn_watcher(group_id.clone(), shard_index),
            self.spawn_rotator(group_id.clone()),
            rec.spawn_eviction(Duration::from_millis(self.cfg.coordinator.eviction_ms)),
        ];
        self.owned.lock().unwrap().insert(
            group_id.clone(),
            OwnedShard {
                shard_index,
                rec,
                stats,
                tasks,
            },
        );
        info!(%group_id, shard_index, "finished acquisition of shard");
    }

    /// Drop a shard from service (ownership lost or group gone). The lease row is left alone —
    /// whoever took it over owns it now, and on plain loss the TTL has already done the work.
    fn teardown_shard(&self, group_id: &GroupId) {
        if let Some(shard) = self.owned.lock().unwrap().remove(group_id) {
            shard.rec.stop();
            info!(%group_id, shard_index = shard.shard_index, "shard released");
        }
    }

    fn attribute_billing(&self, user_id: &UserId) {
        let counts: BTreeMap<String, usize> = self
            .groups
            .groups_for_user(user_id)
            .iter()
            .map(|g| {
                (
                    format!("{}:{}", g.meta.kind, g.meta.group_id),
                    g.owners.len(),
                )
            })
            .collect();
        self.billing.record_attribution(user_id, counts);
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                     per-shard workers                                      //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn spawn_renewal(self: &Arc<Self>, group_id: GroupId, shard_index: u32) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(manager.cfg.coordinator.renewal_secs))
                    .await;
                if !manager.owns(&group_id) {
                    break;
                }
                if let Err(err) = manager.groups.renew(&group_id, shard_index).await {
                    error!(%group_id, shard_index, %err, "lease renewal failed; will retry");
                }
            }
        })
    }

    /// Loss detection plus metadata propagation: confirm the row still names us, and push the
    /// group's current `max_elements` / `max_score` into the live recommender.
    fn spawn_watcher(self: &Arc<Self>, group_id: GroupId, shard_index: u32) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let rec = match manager.local_shard(&group_id) {
                    Some((rec, _)) => rec,
                    None => break,
                };
                let group = manager.groups.get_by_id(&group_id);
                let still_owner = match &group {
                    Some(g) if g.meta.num_shards <= shard_index => false,
                    None => false,
                    Some(_) => match manager.groups.confirm_owner(&group_id, shard_index).await {
                        Ok(confirmed) => confirmed,
                        Err(err) => {
                            error!(%group_id, shard_index, %err, "owner check failed; keeping the shard");
                            true
                        }
                    },
                };
                if !still_owner {
                    let user_id = group.map(|g| g.meta.user_id);
                    manager.teardown_shard(&group_id);
                    if let Some(user_id) = user_id {
                        manager.attribute_billing(&user_id);
                    }
                    break;
                }
                if let Some(group) = manager.groups.get_by_id(&group_id) {
                    rec.set_max_elements(group.meta.max_elements);
                    rec.set_max_score(group.meta.max_score);
                }
            }
        })
    }

    fn spawn_rotator(self: &Arc<Self>, group_id: GroupId) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                let stats = match manager.local_shard(&group_id) {
                    Some((_, stats)) => stats,
                    None => break,
                };
                stats.rotate();
            }
        })
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                       rebuild loop                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    async fn rebuild_loop(self: Arc<Self>) {
        while self.active.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_secs(self.cfg.coordinator.rebuild_secs)).await;
            self.rebuild_tick().await;
        }
    }

    /// Rebuild-and-snapshot every dirty shard. A snapshot failure is logged and retried by the
    /// next pass; the shard keeps serving either way.
    pub async fn rebuild_tick(&self) {
        let recs: Vec<Arc<Recommender>> = self
            .owned
            .lock()
            .unwrap()
            .values()
            .map(|s| Arc::clone(&s.rec))
            .collect();
        for rec in recs {
            if rec.is_dirty() {
                rec.rebuild();
                if let Err(err) = rec.save_snapshot().await {
                    error!(identifier = rec.identifier(), %err, "snapshot save failed");
                }
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                       content wipe                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Wipe a group's content everywhere: destroy the persisted snapshots, then bounce
    /// `num_shards` through zero and hold it there past the lease TTL so every owner notices,
    /// drops its shard, and re-acquires into an empty state.
    pub async fn remove_content(&self, group: &Group) -> crate::groups::Result<()> {
        let group_id = &group.meta.group_id;
        let local = self.local_shard(group_id);
        for index in 0..group.meta.num_shards {
            let identifier = format!("{}:{}", group_id, index);
            // our own shard knows how to destroy its snapshot; the rest go by key
            type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;
            let result: Result<(), BoxedError> = match &local {
                Some((rec, _)) if rec.identifier() == identifier => {
                    rec.destroy_snapshot().await.map_err(Into::into)
                }
                _ => self
                    .blobs
                    .delete(&snapshot_key(&self.cfg.backups.prefix, &identifier))
                    .await
                    .map_err(Into::into),
            };
            if let Err(err) = result {
                error!(%group_id, index, %err, "failed to destroy a snapshot");
            }
        }
        let prev = group.meta.num_shards;
        self.groups.set_num_shards(group_id, 0).await?;
        tokio::time::sleep(Duration::from_secs(
            self.cfg.coordinator.lease_ttl_secs as u64 + 1,
        ))
        .await;
        self.groups.set_num_shards(group_id, prev).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        entities::Hostname,
        identity::MemoryProvider,
        storage::{MemoryBlobs, MemoryRows, RowBackend},
    };

    fn fast_config(hostname: &str) -> Config {
        let mut cfg = Config::default();
        cfg.http.hostname = Hostname::new(hostname);
        cfg.coordinator.stabilization_ms = 5;
        cfg.coordinator.lease_ttl_secs = 5;
        cfg.recommender.min_records_to_start = 4;
        cfg.tiers = Config::default_tiers();
        cfg
    }

    async fn manager_on(rows: &Arc<MemoryRows>, hostname: &str) -> Arc<Manager> {
        let cfg = fast_config(hostname);
        let backend = rows.clone() as Arc<dyn RowBackend + Send + Sync>;
        let registry = Registry::new(
            backend.clone(),
            &cfg.aws.prefix,
            cfg.http.hostname.clone(),
            cfg.coordinator.clone(),
        );
        registry.beat().await;
        let groups = Groups::new(
            backend,
            &cfg.aws.prefix,
            cfg.http.hostname.clone(),
            None,
            cfg.coordinator.clone(),
        );
        Manager::new(
            cfg,
            groups,
            registry,
            Arc::new(MemoryBlobs::new()),
            Arc::new(MemoryProvider::new()),
            Arc::new(NoopBilling),
        )
    }

    #[test]
    fn stats_rings_rotate() {
        let stats = ShardStats::new();
        for _ in 0..7 {
            stats.note_query();
        }
        stats.note_insert();
        assert_eq!(stats.queries_now(), 7);
        stats.rotate();
        // counters reset, the second banked
        assert_eq!(stats.queries_now(), 0);
        assert_eq!(stats.inserts_now(), 0);
        for _ in 0..59 {
            stats.rotate();
        }
        let blob = stats.blob(Status::Active, 42);
        assert_eq!(blob.queries_by_sec.len(), SECS_RING);
        assert_eq!(blob.queries_by_min, vec![7]);
        assert_eq!(blob.stored_elements, 42);
        assert_eq!(blob.rec_tree_status, "ACTIVE");
    }

    #[test]
    fn sec_ring_is_bounded() {
        let stats = ShardStats::new();
        for _ in 0..200 {
            stats.rotate();
        }
        let blob = stats.blob(Status::Starting, 0);
        assert_eq!(blob.queries_by_sec.len(), SECS_RING);
        assert_eq!(blob.queries_by_min.len(), 3);
    }

    #[tokio::test]
    async fn tick_acquires_installs_and_serves() {
        let rows = Arc::new(MemoryRows::new());
        let manager = manager_on(&rows, "host-a").await;
        manager
            .groups()
            .add_update_group(
                "s",
                UserId::new("u1"),
                GroupId::new("g1"),
                1,
                1000,
                10,
                40,
                5,
            )
            .await
            .unwrap();

        manager.acquisition_tick().await;
        assert!(manager.owns(&GroupId::new("g1")));
        let (rec, stats) = manager.local_shard(&GroupId::new("g1")).unwrap();
        assert_eq!(rec.status(), Status::NoRecords);
        assert_eq!(stats.queries_now(), 0);
        assert!(manager.stats_blob(&GroupId::new("g1")).is_some());

        // a second tick is idempotent: the group is already owned here
        manager.acquisition_tick().await;
        assert_eq!(manager.owned_count(), 1);
    }

    #[tokio::test]
    async fn admission_respects_the_memory_budget() {
        let rows = Arc::new(MemoryRows::new());
        let manager = manager_on(&rows, "host-a").await;
        let budget =
            manager.cfg.mem.instance_mem_gb * manager.cfg.mem.records_per_gb;
        manager
            .groups()
            .add_update_group(
                "l",
                UserId::new("u1"),
                GroupId::new("huge"),
                1,
                budget + 1,
                10,
                40,
                5,
            )
            .await
            .unwrap();
        manager.acquisition_tick().await;
        assert!(!manager.owns(&GroupId::new("huge")));
    }

    #[tokio::test]
    async fn admission_respects_the_shard_ceiling() {
        let rows = Arc::new(MemoryRows::new());
        let a = manager_on(&rows, "host-a").await;
        let b = manager_on(&rows, "host-b").await;
        // both registries must see both instances
        a.registry().beat().await;
        b.registry().beat().await;
        a.registry().beat().await;

        for i in 0..2 {
            a.groups()
                .add_update_group(
                    "s",
                    UserId::new("u1"),
                    GroupId::new(format!("g{}", i).as_str()),
                    1,
                    1000,
                    10,
                    40,
                    5,
                )
                .await
                .unwrap();
        }
        b.groups().refresh().await;

        // two shards over two instances: one each; host-a must not take both
        a.acquisition_tick().await;
        assert_eq!(a.owned_count(), 1);
        a.acquisition_tick().await;
        assert_eq!(a.owned_count(), 1);
        b.acquisition_tick().await;
        assert_eq!(b.owned_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_everything() {
        let rows = Arc::new(MemoryRows::new());
        let manager = manager_on(&rows, "host-a").await;
        manager
            .groups()
            .add_update_group(
                "s",
                UserId::new("u1"),
                GroupId::new("g1"),
                1,
                1000,
                10,
                40,
                5,
            )
            .await
            .unwrap();
        let tasks = manager.start();
        manager.shutdown();
        manager.wait_finished().await;
        assert_eq!(manager.owned_count(), 0);
        for task in tasks {
            task.abort();
        }
    }
}

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

//! # groups
//!
//! The group/shard model over the coordination store, and the shard-ownership coordinator.
//!
//! Ownership is lease-based: a shard row naming an owner is only good for `lease_ttl` seconds
//! past its `last_ts`, and owners rewrite their rows well inside that window. The store is only
//! eventually consistent, so acquisition cannot trust a scan: it re-reads the row strongly, writes
//! its claim, waits a stabilisation interval, and re-reads strongly again — the claim stands only
//! if the second read still names this instance. That two-read-with-gap sequence is the single
//! correctness-critical use of the store's strong-read operation; everything else tolerates
//! staleness.
//!
//! Two instances can still briefly believe they own the same shard (one renewal interval, at
//! worst). That is by design: both serve reads correctly, both persist snapshots, last writer
//! wins, and the watcher ends the overlap within a lease TTL.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
    time::Duration,
};

use snafu::{Backtrace, ResultExt, Snafu};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::{
    config::CoordinatorConfig,
    entities::{shard_row_key, GroupId, GroupMeta, Hostname, ShardRow, UserId},
    storage::{self, RowBackend, RowData},
};

pub const GROUPS_TABLE: &str = "rec_groups";
pub const SHARDS_TABLE: &str = "rec_shards";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Coordination-store failure: {source}"))]
    Store { source: storage::Error },
    #[snafu(display("Bad row payload: {source}"))]
    Ser {
        source: serde_json::Error,
        backtrace: Backtrace,
    },
    /// Deliberately opaque: unknown user, unknown group and bad secret all collapse here so the
    /// response leaks nothing.
    #[snafu(display("Authentication problem"))]
    Unauthorized { backtrace: Backtrace },
    #[snafu(display("Group {group_id} not found"))]
    GroupNotFound {
        group_id: GroupId,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// An immutable snapshot of one group: its metadata, its shard rows (indexes below `num_shards`
/// only), and the owner map derived from lease-valid rows.
#[derive(Clone, Debug)]
pub struct Group {
    pub meta: GroupMeta,
    pub shards: BTreeMap<u32, ShardRow>,
    pub owners: BTreeMap<Hostname, u32>,
}

impl Group {
    pub fn owned_by(&self, host: &Hostname) -> Option<u32> {
        self.owners.get(host).copied()
    }
}

/// The outcome of one acquisition attempt. Everything but `Acquired` is a skip from the caller's
/// point of view; the distinctions matter only for logging.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acquire {
    Acquired(u32),
    /// This instance already holds a shard of the group (at most one per group per instance).
    AlreadyOwner,
    /// Every shard is owned.
    Saturated,
    /// Nothing apparently free survived its strongly-consistent re-read.
    NoneFree,
    /// Another instance won the stabilisation gap.
    Race,
}

pub struct Groups {
    rows: Arc<dyn RowBackend + Send + Sync>,
    groups_table: String,
    shards_table: String,
    hostname: Hostname,
    admin_user: Option<UserId>,
    cfg: CoordinatorConfig,
    cache: Mutex<HashMap<GroupId, Group>>,
}

impl Groups {
    pub fn new(
        rows: Arc<dyn RowBackend + Send + Sync>,
        prefix: &str,
        hostname: Hostname,
        admin_user: Option<UserId>,
        cfg: CoordinatorConfig,
    ) -> Arc<Groups> {
        Arc::new(Groups {
            rows,
            groups_table: format!("{}_{}", prefix, GROUPS_TABLE),
            shards_table: format!("{}_{}", prefix, SHARDS_TABLE),
            hostname,
            admin_user,
            cfg,
            cache: Mutex::new(HashMap::new()),
        })
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        cache reads                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    pub fn get_by_id(&self, group_id: &GroupId) -> Option<Group> {
        self.cache.lock().unwrap().get(group_id).cloned()
    }

    pub fn all_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self.cache.lock().unwrap().values().cloned().collect();
        groups.sort_by(|a, b| a.meta.group_id.cmp(&b.meta.group_id));
        groups
    }

    /// A user's groups; the admin identity sees everyone's.
    pub fn groups_for_user(&self, user_id: &UserId) -> Vec<Group> {
        let admin = self.admin_user.as_ref() == Some(user_id);
        self.all_groups()
            .into_iter()
            .filter(|g| admin || &g.meta.user_id == user_id)
            .collect()
    }

    /// Global sum of `num_shards` over all groups.
    pub fn total_shards(&self) -> usize {
        self.cache
            .lock()
            .unwrap()
            .values()
            .map(|g| g.meta.num_shards as usize)
            .sum()
    }

    /// Authenticate the `(user, secret, group)` triple. The admin user may reach any group with
    /// that group's secret. Every failure is the same opaque error.
    pub fn authenticate(&self, user_id: &str, secret: &str, group_id: &str) -> Result<Group> {
        let group = self
            .get_by_id(&GroupId::new(group_id))
            .ok_or_else(|| UnauthorizedSnafu.build())?;
        let admin = self.admin_user.as_ref().map(UserId::as_str) == Some(user_id);
        if (admin || group.meta.user_id.as_str() == user_id) && group.meta.secret == secret {
            debug!(%group_id, "group credentials accepted");
            Ok(group)
        } else {
            UnauthorizedSnafu.fail()
        }
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                      group lifecycle                                       //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Create a group, or update an existing one's metadata. Growing `num_shards` writes the new
    /// shard rows; the secret is minted only at creation.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_update_group(
        &self,
        kind: &str,
        user_id: UserId,
        group_id: GroupId,
        num_shards: u32,
        max_elements: u64,
        max_req_sec: u64,
        max_insert_req_sec: u64,
        max_score: u8,
    ) -> Result<(Group, String)> {
        let existing = self.get_by_id(&group_id);
        let group = match existing {
            Some(mut group) => {
                group.meta.kind = kind.to_owned();
                group.meta.max_score = max_score;
                group.meta.max_elements = max_elements;
                group.meta.max_req_sec = max_req_sec;
                group.meta.max_insert_req_sec = max_insert_req_sec;
                for index in group.meta.num_shards..num_shards {
                    let row = self.blank_shard(&group_id, index);
                    self.put_shard(&row).await?;
                    group.shards.insert(index, row);
                }
                group.meta.num_shards = num_shards;
                group
            }
            None => {
                let meta = GroupMeta {
                    group_id: group_id.clone(),
                    user_id,
                    secret: Uuid::new_v4().to_string(),
                    kind: kind.to_owned(),
                    num_shards,
                    max_score,
                    max_elements,
                    max_req_sec,
                    max_insert_req_sec,
                };
                let mut shards = BTreeMap::new();
                for index in 0..num_shards {
                    let row = self.blank_shard(&group_id, index);
                    self.put_shard(&row).await?;
                    shards.insert(index, row);
                }
                Group {
                    meta,
                    shards,
                    owners: BTreeMap::new(),
                }
            }
        };

        self.put_group(&group.meta).await?;
        let secret = group.meta.secret.clone();
        self.cache
            .lock()
            .unwrap()
            .insert(group_id, group.clone());
        Ok((group, secret))
    }

    /// Set the shard count. Growth writes new rows; a lower count merely changes what readers
    /// consider in-bounds (rows above it are ignored, then deleted with the group). The content
    /// wipe leans on this: drop to zero, wait out the leases, restore.
    pub async fn set_num_shards(&self, group_id: &GroupId, num_shards: u32) -> Result<()> {
        let mut group = self
            .get_by_id(group_id)
            .ok_or_else(|| GroupNotFoundSnafu { group_id: group_id.clone() }.build())?;
        for index in group.meta.num_shards..num_shards {
            let row = self.blank_shard(group_id, index);
            self.put_shard(&row).await?;
            group.shards.insert(index, row);
        }
        group.meta.num_shards = num_shards;
        group.shards.retain(|&i, _| i < num_shards);
        group.owners.retain(|_, &mut i| i < num_shards);
        self.put_group(&group.meta).await?;
        self.cache.lock().unwrap().insert(group_id.clone(), group);
        Ok(())
    }

    /// Mint a new secret. Outstanding client requests carrying the old one start failing with
    /// the next refresh everywhere; shard ownership is untouched.
    pub async fn regenerate_key(&self, group_id: &GroupId) -> Result<String> {
        let mut group = self
            .get_by_id(group_id)
            .ok_or_else(|| GroupNotFoundSnafu { group_id: group_id.clone() }.build())?;
        group.meta.secret = Uuid::new_v4().to_string();
        self.put_group(&group.meta).await?;
        let secret = group.meta.secret.clone();
        self.cache.lock().unwrap().insert(group_id.clone(), group);
        Ok(secret)
    }

    /// Delete the group row and every shard row — the group owns its shards.
    pub async fn remove_group(&self, group_id: &GroupId) -> Result<()> {
        let group = self
            .get_by_id(group_id)
            .ok_or_else(|| GroupNotFoundSnafu { group_id: group_id.clone() }.build())?;
        for index in 0..group.meta.num_shards {
            self.rows
                .delete(&self.shards_table, &shard_row_key(group_id, index))
                .await
                .context(StoreSnafu)?;
        }
        self.rows
            .delete(&self.groups_table, group_id.as_str())
            .await
            .context(StoreSnafu)?;
        self.cache.lock().unwrap().remove(group_id);
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                     ownership protocol                                     //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// One acquisition attempt against `group_id`; see the module docs for the protocol.
    pub async fn acquire(&self, group_id: &GroupId) -> Result<Acquire> {
        let group = match self.get_by_id(group_id) {
            Some(group) => group,
            None => return Ok(Acquire::NoneFree),
        };
        if group.owners.len() >= group.shards.len() {
            return Ok(Acquire::Saturated);
        }
        if group.owned_by(&self.hostname).is_some() {
            return Ok(Acquire::AlreadyOwner);
        }

        let now = chrono::Utc::now().timestamp();
        // The cached rows are advisory; only a strong re-read can nominate a candidate.
        let mut candidate: Option<ShardRow> = None;
        for row in group.shards.values() {
            if !row.addr.is_empty() && now - row.last_ts <= self.cfg.lease_ttl_secs {
                continue;
            }
            match self.read_shard(group_id, row.shard_index).await? {
                Some(fresh) if fresh.is_leased(now, self.cfg.lease_ttl_secs) => continue,
                Some(fresh) => {
                    candidate = Some(fresh);
                    break;
                }
                None => {
                    candidate = Some(self.blank_shard(group_id, row.shard_index));
                    break;
                }
            }
        }
        let mut shard = match candidate {
            Some(shard) => shard,
            None => return Ok(Acquire::NoneFree),
        };

        shard.addr = self.hostname.clone();
        shard.last_ts = chrono::Utc::now().timestamp();
        self.put_shard(&shard).await?;

        // The gap gives a concurrent claimant's write time to become visible to the re-read.
        tokio::time::sleep(self.cfg.stabilization()).await;

        let confirmed = self.read_shard(group_id, shard.shard_index).await?;
        match confirmed {
            Some(row) if row.addr == self.hostname => {
                let index = row.shard_index;
                let mut cache = self.cache.lock().unwrap();
                if let Some(cached) = cache.get_mut(group_id) {
                    cached.owners.insert(self.hostname.clone(), index);
                    cached.shards.insert(index, row);
                }
                info!(%group_id, index, "shard acquired");
                Ok(Acquire::Acquired(index))
            }
            _ => {
                debug!(%group_id, index = shard.shard_index, "lost the acquisition race");
                Ok(Acquire::Race)
            }
        }
    }

    /// Refresh the lease on an owned shard.
    pub async fn renew(&self, group_id: &GroupId, shard_index: u32) -> Result<()> {
        let row = ShardRow {
            group_id: group_id.clone(),
            shard_index,
            addr: self.hostname.clone(),
            last_ts: chrono::Utc::now().timestamp(),
            expire: false,
        };
        self.put_shard(&row).await?;
        let mut cache = self.cache.lock().unwrap();
        if let Some(group) = cache.get_mut(group_id) {
            group.shards.insert(shard_index, row);
            group.owners.insert(self.hostname.clone(), shard_index);
        }
        Ok(())
    }

    /// Does the store still name this instance as the owner? A strongly-consistent read — the
    /// loss watcher must not be fooled by its own stale cache.
    pub async fn confirm_owner(&self, group_id: &GroupId, shard_index: u32) -> Result<bool> {
        Ok(self
            .read_shard(group_id, shard_index)
            .await?
            .map(|row| row.addr == self.hostname)
            .unwrap_or(false))
    }

    /// Hand a shard back (clean shutdown). Crash release is by TTL alone.
    pub async fn release(&self, group_id: &GroupId, shard_index: u32) -> Result<()> {
        let row = ShardRow {
            group_id: group_id.clone(),
            shard_index,
            addr: Hostname::empty(),
            last_ts: chrono::Utc::now().timestamp(),
            expire: false,
        };
        self.put_shard(&row).await?;
        let mut cache = self.cache.lock().unwrap();
        if let Some(group) = cache.get_mut(group_id) {
            group.owners.remove(&self.hostname);
            group.shards.insert(shard_index, row);
        }
        Ok(())
    }

    /// Release every shard this instance owns; returns how many.
    pub async fn release_all(&self) -> usize {
        let owned: Vec<(GroupId, u32)> = self
            .all_groups()
            .iter()
            .filter_map(|g| {
                g.owned_by(&self.hostname)
                    .map(|i| (g.meta.group_id.clone(), i))
            })
            .collect();
        let mut released = 0;
        for (group_id, index) in owned {
            match self.release(&group_id, index).await {
                Ok(()) => released += 1,
                Err(err) => error!(%group_id, index, %err, "failed to release a shard"),
            }
        }
        released
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                       refresh loop                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    /// Rebuild the cache from full scans. Transient store errors leave the previous cache in
    /// place; the next tick retries.
    pub async fn refresh(&self) {
        let shard_rows = match self.rows.scan(&self.shards_table).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%err, "failed to scan the shards table; keeping the previous view");
                return;
            }
        };
        let group_rows = match self.rows.scan(&self.groups_table).await {
            Ok(rows) => rows,
            Err(err) => {
                error!(%err, "failed to scan the groups table; keeping the previous view");
                return;
            }
        };

        let now = chrono::Utc::now().timestamp();
        let mut shards_by_group: HashMap<GroupId, BTreeMap<u32, ShardRow>> = HashMap::new();
        for row in shard_rows {
            match serde_json::from_str::<ShardRow>(&row.info) {
                Ok(shard) if !shard.expire => {
                    shards_by_group
                        .entry(shard.group_id.clone())
                        .or_default()
                        .insert(shard.shard_index, shard);
                }
                Ok(_) => (),
                Err(err) => error!(key = %row.key, %err, "unparseable shard row; skipping"),
            }
        }

        let mut cache: HashMap<GroupId, Group> = HashMap::new();
        for row in group_rows {
            let meta = match serde_json::from_str::<GroupMeta>(&row.info) {
                Ok(meta) => meta,
                Err(err) => {
                    error!(key = %row.key, %err, "unparseable group row; skipping");
                    continue;
                }
            };
            let mut shards = shards_by_group
                .remove(&meta.group_id)
                .unwrap_or_default();
            shards.retain(|&i, _| i < meta.num_shards);
            let mut owners = BTreeMap::new();
            for shard in shards.values_mut() {
                if shard.is_leased(now, self.cfg.lease_ttl_secs) {
                    owners.insert(shard.addr.clone(), shard.shard_index);
                } else {
                    // lapsed lease: surface the shard as free (nothing is written back)
                    shard.addr = Hostname::empty();
                }
            }
            cache.insert(
                meta.group_id.clone(),
                Group {
                    meta,
                    shards,
                    owners,
                },
            );
        }

        *self.cache.lock().unwrap() = cache;
    }

    pub fn spawn_refresh(self: &Arc<Self>, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let groups = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                groups.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(groups.cfg.group_refresh_secs)) => (),
                    _ = shutdown.notified() => break,
                }
            }
        })
    }

    ////////////////////////////////////////////////////////////////////////////////////////////////
    //                                        persistence                                         //
    ////////////////////////////////////////////////////////////////////////////////////////////////

    fn blank_shard(&self, group_id: &GroupId, shard_index: u32) -> ShardRow {
        ShardRow {
            group_id: group_id.clone(),
            shard_index,
            addr: Hostname::empty(),
            last_ts: 0,
            expire: false,
        }
    }

    async fn read_shard(&self, group_id: &GroupId, shard_index: u32) -> Result<Option<ShardRow>> {
        let key = shard_row_key(group_id, shard_index);
        let row = self
            .rows
            .get_consistent(&self.shards_table, &key)
            .await
            .context(StoreSnafu)?;
        match row {
            Some(row) => {
                let shard = serde_json::from_str(&row.info).context(SerSnafu)?;
                Ok(Some(shard))
            }
            None => Ok(None),
        }
    }

    async fn put_shard(&self, shard: &ShardRow) -> Result<()> {
        let info = serde_json::to_string(shard).context(SerSnafu)?;
        let mut row = RowData::new(shard.row_key(), info)
            .with_attr("addr", shard.addr.as_str())
            .with_attr("last_ts", shard.last_ts.to_string());
        if shard.expire {
            row = row.with_attr("expire", "1");
        }
        self.rows
            .put(&self.shards_table, &row)
            .await
            .context(StoreSnafu)
    }

    async fn put_group(&self, meta: &GroupMeta) -> Result<()> {
        let info = serde_json::to_string(meta).context(SerSnafu)?;
        let row = RowData::new(meta.group_id.as_str(), info);
        self.rows
            .put(&self.groups_table, &row)
            .await
            .context(StoreSnafu)
    }
}

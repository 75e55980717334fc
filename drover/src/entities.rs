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

//! # drover entities
//!
//! Foundational vocabulary types. These are truly load-bearing: every subsystem trades in them,
//! and the serde derives define the JSON payloads round-tripped through the coordination store's
//! `info` column.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Item & record identifiers are opaque 64-bit values assigned by the tenant.
pub type ItemId = u64;
pub type RecordId = u64;

/// A score is an integer in `[0, max_score]` where `max_score` is a per-group setting.
pub type Score = u8;

/// One observation: the items a record (user, session, ...) has scored.
pub type ScoreMap = HashMap<ItemId, Score>;

/// Declare a newtype wrapping [String] to be used as an opaque identifier.
///
/// In a NoSQL world there's no auto-increment column to lean on; identifiers are
/// application-assigned strings. I can't bring myself to pass the same bare [String] around for
/// users, groups and hostnames, so: newtypes. Serde-transparent so the wire format stays a plain
/// JSON string.
macro_rules! define_name {
    ($type_name:ident) => {
        #[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
        #[serde(transparent)]
        pub struct $type_name(String);

        impl $type_name {
            pub fn new<S: Into<String>>(s: S) -> $type_name {
                $type_name(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $type_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $type_name {
            fn from(s: &str) -> $type_name {
                $type_name(s.to_owned())
            }
        }
    };
}

define_name!(GroupId);
define_name!(UserId);
define_name!(Hostname);

impl Hostname {
    /// True when this row's `addr` column would be considered empty, i.e. the shard is free.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn empty() -> Hostname {
        Hostname(String::new())
    }
}

/// Tenant-declared group metadata, serialised whole into the `info` column of the groups table.
///
/// Two invariants the rest of the system leans on:
///
/// 1. `num_shards` never silently decreases; shrinking a group is expressed by deleting it and
///    re-creating it (shard rows with an index at or above `num_shards` are ignored by readers).
/// 2. Rotating `secret` invalidates every client request still carrying the old secret, but does
///    not touch shard rows — owners keep serving through a rotation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GroupMeta {
    pub group_id: GroupId,
    pub user_id: UserId,
    /// Bearer token clients present with every data-path request. Rotatable.
    pub secret: String,
    /// Tier tag; drives the capacity defaults applied at group creation and is the unit billing
    /// attribution is keyed by.
    pub kind: String,
    #[serde(rename = "tot_shards")]
    pub num_shards: u32,
    /// Scores are integers in `[0, max_score]`; 1..=255.
    pub max_score: u8,
    /// LRU capacity per shard, in scored cells (not records).
    #[serde(rename = "max_elems")]
    pub max_elements: u64,
    /// Per-shard query budget, requests per second.
    pub max_req_sec: u64,
    /// Per-shard ingestion budget, requests per second.
    pub max_insert_req_sec: u64,
}

/// One shard-ownership row, serialised whole into the `info` column of the shards table. The
/// `addr` and `last_ts` fields are mirrored into scalar control columns so they can be read
/// without parsing the payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ShardRow {
    pub group_id: GroupId,
    #[serde(rename = "shard_id")]
    pub shard_index: u32,
    /// Hostname of the current owner; empty when the shard is free.
    pub addr: Hostname,
    /// Epoch second of the last renewal write.
    pub last_ts: i64,
    /// Tombstone; rows flagged expired are skipped by readers pending deletion.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expire: bool,
}

impl ShardRow {
    /// The primary key of this row: `{group_id}:{shard_index}`.
    pub fn row_key(&self) -> String {
        shard_row_key(&self.group_id, self.shard_index)
    }

    /// A shard is owned iff `addr` is non-empty and the lease has not lapsed.
    pub fn is_leased(&self, now: i64, lease_ttl: i64) -> bool {
        !self.addr.is_empty() && now - self.last_ts <= lease_ttl
    }
}

pub fn shard_row_key(group_id: &GroupId, shard_index: u32) -> String {
    format!("{}:{}", group_id, shard_index)
}

/// Liveness row for one instance, keyed by hostname.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InstanceRow {
    pub hostname: Hostname,
    pub ts: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shard_row_lease() {
        let mut row = ShardRow {
            group_id: GroupId::new("g1"),
            shard_index: 0,
            addr: Hostname::empty(),
            last_ts: 0,
            expire: false,
        };
        assert!(!row.is_leased(100, 10));
        row.addr = Hostname::new("host-a");
        row.last_ts = 95;
        assert!(row.is_leased(100, 10));
        assert!(!row.is_leased(106, 10));
        assert_eq!(row.row_key(), "g1:0");
    }

    #[test]
    fn group_meta_round_trips() {
        let meta = GroupMeta {
            group_id: GroupId::new("movies:abc"),
            user_id: UserId::new("u1"),
            secret: "s3cr3t".to_owned(),
            kind: "s".to_owned(),
            num_shards: 2,
            max_score: 5,
            max_elements: 1000,
            max_req_sec: 10,
            max_insert_req_sec: 40,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"tot_shards\":2"));
        let back: GroupMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.group_id, meta.group_id);
        assert_eq!(back.max_elements, 1000);
    }
}

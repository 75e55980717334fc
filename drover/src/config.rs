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

//! # configuration
//!
//! drover reads its configuration once, at startup, into an immutable [Config] value which is then
//! passed (by clone) into each subsystem — there are no process-wide configuration singletons.
//! Every interval is expressed in integral seconds except the two that genuinely need
//! sub-second resolution (the acquisition stabilisation gap and the eviction tick).

use std::{collections::BTreeMap, path::Path, time::Duration};

use serde::Deserialize;
use snafu::{Backtrace, ResultExt, Snafu};

use crate::entities::Hostname;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Unable to read configuration file {pth}: {source}"))]
    Read {
        pth: String,
        source: std::io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Error parsing configuration file {pth}: {source}"))]
    Parse {
        pth: String,
        source: toml::de::Error,
        backtrace: Backtrace,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Fleet-uniform listen port; forwarded requests target `http://{owner}:{port}`.
    pub port: u16,
    /// The hostname this instance advertises in liveness and shard rows. Must be unique across
    /// the fleet and resolvable by its peers.
    pub hostname: Hostname,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            port: 9917,
            hostname: Hostname::new("localhost"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Environment tag prefixed onto every table name (`{prefix}_rec_groups`, ...).
    pub prefix: String,
    pub region: String,
    /// Point at a non-AWS endpoint (a local DynamoDB, say) instead of a region.
    pub endpoint: Option<String>,
    /// Key id & secret; read from the ambient environment when absent.
    pub credentials: Option<(String, String)>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        AwsConfig {
            prefix: "dev".to_owned(),
            region: "us-west-2".to_owned(),
            endpoint: None,
            credentials: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackupsConfig {
    pub bucket: String,
    /// Snapshot blobs land at `{prefix}/{group}:{shard}.json.gz`.
    pub prefix: String,
}

impl Default for BackupsConfig {
    fn default() -> Self {
        BackupsConfig {
            bucket: "drover-backups".to_owned(),
            prefix: "prod".to_owned(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MemConfig {
    #[serde(rename = "instance-mem-gb")]
    pub instance_mem_gb: u64,
    /// How many scored cells we budget per GB; with `instance_mem_gb` this caps total in-memory
    /// capacity across all shards admitted by one instance.
    #[serde(rename = "records-per-gb")]
    pub records_per_gb: u64,
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            instance_mem_gb: 4,
            records_per_gb: 1_500_000,
        }
    }
}

/// Timing knobs for the coordination protocol. The defaults reproduce the production cadence;
/// the integration harness dials everything down to run a fleet's worth of failover inside a
/// test timeout.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// A shard row older than this is free for the taking.
    #[serde(rename = "lease-ttl-secs")]
    pub lease_ttl_secs: i64,
    /// Owners rewrite their shard rows this often. Must be < lease_ttl / 3.
    #[serde(rename = "renewal-secs")]
    pub renewal_secs: u64,
    /// The groups cache rebuilds from full scans this often.
    #[serde(rename = "group-refresh-secs")]
    pub group_refresh_secs: u64,
    /// The gap between the acquisition write and the confirmation read; a small multiple of the
    /// store's replication RTT.
    #[serde(rename = "stabilization-ms")]
    pub stabilization_ms: u64,
    /// An instance row older than this is dead.
    #[serde(rename = "instance-ttl-secs")]
    pub instance_ttl_secs: i64,
    #[serde(rename = "heartbeat-secs")]
    pub heartbeat_secs: u64,
    /// Cadence of the dirty-check / tree-rebuild / snapshot pass.
    #[serde(rename = "rebuild-secs")]
    pub rebuild_secs: u64,
    /// Cadence of the LRU eviction sweep.
    #[serde(rename = "eviction-ms")]
    pub eviction_ms: u64,
    /// Cadence of the acquisition loop.
    #[serde(rename = "acquire-secs")]
    pub acquire_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            lease_ttl_secs: 10,
            renewal_secs: 2,
            group_refresh_secs: 5,
            stabilization_ms: 200,
            instance_ttl_secs: 30,
            heartbeat_secs: 1,
            rebuild_secs: 30,
            eviction_ms: 300,
            acquire_secs: 1,
        }
    }
}

impl CoordinatorConfig {
    pub fn stabilization(&self) -> Duration {
        Duration::from_millis(self.stabilization_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    /// Below this record count a rebuild parks the shard in `NO_RECORDS`.
    #[serde(rename = "min-records-to-start")]
    pub min_records_to_start: usize,
    /// Deeper trees predict better but bias harder and cost more to rebuild.
    #[serde(rename = "max-depth")]
    pub max_depth: u32,
    /// Ensemble size; roots are the most frequently scored items.
    #[serde(rename = "num-of-trees")]
    pub num_of_trees: usize,
    /// Leaf list length per branch.
    #[serde(rename = "max-secondary")]
    pub max_secondary: usize,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        RecommenderConfig {
            min_records_to_start: 100,
            max_depth: 30,
            num_of_trees: 10,
            max_secondary: 20,
        }
    }
}

/// Capacity defaults a tier tag expands to at group creation: `max_req_sec = reqs`,
/// `max_insert_req_sec = reqs * 4`, `max_elements = records`.
#[derive(Clone, Debug, Deserialize)]
pub struct Tier {
    pub reqs: u64,
    pub records: u64,
}

/// A user the out-of-scope identity collaborator vouches for; the daemon seeds its in-memory
/// [Provider](crate::identity::Provider) from these.
#[derive(Clone, Debug, Deserialize)]
pub struct IdentityUser {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub http: HttpConfig,
    pub aws: AwsConfig,
    pub backups: BackupsConfig,
    pub mem: MemConfig,
    pub coordinator: CoordinatorConfig,
    pub recommender: RecommenderConfig,
    /// Tier tag -> capacity defaults.
    pub tiers: BTreeMap<String, Tier>,
    /// The admin identity may operate on any group given that group's secret.
    #[serde(rename = "admin-user")]
    pub admin_user: Option<String>,
    pub identity: Vec<IdentityUser>,
}

impl Config {
    pub fn from_path<P: AsRef<Path>>(pth: P) -> Result<Config> {
        let pth = pth.as_ref();
        let text = std::fs::read_to_string(pth).context(ReadSnafu {
            pth: pth.display().to_string(),
        })?;
        let mut cfg: Config = toml::from_str(&text).context(ParseSnafu {
            pth: pth.display().to_string(),
        })?;
        if cfg.tiers.is_empty() {
            cfg.tiers = Config::default_tiers();
        }
        Ok(cfg)
    }

    pub fn default_tiers() -> BTreeMap<String, Tier> {
        BTreeMap::from([
            (
                "s".to_owned(),
                Tier {
                    reqs: 50,
                    records: 250_000,
                },
            ),
            (
                "m".to_owned(),
                Tier {
                    reqs: 200,
                    records: 1_000_000,
                },
            ),
            (
                "l".to_owned(),
                Tier {
                    reqs: 800,
                    records: 4_000_000,
                },
            ),
        ])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        // the renewal cadence has to beat the lease TTL with room to spare
        assert!(cfg.coordinator.renewal_secs < (cfg.coordinator.lease_ttl_secs as u64) / 3);
        assert_eq!(cfg.http.port, 9917);
    }

    #[test]
    fn parses_a_partial_file() {
        let cfg: Config = toml::from_str(
            r#"
            admin-user = "ops@example.com"

            [http]
            port = 8080
            hostname = "node-1"

            [coordinator]
            lease-ttl-secs = 4

            [tiers.s]
            reqs = 10
            records = 1000

            [[identity]]
            id = "alice"
            key = "wonderland"
            admin = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.coordinator.lease_ttl_secs, 4);
        // unspecified sections fall back to defaults
        assert_eq!(cfg.coordinator.renewal_secs, 2);
        assert_eq!(cfg.tiers["s"].records, 1000);
        assert!(cfg.identity[0].admin);
    }
}

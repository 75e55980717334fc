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

//! # storage
//!
//! Abstractions for the drover storage layer: the coordination row store holding group, shard and
//! instance rows, and the blob store holding compressed shard snapshots.
//!
//! The row store is assumed *eventually consistent*: `scan` may serve stale rows, and the only
//! read the rest of the system may treat as authoritative is [RowBackend::get_consistent]. The
//! two-read-with-gap acquisition protocol in [groups](crate::groups) is the one correctness-
//! critical consumer of that guarantee.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use snafu::Backtrace;

#[derive(Debug)]
#[allow(dead_code)] // `backtrace` is captured for Debug output only
pub struct Error {
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
    backtrace: Backtrace,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for Error {}

impl Error {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Error {
        Error {
            source: Box::new(err),
            backtrace: Backtrace::capture(),
        }
    }
    pub fn msg<S: Into<String>>(msg: S) -> Error {
        Error {
            source: msg.into().into(),
            backtrace: Backtrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// One row in a coordination-store table: a primary key, a serialised JSON payload in the `info`
/// attribute, and scalar control columns readable without parsing the payload.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowData {
    pub key: String,
    pub info: String,
    pub attrs: BTreeMap<String, String>,
}

impl RowData {
    pub fn new<K: Into<String>, I: Into<String>>(key: K, info: I) -> RowData {
        RowData {
            key: key.into(),
            info: info.into(),
            attrs: BTreeMap::new(),
        }
    }
    pub fn with_attr<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> RowData {
        self.attrs.insert(name.into(), value.into());
        self
    }
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }
}

/// Object-safe interface to the coordination row store.
#[async_trait]
pub trait RowBackend {
    /// Insert or overwrite a row. Last writer wins.
    async fn put(&self, table: &str, row: &RowData) -> Result<()>;
    /// Strongly-consistent point read; `None` when no row exists under `key`.
    async fn get_consistent(&self, table: &str, key: &str) -> Result<Option<RowData>>;
    /// Full table scan. May serve stale rows.
    async fn scan(&self, table: &str) -> Result<Vec<RowData>>;
    async fn delete(&self, table: &str, key: &str) -> Result<()>;
}

/// Object-safe interface to the blob store holding shard snapshots.
#[async_trait]
pub trait BlobBackend {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()>;
    /// `None` when no blob exists under `key` — a missing snapshot is not an error.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////
//                                   in-memory implementations                                    //
////////////////////////////////////////////////////////////////////////////////////////////////////

type Tables = HashMap<String, BTreeMap<String, RowData>>;

/// In-memory [RowBackend].
///
/// Shared by unit tests and the integration harness (several in-process instances holding one
/// `Arc<MemoryRows>` stand in for a fleet sharing one DynamoDB). `freeze_scans` captures the
/// current contents and serves *that* to every subsequent [scan](RowBackend::scan) until
/// `thaw_scans` is called, imitating the stale reads an eventually-consistent store hands out;
/// [get_consistent](RowBackend::get_consistent) always reads the live map.
#[derive(Default)]
pub struct MemoryRows {
    live: Mutex<Tables>,
    frozen: Mutex<Option<Tables>>,
}

impl MemoryRows {
    pub fn new() -> MemoryRows {
        MemoryRows::default()
    }
    /// Serve stale scans from a snapshot of the current state.
    pub fn freeze_scans(&self) {
        let snap = self.live.lock().unwrap().clone();
        *self.frozen.lock().unwrap() = Some(snap);
    }
    pub fn thaw_scans(&self) {
        *self.frozen.lock().unwrap() = None;
    }
}

#[async_trait]
impl RowBackend for MemoryRows {
    async fn put(&self, table: &str, row: &RowData) -> Result<()> {
        self.live
            .lock()
            .unwrap()
            .entry(table.to_owned())
            .or_default()
            .insert(row.key.clone(), row.clone());
        Ok(())
    }
    async fn get_consistent(&self, table: &str, key: &str) -> Result<Option<RowData>> {
        Ok(self
            .live
            .lock()
            .unwrap()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned())
    }
    async fn scan(&self, table: &str) -> Result<Vec<RowData>> {
        let frozen = self.frozen.lock().unwrap();
        let tables = match frozen.as_ref() {
            Some(snap) => snap,
            None => return Ok(scan_of(&self.live.lock().unwrap(), table)),
        };
        Ok(scan_of(tables, table))
    }
    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        if let Some(t) = self.live.lock().unwrap().get_mut(table) {
            t.remove(key);
        }
        Ok(())
    }
}

fn scan_of(tables: &Tables, table: &str) -> Vec<RowData> {
    tables
        .get(table)
        .map(|t| t.values().cloned().collect())
        .unwrap_or_default()
}

/// In-memory [BlobBackend].
#[derive(Default)]
pub struct MemoryBlobs {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobs {
    pub fn new() -> MemoryBlobs {
        MemoryBlobs::default()
    }
    pub fn contains(&self, key: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(key)
    }
}

#[async_trait]
impl BlobBackend for MemoryBlobs {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.blobs.lock().unwrap().insert(key.to_owned(), body);
        Ok(())
    }
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.lock().unwrap().get(key).cloned())
    }
    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn rows_crud() {
        let rows = MemoryRows::new();
        let row = RowData::new("k1", r#"{"a":1}"#).with_attr("addr", "host-a");
        rows.put("t", &row).await.unwrap();
        let got = rows.get_consistent("t", "k1").await.unwrap().unwrap();
        assert_eq!(got.attr("addr"), Some("host-a"));
        assert_eq!(rows.scan("t").await.unwrap().len(), 1);
        rows.delete("t", "k1").await.unwrap();
        assert!(rows.get_consistent("t", "k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn frozen_scans_serve_stale_rows() {
        let rows = MemoryRows::new();
        rows.put("t", &RowData::new("k1", "old")).await.unwrap();
        rows.freeze_scans();
        rows.put("t", &RowData::new("k1", "new")).await.unwrap();
        // scan is stale, the strong read is not
        assert_eq!(rows.scan("t").await.unwrap()[0].info, "old");
        assert_eq!(
            rows.get_consistent("t", "k1").await.unwrap().unwrap().info,
            "new"
        );
        rows.thaw_scans();
        assert_eq!(rows.scan("t").await.unwrap()[0].info, "new");
    }
}

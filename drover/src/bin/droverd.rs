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

//! # droverd
//!
//! The drover daemon: reads the TOML configuration, connects the DynamoDB coordination store and
//! the S3 snapshot bucket, joins the fleet, and serves the HTTP API until SIGINT/SIGTERM. On
//! shutdown every lease this instance holds is released cleanly — the rest of the fleet picks
//! the shards up within a lease TTL either way, clean exit or crash.

use std::sync::Arc;

use clap::{crate_authors, crate_version, value_parser, Arg, ArgAction, Command};
use snafu::prelude::*;
use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
    sync::Notify,
};
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use drover::{
    api,
    config::Config,
    dynamodb::DynamoRows,
    entities::UserId,
    groups::{self, Groups},
    identity::MemoryProvider,
    manager::{Manager, NoopBilling},
    registry::{self, Registry},
    s3::S3Blobs,
    storage::{BlobBackend, RowBackend},
};

#[derive(Snafu)]
pub enum Error {
    #[snafu(display("Failed to bind to port {port}: {source}"))]
    Bind {
        port: u16,
        source: std::io::Error,
    },
    #[snafu(display("{source}"))]
    Config { source: drover::config::Error },
    #[snafu(display("Failed to connect to DynamoDB: {source}"))]
    Dynamo { source: drover::storage::Error },
    #[snafu(display("Failed to prepare table {table}: {source}"))]
    EnsureTable {
        table: String,
        source: drover::storage::Error,
    },
    #[snafu(display("Failed to connect to S3: {source}"))]
    S3 { source: drover::storage::Error },
    #[snafu(display("The HTTP server failed: {source}"))]
    Serve { source: std::io::Error },
    #[snafu(display("Failed to install a signal handler: {source}"))]
    Signals { source: std::io::Error },
}

// `main` returns `Result<(), Error>`; the runtime prints the `Debug` representation on the error
// path, so route it through `Display` for something an operator can read.
impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self, f)
    }
}

type Result<T> = std::result::Result<T, Error>;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("droverd")
        .version(crate_version!())
        .author(crate_authors!())
        .about("sharded multi-tenant recommendation service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("droverd.toml")
                .help("path to the TOML configuration file"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(value_parser!(u16))
                .help("override the configured listen port"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .action(ArgAction::SetTrue)
                .help("log at debug level (RUST_LOG overrides)"),
        )
        .get_matches();

    let default_level = if matches.get_flag("debug") {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let mut cfg = matches
        .get_one::<String>("config")
        .map(Config::from_path)
        .unwrap_or_else(|| Ok(Config::default()))
        .context(ConfigSnafu)?;
    if let Some(port) = matches.get_one::<u16>("port") {
        cfg.http.port = *port;
    }

    let dynamo = DynamoRows::connect(&cfg.aws).await.context(DynamoSnafu)?;
    for table in [
        registry::INSTANCES_TABLE,
        groups::GROUPS_TABLE,
        groups::SHARDS_TABLE,
    ] {
        let table = format!("{}_{}", cfg.aws.prefix, table);
        dynamo
            .ensure_table(&table)
            .await
            .context(EnsureTableSnafu { table })?;
    }
    let rows: Arc<dyn RowBackend + Send + Sync> = Arc::new(dynamo);
    let blobs: Arc<dyn BlobBackend + Send + Sync> = Arc::new(
        S3Blobs::connect(&cfg.aws, &cfg.backups.bucket)
            .await
            .context(S3Snafu)?,
    );

    let mut provider = MemoryProvider::new();
    for user in &cfg.identity {
        provider = provider.with_user(user.id.as_str(), user.key.as_str(), user.admin);
    }

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
        cfg.admin_user.as_deref().map(UserId::new),
        cfg.coordinator.clone(),
    );
    groups.refresh().await;

    let background = Arc::new(Notify::new());
    let heartbeat = registry.spawn_heartbeat(Arc::clone(&background));
    let refresher = groups.spawn_refresh(Arc::clone(&background));

    let port = cfg.http.port;
    let manager = Manager::new(
        cfg,
        groups,
        registry,
        blobs,
        Arc::new(provider),
        Arc::new(NoopBilling),
    );
    let loops = manager.start();

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .context(BindSnafu { port })?;
    info!(port, "drover started");
    axum::serve(listener, api::make_router(Arc::clone(&manager)))
        .with_graceful_shutdown(wait_for_signal())
        .await
        .context(ServeSnafu)?;

    info!("stopping all services");
    manager.shutdown();
    manager.wait_finished().await;
    background.notify_waiters();
    heartbeat.abort();
    refresher.abort();
    for task in loops {
        task.abort();
    }
    Ok(())
}

async fn wait_for_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            // no SIGTERM stream; fall back to ctrl-c alone
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => (),
        _ = term.recv() => (),
    }
}

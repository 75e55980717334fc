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

//! # dynamodb
//!
//! [RowBackend] implementation over DynamoDB.
//!
//! Every table is primary-keyed by a string `id` attribute; the serialised payload lives in
//! `info` and the scalar control columns ride along as additional string attributes. Tables are
//! created on startup when missing (single-digit provisioned throughput — the coordination
//! traffic is tiny) and polled until ACTIVE, matching how the rest of the fleet expects to find
//! them.
//!
//! `get_consistent` sets `consistent_read` — the one strongly-consistent operation the
//! ownership protocol depends on. Scans are left eventually consistent on purpose.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::{
    config::Credentials,
    types::{
        AttributeDefinition, AttributeValue, KeySchemaElement, KeyType, ProvisionedThroughput,
        ScalarAttributeType, TableStatus,
    },
    Client,
};
use tracing::{debug, info};

use crate::{
    config::AwsConfig,
    storage::{Error, Result, RowBackend, RowData},
};

const PRIMARY_KEY: &str = "id";
const INFO_ATTR: &str = "info";
const DEFAULT_THROUGHPUT: i64 = 5;

pub struct DynamoRows {
    client: Client,
}

impl DynamoRows {
    /// Build a client against a region (or an explicit endpoint, for a local DynamoDB) with
    /// credentials from configuration or the ambient environment.
    pub async fn connect(cfg: &AwsConfig) -> Result<DynamoRows> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()));
        if let Some((id, secret)) = &cfg.credentials {
            loader = loader.credentials_provider(Credentials::new(id, secret, None, None, "drover"));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_dynamodb::config::Builder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(DynamoRows {
            client: Client::from_conf(builder.build()),
        })
    }

    /// Create `table` if it doesn't exist and wait for it to go ACTIVE.
    pub async fn ensure_table(&self, table: &str) -> Result<()> {
        if self.table_status(table).await?.is_none() {
            info!(table, "creating a new table on DynamoDB");
            self.client
                .create_table()
                .table_name(table)
                .attribute_definitions(
                    AttributeDefinition::builder()
                        .attribute_name(PRIMARY_KEY)
                        .attribute_type(ScalarAttributeType::S)
                        .build()
                        .map_err(Error::new)?,
                )
                .key_schema(
                    KeySchemaElement::builder()
                        .attribute_name(PRIMARY_KEY)
                        .key_type(KeyType::Hash)
                        .build()
                        .map_err(Error::new)?,
                )
                .provisioned_throughput(
                    ProvisionedThroughput::builder()
                        .read_capacity_units(DEFAULT_THROUGHPUT)
                        .write_capacity_units(DEFAULT_THROUGHPUT)
                        .build()
                        .map_err(Error::new)?,
                )
                .send()
                .await
                .map_err(Error::new)?;
        }
        loop {
            match self.table_status(table).await? {
                Some(TableStatus::Active) => return Ok(()),
                status => {
                    debug!(table, ?status, "waiting for the table to go active");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn table_status(&self, table: &str) -> Result<Option<TableStatus>> {
        match self.client.describe_table().table_name(table).send().await {
            Ok(out) => Ok(out.table().and_then(|t| t.table_status()).cloned()),
            Err(err) => {
                let service = err.into_service_error();
                if service.is_resource_not_found_exception() {
                    Ok(None)
                } else {
                    Err(Error::new(service))
                }
            }
        }
    }
}

fn to_row(item: HashMap<String, AttributeValue>) -> RowData {
    let mut row = RowData::default();
    for (name, value) in item {
        let text = match value.as_s() {
            Ok(text) => text.clone(),
            Err(_) => continue, // this schema only writes string attributes
        };
        match name.as_str() {
            PRIMARY_KEY => row.key = text,
            INFO_ATTR => row.info = text,
            _ => {
                row.attrs.insert(name, text);
            }
        }
    }
    row
}

#[async_trait]
impl RowBackend for DynamoRows {
    async fn put(&self, table: &str, row: &RowData) -> Result<()> {
        let mut req = self
            .client
            .put_item()
            .table_name(table)
            .item(PRIMARY_KEY, AttributeValue::S(row.key.clone()))
            .item(INFO_ATTR, AttributeValue::S(row.info.clone()));
        for (name, value) in &row.attrs {
            req = req.item(name, AttributeValue::S(value.clone()));
        }
        req.send().await.map_err(Error::new)?;
        Ok(())
    }

    async fn get_consistent(&self, table: &str, key: &str) -> Result<Option<RowData>> {
        let out = self
            .client
            .get_item()
            .table_name(table)
            .key(PRIMARY_KEY, AttributeValue::S(key.to_owned()))
            .consistent_read(true)
            .send()
            .await
            .map_err(Error::new)?;
        Ok(out.item().cloned().map(to_row))
    }

    async fn scan(&self, table: &str) -> Result<Vec<RowData>> {
        let mut rows = Vec::new();
        let mut pages = self
            .client
            .scan()
            .table_name(table)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(Error::new)?;
            for item in page.items() {
                rows.push(to_row(item.clone()));
            }
        }
        Ok(rows)
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(table)
            .key(PRIMARY_KEY, AttributeValue::S(key.to_owned()))
            .send()
            .await
            .map_err(Error::new)?;
        Ok(())
    }
}

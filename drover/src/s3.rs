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

//! # s3
//!
//! [BlobBackend] implementation over S3, where the shard snapshots live. Deliberately dumb:
//! put/get/delete against one configured bucket, with a missing key reading as `None` rather
//! than an error — a shard without a snapshot simply starts empty.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::{config::Credentials, primitives::ByteStream, Client};
use tracing::debug;

use crate::{
    config::AwsConfig,
    storage::{BlobBackend, Error, Result},
};

pub struct S3Blobs {
    client: Client,
    bucket: String,
}

impl S3Blobs {
    pub async fn connect(cfg: &AwsConfig, bucket: &str) -> Result<S3Blobs> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cfg.region.clone()));
        if let Some((id, secret)) = &cfg.credentials {
            loader = loader.credentials_provider(Credentials::new(id, secret, None, None, "drover"));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &cfg.endpoint {
            // non-AWS endpoints (minio & friends) want path-style addressing
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Ok(S3Blobs {
            client: Client::from_conf(builder.build()),
            bucket: bucket.to_owned(),
        })
    }
}

#[async_trait]
impl BlobBackend for S3Blobs {
    async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        debug!(bucket = %self.bucket, key, bytes = body.len(), "storing a blob");
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(Error::new)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let out = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(out) => out,
            Err(err) => {
                let service = err.into_service_error();
                return if service.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(Error::new(service))
                };
            }
        };
        let bytes = out.body.collect().await.map_err(Error::new)?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Error::new)?;
        Ok(())
    }
}

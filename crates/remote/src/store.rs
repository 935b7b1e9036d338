// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Object store construction and bulk deletion

use std::sync::Arc;

use futures::StreamExt;
use log::{info, warn};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path;
use object_store::{ClientOptions, ObjectStore};
use serde::{Deserialize, Serialize};

use crate::{RemoteError, Result};

/// How to talk to an S3 endpoint. Every field optional; unset fields fall
/// back to the ambient AWS environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Endpoint {
    #[serde(default)]
    pub profile_name: Option<String>,
    #[serde(default)]
    pub region_name: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Set to `false` to accept invalid TLS certificates (self-hosted
    /// endpoints with private CAs).
    #[serde(default)]
    pub verify: Option<bool>,
}

/// One S3 bucket acting as a backup remote.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct S3Remote {
    pub bucket: String,
    #[serde(default)]
    pub endpoint: S3Endpoint,
}

/// Build the object store for a remote. Credentials and retry policy are
/// the client's concern; callers only see the [`ObjectStore`] seam.
pub fn build_object_store(remote: &S3Remote) -> Result<Arc<dyn ObjectStore>> {
    let endpoint = &remote.endpoint;
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(&remote.bucket);

    if let Some(profile) = &endpoint.profile_name {
        // object_store resolves credentials from the environment; a config
        // profile only takes effect via AWS_PROFILE.
        warn!("profile_name {profile} is honored only through the AWS_PROFILE environment");
    }
    if let Some(region) = &endpoint.region_name {
        builder = builder.with_region(region);
    }
    if let Some(key) = &endpoint.access_key_id {
        builder = builder.with_access_key_id(key);
    }
    if let Some(secret) = &endpoint.secret_access_key {
        builder = builder.with_secret_access_key(secret);
    }
    if let Some(url) = &endpoint.endpoint_url {
        builder = builder.with_endpoint(url);
        if url.starts_with("http://") {
            builder = builder.with_allow_http(true);
        }
    }
    if endpoint.verify == Some(false) {
        builder =
            builder.with_client_options(ClientOptions::new().with_allow_invalid_certificates(true));
    }

    Ok(Arc::new(builder.build().map_err(|e| {
        RemoteError::Configuration(format!("bucket {}: {e}", remote.bucket))
    })?))
}

/// Delete objects in batches of at most 1000 keys. A key that is already
/// gone counts as deleted.
pub async fn delete_keys(store: &Arc<dyn ObjectStore>, keys: &[String]) -> Result<()> {
    for batch in keys.chunks(1000) {
        for key in batch {
            info!("deleting backup {key}");
        }
        let locations =
            futures::stream::iter(batch.iter().map(|k| Ok(Path::from(k.as_str())))).boxed();
        let mut results = store.delete_stream(locations);
        while let Some(result) = results.next().await {
            match result {
                Ok(_) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

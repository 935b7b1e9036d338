// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Remote inventory: one listing reconstructs all backup state

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use log::warn;
use object_store::ObjectStore;
use snapmeta::BackupMeta;
use uuid::Uuid;

use crate::Result;

/// One backup object, as recovered from its key.
#[derive(Debug, Clone)]
pub struct BackupObject {
    pub key: String,
    pub base: String,
    pub meta: BackupMeta,
    pub size: u64,
}

/// List every backup object in the bucket.
///
/// Keys that do not decode are logged and skipped, never deleted: they may
/// belong to another tool sharing the bucket.
pub async fn list_backups(store: &Arc<dyn ObjectStore>) -> Result<Vec<BackupObject>> {
    let mut backups = Vec::new();
    let mut listing = store.list(None);
    while let Some(object) = listing.next().await {
        let object = object?;
        let key = object.location.to_string();
        match snapmeta::decode(&key) {
            Ok((base, meta)) => backups.push(BackupObject {
                key,
                base,
                meta,
                size: object.size as u64,
            }),
            Err(e) => warn!("ignoring object {key}: {e}"),
        }
    }
    Ok(backups)
}

/// Group backup objects by their source subvolume uuid.
#[must_use]
pub fn group_by_source(backups: Vec<BackupObject>) -> HashMap<Uuid, Vec<BackupObject>> {
    let mut by_source: HashMap<Uuid, Vec<BackupObject>> = HashMap::new();
    for backup in backups {
        by_source.entry(backup.meta.parent_uuid).or_default().push(backup);
    }
    by_source
}

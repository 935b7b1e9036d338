// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Backup metadata and its filename/object-key encoding
//!
//! Every backup object carries its complete metadata in its S3 key, so the
//! whole remote state can be reconstructed from a single bucket listing.
//! Snapshots on disk use the same encoding for their canonical filenames,
//! which lets one parser serve both inventories.

mod codec;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use codec::{decode, encode};

/// The only metadata version this build reads or writes.
pub const METADATA_VERSION: u16 = 1;

/// The only sequence number this build reads or writes.
pub const SEQUENCE_NUMBER: u32 = 0;

/// S3 limits keys to 1024 bytes; encoded keys must fit.
pub const MAX_KEY_LEN: usize = 1024;

/// Result type for metadata operations
pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("malformed backup key: {0}")]
    MalformedKey(String),

    #[error("unsupported backup metadata version: {0}")]
    UnsupportedMetadataVersion(u16),

    #[error("unsupported backup sequence number: {0}")]
    UnsupportedSequence(u32),
}

/// Metadata describing one backup of a snapshot.
///
/// Mirrors the kernel-reported snapshot attributes plus the identity of the
/// send-parent used when the backup was produced. `send_parent` is `None`
/// for a full backup; on the wire this is the zero UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    /// UUID of the snapshot this backup was taken from.
    pub uuid: Uuid,
    /// UUID of the mutable source subvolume.
    pub parent_uuid: Uuid,
    /// Send-parent snapshot, or `None` for a full backup.
    pub send_parent: Option<Uuid>,
    /// Source transaction id at snapshot time.
    pub ctransid: u64,
    /// Snapshot creation time. The offset is preserved verbatim so keys
    /// round-trip byte for byte.
    pub ctime: DateTime<FixedOffset>,
}

impl BackupMeta {
    /// Whether this backup is a full (non-differential) backup.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.send_parent.is_none()
    }

    /// The send-parent as stored on the wire (zero UUID for full backups).
    #[must_use]
    pub fn send_parent_or_nil(&self) -> Uuid {
        self.send_parent.unwrap_or_else(Uuid::nil)
    }
}

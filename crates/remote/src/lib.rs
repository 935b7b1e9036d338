// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Remote side of snapship: object storage, the subprocess pipeline, and
//! the streaming uploader
//!
//! Backups are opaque byte streams produced by `btrfs send`, optionally
//! piped through user-configured filters, and shipped to an S3-compatible
//! store as a single object per backup. All per-backup metadata lives in
//! the object key, so [`list_backups`] reconstructs the remote state from
//! one listing.
//!
//! - [`build_object_store`] maps endpoint config onto an
//!   [`object_store::ObjectStore`]; tests substitute
//!   `object_store::memory::InMemory` behind the same seam.
//! - [`Pipeline`] owns the `send | filter...` subprocess chain: every
//!   child is reaped, stderr tails are captured for error reports, and
//!   teardown escalates SIGTERM to SIGKILL.
//! - [`upload_stream`] ships an unbounded, non-seekable stream using the
//!   minimum number of API calls, spilling to an unlinked temp file and
//!   choosing single-PUT vs multipart by the buffered prefix length.

mod error;
mod inventory;
mod piper;
mod store;
mod uploader;

pub use error::{RemoteError, Result};
pub use inventory::{group_by_source, list_backups, BackupObject};
pub use piper::Pipeline;
pub use store::{build_object_store, delete_keys, S3Endpoint, S3Remote};
pub use uploader::{
    upload_stream, UploadParams, UploadSummary, DEFAULT_MAX_OBJECT, DEFAULT_MAX_PARTS,
    DEFAULT_PART_THRESHOLD,
};

// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Kernel-reported attributes of a subvolume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubvolInfo {
    pub uuid: Uuid,
    /// UUID of the subvolume this one was snapshotted from; `None` for a
    /// subvolume that is not a snapshot.
    pub parent_uuid: Option<Uuid>,
    /// Transaction id at the last change.
    pub ctransid: u64,
    /// Creation time.
    pub ctime: DateTime<Utc>,
    pub read_only: bool,
}

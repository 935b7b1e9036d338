// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! The resolver's unit of work
//!
//! An [`Item`] is one logical snapshot/backup pair, merged from the local
//! and remote inventories by uuid. In steady state every item is present
//! on both sides.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identity of an item inside one resolution.
///
/// `Proposed` is the snapshot the executor has yet to create; the resolver
/// makes at most one proposal per source per run, so a sentinel suffices.
/// The executor binds it to a real uuid after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ItemId {
    Existing(Uuid),
    Proposed,
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemId::Existing(u) => write!(f, "{u}"),
            ItemId::Proposed => f.write_str("<new snapshot>"),
        }
    }
}

/// Where an item currently exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Local,
    Remote,
    Both,
}

impl Presence {
    #[must_use]
    pub fn is_local(self) -> bool {
        matches!(self, Presence::Local | Presence::Both)
    }

    #[must_use]
    pub fn is_remote(self) -> bool {
        matches!(self, Presence::Remote | Presence::Both)
    }
}

#[derive(Debug, Clone)]
pub struct Item {
    pub uuid: Uuid,
    pub ctime: DateTime<Utc>,
    pub ctransid: u64,
    /// Send-parent recorded in the remote object's metadata, when the item
    /// has a backup. `None` for full backups and never-uploaded snapshots.
    pub send_parent: Option<Uuid>,
    pub presence: Presence,
    /// Filename under the snapshot directory, when locally present.
    pub current_name: Option<String>,
    /// What the filename should be per the metadata codec.
    pub canonical_name: Option<String>,
}

// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Decides which items to keep and the send-parent for each kept item
//!
//! Resolution is a pure function of the inventory, the policy, and whether
//! the source has changed since the newest snapshot. For every wanted
//! `(timeframe, bucket)` it nominates the first item of the interval, then
//! proposes a fresh snapshot when the current root or finest bucket has no
//! nominee, keeps the most recent restore point, keeps recorded
//! send-parent chains of kept backups, and finally assigns a send-parent
//! to every item that will need a new backup.
//!
//! Parent assignment walks from an item's coarsest nominating timeframe
//! toward the policy root. When the coarser bucket has no kept item (it
//! predates every retained coarser backup), the item is promoted: it
//! claims that bucket itself, so later orphans in the same interval chain
//! to it instead of each becoming a full backup.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use log::warn;
use uuid::Uuid;

use crate::item::{Item, ItemId};
use crate::policy::Policy;
use crate::timeframe::{Bucket, Timeframe};
use crate::{Result, ScheduleError};

pub struct ResolveInput<'a> {
    pub items: &'a [Item],
    pub policy: &'a Policy,
    /// Whether `source.ctransid` exceeds every existing snapshot's, i.e.
    /// whether a fresh snapshot may be proposed.
    pub source_changed: bool,
}

/// Why an item is kept. Several reasons may apply at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reasons {
    /// Nominated for a wanted (timeframe, bucket).
    pub preserved: bool,
    /// The freshest restore point for the source.
    pub most_recent: bool,
    /// A recorded send-parent of another kept backup.
    pub send_ancestor: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Kept {
    /// Send-parent: recorded metadata for items that already have a
    /// backup, assigned structurally for items that will get a new one.
    /// `None` means a full backup.
    pub parent: Option<ItemId>,
    /// Effective (possibly promoted) timeframe of the nomination; `None`
    /// for items kept only as send-ancestors.
    pub timeframe: Option<Timeframe>,
    pub reasons: Reasons,
}

#[derive(Debug)]
pub struct Resolution {
    pub keep: BTreeMap<ItemId, Kept>,
    pub now: DateTime<Utc>,
}

impl Resolution {
    #[must_use]
    pub fn is_kept(&self, id: &ItemId) -> bool {
        self.keep.contains_key(id)
    }

    /// Whether the executor must create a fresh snapshot this run.
    #[must_use]
    pub fn proposes_new(&self) -> bool {
        self.keep.contains_key(&ItemId::Proposed)
    }
}

pub fn resolve(input: ResolveInput<'_>) -> Result<Resolution> {
    let ResolveInput { items, policy, source_changed } = input;
    let now = policy.now();

    let mut by_uuid: HashMap<Uuid, &Item> = HashMap::new();
    for item in items {
        if by_uuid.insert(item.uuid, item).is_some() {
            return Err(ScheduleError::ResolverInconsistency(format!(
                "duplicate item uuid {}",
                item.uuid
            )));
        }
    }
    let ctime_of = |id: ItemId| match id {
        ItemId::Proposed => now,
        ItemId::Existing(u) => by_uuid[&u].ctime,
    };

    // One nominee per wanted (timeframe, bucket): the first backup of the
    // interval, among locally-present items. Ties break on ctransid then
    // uuid; a full tie means the clock moved backwards in a way we cannot
    // order, which is a bug signal rather than a choice to make silently.
    let mut slot: HashMap<Bucket, ItemId> = HashMap::new();
    for item in items.iter().filter(|i| i.presence.is_local()) {
        for tf in policy.timeframes() {
            let b = policy.bucket_of(tf, item.ctime);
            if !policy.is_wanted(&b) {
                continue;
            }
            match slot.entry(b) {
                Entry::Vacant(e) => {
                    e.insert(ItemId::Existing(item.uuid));
                }
                Entry::Occupied(mut e) => {
                    let ItemId::Existing(cur) = *e.get() else {
                        continue;
                    };
                    let cur = by_uuid[&cur];
                    if (item.ctime, item.ctransid) == (cur.ctime, cur.ctransid) {
                        return Err(ScheduleError::ResolverInconsistency(format!(
                            "items {} and {} tie on both ctime and ctransid in {:?}",
                            item.uuid, cur.uuid, b
                        )));
                    }
                    if (item.ctime, item.ctransid, item.uuid) < (cur.ctime, cur.ctransid, cur.uuid)
                    {
                        *e.get_mut() = ItemId::Existing(item.uuid);
                    }
                }
            }
        }
    }

    // Coarsest nominating timeframe per nominee.
    let mut eff_tf: HashMap<ItemId, Timeframe> = HashMap::new();
    for (b, id) in &slot {
        eff_tf
            .entry(*id)
            .and_modify(|t| *t = (*t).min(b.timeframe))
            .or_insert(b.timeframe);
    }

    // Propose one fresh snapshot when the source has advanced and the
    // current root and/or finest bucket has no nominee. Past empty buckets
    // are not fillable: nothing exists to back up for them.
    let mut proposed = false;
    if source_changed {
        for tf in [policy.root_timeframe(), policy.finest_timeframe()] {
            let b = policy.bucket_of(tf, now);
            if let Entry::Vacant(e) = slot.entry(b) {
                e.insert(ItemId::Proposed);
                proposed = true;
                eff_tf
                    .entry(ItemId::Proposed)
                    .and_modify(|t| *t = (*t).min(tf))
                    .or_insert(tf);
            }
        }
    }

    let mut keep: BTreeMap<ItemId, Kept> = BTreeMap::new();
    for id in slot.values() {
        keep.entry(*id).or_default().reasons.preserved = true;
    }

    // Always keep the freshest restore point: the proposal if one was
    // made, otherwise the newest local snapshot.
    let most_recent = if proposed {
        Some(ItemId::Proposed)
    } else {
        items
            .iter()
            .filter(|i| i.presence.is_local())
            .max_by_key(|i| (i.ctransid, i.ctime, i.uuid))
            .map(|i| ItemId::Existing(i.uuid))
    };
    if let Some(id) = most_recent {
        keep.entry(id).or_default().reasons.most_recent = true;
        eff_tf.entry(id).or_insert_with(|| policy.finest_timeframe());
    }

    // Recorded send-parent chains of kept backups stay restorable: keep
    // every ancestor that still exists. An ancestor whose object is gone
    // but whose snapshot survives gets a fresh backup below.
    let mut pending: VecDeque<Uuid> = keep
        .keys()
        .filter_map(|id| match id {
            ItemId::Existing(u) if by_uuid[u].presence.is_remote() => by_uuid[u].send_parent,
            _ => None,
        })
        .collect();
    while let Some(u) = pending.pop_front() {
        let id = ItemId::Existing(u);
        if keep.contains_key(&id) {
            continue;
        }
        match by_uuid.get(&u) {
            Some(item) => {
                keep.entry(id).or_default().reasons.send_ancestor = true;
                eff_tf.entry(id).or_insert_with(|| policy.finest_timeframe());
                if item.presence.is_remote() {
                    if let Some(p) = item.send_parent {
                        pending.push_back(p);
                    }
                }
            }
            None => warn!("backup chain is broken: send-parent {u} is missing"),
        }
    }

    // Assign a send-parent to every kept item that will need a new backup.
    // Walk the policy timeframes coarsest to finest over the buckets
    // containing the item's ctime: the last kept occupant seen before the
    // item's own nomination becomes the parent. A vacant bucket can only
    // be an expired (unwanted) one; the item claims it, becoming a full
    // backup that later orphans in the same interval chain to. Oldest
    // first, so the claim goes to the first backup of the interval.
    let order: Vec<Timeframe> = policy.timeframes().collect();
    let mut to_assign: Vec<ItemId> = keep
        .keys()
        .copied()
        .filter(|id| match id {
            ItemId::Proposed => true,
            ItemId::Existing(u) => !by_uuid[u].presence.is_remote(),
        })
        .collect();
    to_assign.sort_by_key(|id| match *id {
        ItemId::Existing(u) => (0u8, by_uuid[&u].ctime, by_uuid[&u].ctransid, u),
        ItemId::Proposed => (1u8, now, 0, Uuid::nil()),
    });

    let mut assigned: HashMap<ItemId, Option<ItemId>> = HashMap::new();
    for id in &to_assign {
        let t = ctime_of(*id);
        let mut parent: Option<ItemId> = None;
        for tf in &order {
            match slot.entry(policy.bucket_of(*tf, t)) {
                Entry::Occupied(e) if *e.get() == *id => {
                    // Nominated here; everything finer would be self or
                    // descendants.
                    eff_tf.insert(*id, *tf);
                    break;
                }
                Entry::Occupied(e) => parent = Some(*e.get()),
                Entry::Vacant(e) => {
                    e.insert(*id);
                    eff_tf.insert(*id, *tf);
                    break;
                }
            }
        }
        assigned.insert(*id, parent);
    }

    for (id, kept) in &mut keep {
        kept.timeframe = eff_tf.get(id).copied();
        kept.parent = match id {
            ItemId::Proposed => assigned[&ItemId::Proposed],
            ItemId::Existing(u) => {
                let item = by_uuid[u];
                if item.presence.is_remote() {
                    item.send_parent.map(ItemId::Existing)
                } else {
                    assigned.get(id).copied().flatten()
                }
            }
        };
    }

    verify(&keep, &by_uuid, policy, &eff_tf, &ctime_of)?;

    Ok(Resolution { keep, now })
}

/// Check the keep set against the tree invariants. A violation here is a
/// resolver bug, and the run must stop before any action executes.
fn verify(
    keep: &BTreeMap<ItemId, Kept>,
    by_uuid: &HashMap<Uuid, &Item>,
    policy: &Policy,
    eff_tf: &HashMap<ItemId, Timeframe>,
    ctime_of: &dyn Fn(ItemId) -> DateTime<Utc>,
) -> Result<()> {
    let fail = |msg: String| Err(ScheduleError::ResolverInconsistency(msg));

    for (id, kept) in keep {
        let Some(parent) = kept.parent else { continue };
        if parent == *id {
            return fail(format!("{id} is its own send-parent"));
        }
        if !keep.contains_key(&parent) {
            // A recorded parent that vanished from both inventories was
            // already warned about; anything else is a bug.
            if matches!(parent, ItemId::Existing(u) if by_uuid.contains_key(&u)) {
                return fail(format!("send-parent {parent} of {id} is not kept"));
            }
            continue;
        }
        if let (Some(ptf), Some(tf)) = (
            eff_tf.get(&parent).copied(),
            eff_tf.get(id).copied(),
        ) {
            // The strictly-coarser rule binds the nominated tree. Recorded
            // chains reflect history, and a most-recent-only item chains to
            // its own interval's nominee by design.
            let recorded = matches!(id, ItemId::Existing(u) if by_uuid[u].presence.is_remote());
            if kept.reasons.preserved && !recorded && ptf >= tf {
                return fail(format!(
                    "send-parent {parent} ({ptf}) of {id} ({tf}) is not coarser"
                ));
            }
        }
    }

    // No cycles in the parent relation.
    for start in keep.keys() {
        let mut cursor = *start;
        for _ in 0..=keep.len() {
            match keep.get(&cursor).and_then(|k| k.parent) {
                Some(next) => cursor = next,
                None => break,
            }
            if cursor == *start {
                return fail(format!("send-parent cycle through {start}"));
            }
        }
    }

    // At most one full backup per wanted root bucket.
    let root_tf = policy.root_timeframe();
    let mut roots: HashMap<Bucket, ItemId> = HashMap::new();
    for (id, kept) in keep {
        if kept.parent.is_some() {
            continue;
        }
        let b = policy.bucket_of(root_tf, ctime_of(*id));
        if !policy.is_wanted(&b) {
            continue;
        }
        if let Some(other) = roots.insert(b, *id) {
            return fail(format!("two full backups in one root bucket: {other} and {id}"));
        }
    }

    Ok(())
}

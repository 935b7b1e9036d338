// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Turns a resolution into an ordered, validated action plan
//!
//! The symmetric difference between the inventory and the keep set becomes
//! actions in a fixed order: canonicalizing renames first, then snapshot
//! creation, then backup creation (send-parents before their children),
//! then backup deletion, then snapshot deletion. Deleting backups before
//! snapshots means a failed deletion can never orphan a remote child of a
//! locally-absent parent.
//!
//! Every plan is replayed against a simulated inventory before it is
//! returned; a divergence from the keep set is a planner bug and fails the
//! run before any action executes.

use std::collections::{BTreeSet, HashMap, HashSet};

use uuid::Uuid;

use crate::item::{Item, ItemId};
use crate::resolver::Resolution;
use crate::{Result, ScheduleError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Correct a snapshot's on-disk name to its canonical metadata name.
    RenameSnapshot { uuid: Uuid, from: String, to: String },
    /// Create the one fresh snapshot this run proposes.
    CreateSnapshot,
    /// Upload a backup of a kept snapshot. `send_parent` must already
    /// exist remotely when this action runs.
    CreateBackup { id: ItemId, send_parent: Option<ItemId> },
    DeleteBackup { uuid: Uuid },
    DeleteSnapshot { uuid: Uuid },
}

#[derive(Debug, Default)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// Diff the inventory against the resolver's keep set.
pub fn plan(items: &[Item], resolution: &Resolution) -> Result<Plan> {
    let by_id: HashMap<ItemId, &Item> =
        items.iter().map(|i| (ItemId::Existing(i.uuid), i)).collect();

    let mut actions = Vec::new();

    // 1. Canonicalize names of kept local snapshots.
    let mut renames: Vec<Action> = resolution
        .keep
        .keys()
        .filter_map(|id| by_id.get(id))
        .filter(|item| item.presence.is_local())
        .filter_map(|item| match (&item.current_name, &item.canonical_name) {
            (Some(from), Some(to)) if from != to => Some(Action::RenameSnapshot {
                uuid: item.uuid,
                from: from.clone(),
                to: to.clone(),
            }),
            _ => None,
        })
        .collect();
    renames.sort_by(|a, b| match (a, b) {
        (Action::RenameSnapshot { from: a, .. }, Action::RenameSnapshot { from: b, .. }) => {
            a.cmp(b)
        }
        _ => std::cmp::Ordering::Equal,
    });
    actions.extend(renames);

    // 2. Create the proposed snapshot.
    if resolution.proposes_new() {
        actions.push(Action::CreateSnapshot);
    }

    // 3. Create backups, send-parents first.
    let creating: BTreeSet<ItemId> = resolution
        .keep
        .keys()
        .copied()
        .filter(|id| match by_id.get(id) {
            Some(item) => !item.presence.is_remote(),
            None => *id == ItemId::Proposed,
        })
        .collect();
    let depth_of = |mut id: ItemId| -> Result<usize> {
        let mut depth = 0;
        while let Some(parent) = resolution.keep.get(&id).and_then(|k| k.parent) {
            if !creating.contains(&parent) {
                let parent_is_remote =
                    matches!(by_id.get(&parent), Some(item) if item.presence.is_remote());
                if !parent_is_remote {
                    return Err(ScheduleError::PlannerAssertion(format!(
                        "send-parent {parent} of {id} exists nowhere"
                    )));
                }
                break;
            }
            depth += 1;
            id = parent;
            if depth > resolution.keep.len() {
                return Err(ScheduleError::PlannerAssertion(format!(
                    "send-parent cycle through {id}"
                )));
            }
        }
        Ok(depth)
    };
    let mut creates = Vec::with_capacity(creating.len());
    for id in &creating {
        creates.push((depth_of(*id)?, *id));
    }
    creates.sort();
    actions.extend(creates.into_iter().map(|(_, id)| Action::CreateBackup {
        id,
        send_parent: resolution.keep[&id].parent,
    }));

    // 4. Delete expired backups, then 5. expired snapshots.
    let mut expired: Vec<&Item> = items
        .iter()
        .filter(|i| !resolution.is_kept(&ItemId::Existing(i.uuid)))
        .collect();
    expired.sort_by_key(|i| (i.ctime, i.uuid));
    actions.extend(
        expired
            .iter()
            .filter(|i| i.presence.is_remote())
            .map(|i| Action::DeleteBackup { uuid: i.uuid }),
    );
    actions.extend(
        expired
            .iter()
            .filter(|i| i.presence.is_local())
            .map(|i| Action::DeleteSnapshot { uuid: i.uuid }),
    );

    let plan = Plan { actions };
    validate(&plan, items, resolution)?;
    Ok(plan)
}

/// Replay a plan against a simulated inventory and require that the
/// outcome is exactly the keep set, with no action depending on state
/// that does not exist at its point in the sequence.
pub fn validate(plan: &Plan, items: &[Item], resolution: &Resolution) -> Result<()> {
    let fail = |msg: String| Err(ScheduleError::PlannerAssertion(msg));

    let mut local: HashSet<ItemId> = HashSet::new();
    let mut remote: HashSet<ItemId> = HashSet::new();
    for item in items {
        let id = ItemId::Existing(item.uuid);
        if item.presence.is_local() {
            local.insert(id);
        }
        if item.presence.is_remote() {
            remote.insert(id);
        }
    }

    for action in &plan.actions {
        match action {
            Action::RenameSnapshot { uuid, .. } => {
                if !local.contains(&ItemId::Existing(*uuid)) {
                    return fail(format!("rename of absent snapshot {uuid}"));
                }
            }
            Action::CreateSnapshot => {
                if !local.insert(ItemId::Proposed) {
                    return fail("snapshot created twice".to_string());
                }
            }
            Action::CreateBackup { id, send_parent } => {
                if !local.contains(id) {
                    return fail(format!("backup of snapshot {id} which does not exist"));
                }
                if let Some(parent) = send_parent {
                    if !remote.contains(parent) {
                        return fail(format!(
                            "backup of {id} refers to send-parent {parent} which is not remote yet"
                        ));
                    }
                }
                if !remote.insert(*id) {
                    return fail(format!("backup of {id} created twice"));
                }
            }
            Action::DeleteBackup { uuid } => {
                if !remote.remove(&ItemId::Existing(*uuid)) {
                    return fail(format!("deleting absent backup {uuid}"));
                }
            }
            Action::DeleteSnapshot { uuid } => {
                if !local.remove(&ItemId::Existing(*uuid)) {
                    return fail(format!("deleting absent snapshot {uuid}"));
                }
            }
        }
    }

    let by_id: HashMap<ItemId, &Item> =
        items.iter().map(|i| (ItemId::Existing(i.uuid), i)).collect();
    let expected_local: HashSet<ItemId> = resolution
        .keep
        .keys()
        .copied()
        .filter(|id| match by_id.get(id) {
            Some(item) => item.presence.is_local(),
            None => *id == ItemId::Proposed,
        })
        .collect();
    let expected_remote: HashSet<ItemId> = resolution.keep.keys().copied().collect();

    if local != expected_local {
        return fail(format!(
            "plan leaves snapshots {local:?}, expected {expected_local:?}"
        ));
    }
    if remote != expected_remote {
        return fail(format!(
            "plan leaves backups {remote:?}, expected {expected_remote:?}"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Presence;
    use crate::policy::{Params, Policy};
    use crate::resolver::{resolve, ResolveInput};
    use chrono_tz::Tz;

    fn uid(n: u8) -> Uuid {
        Uuid::from_u128(u128::from(n))
    }

    fn item(n: u8, ctime: &str, ctransid: u64, presence: Presence, send_parent: Option<u8>) -> Item {
        Item {
            uuid: uid(n),
            ctime: ctime.parse().unwrap(),
            ctransid,
            send_parent: send_parent.map(uid),
            presence,
            current_name: None,
            canonical_name: None,
        }
    }

    fn policy(desc: &str, now: &str) -> Policy {
        Policy::new(Params::parse(desc).unwrap(), now.parse().unwrap(), Tz::UTC).unwrap()
    }

    fn plan_for(items: &[Item], policy: &Policy, source_changed: bool) -> Plan {
        let resolution = resolve(ResolveInput { items, policy, source_changed }).unwrap();
        plan(items, &resolution).unwrap()
    }

    #[test]
    fn first_run_creates_snapshot_then_full_backup() {
        let policy = policy("1y 1d", "2006-01-02T00:00:01Z");
        let p = plan_for(&[], &policy, true);
        assert_eq!(
            p.actions,
            vec![
                Action::CreateSnapshot,
                Action::CreateBackup { id: ItemId::Proposed, send_parent: None },
            ]
        );
    }

    #[test]
    fn daily_rollover_plan() {
        let policy = policy("1y 1d", "2006-01-03T00:00:01Z");
        let items = [
            item(1, "2006-01-01T00:00:00Z", 10, Presence::Both, None),
            item(2, "2006-01-02T00:00:00Z", 20, Presence::Both, Some(1)),
        ];
        let p = plan_for(&items, &policy, true);
        assert_eq!(
            p.actions,
            vec![
                Action::CreateSnapshot,
                Action::CreateBackup {
                    id: ItemId::Proposed,
                    send_parent: Some(ItemId::Existing(uid(1))),
                },
                Action::DeleteBackup { uuid: uid(2) },
                Action::DeleteSnapshot { uuid: uid(2) },
            ]
        );
    }

    #[test]
    fn steady_state_is_a_no_op() {
        let policy = policy("1y 1d", "2006-01-03T12:00:00Z");
        let items = [
            item(1, "2006-01-01T00:00:00Z", 10, Presence::Both, None),
            item(2, "2006-01-03T00:00:00Z", 20, Presence::Both, Some(1)),
        ];
        let p = plan_for(&items, &policy, false);
        assert!(p.is_empty(), "unexpected actions: {:?}", p.actions);
    }

    #[test]
    fn local_only_item_gets_a_backup_and_remote_only_gets_deleted() {
        let policy = policy("2d", "2006-01-02T12:00:00Z");
        let items = [
            item(1, "2006-01-01T00:00:00Z", 10, Presence::Local, None),
            item(2, "2006-01-02T00:00:00Z", 20, Presence::Remote, None),
        ];
        let p = plan_for(&items, &policy, false);
        assert_eq!(
            p.actions,
            vec![
                Action::CreateBackup {
                    id: ItemId::Existing(uid(1)),
                    send_parent: None,
                },
                Action::DeleteBackup { uuid: uid(2) },
            ]
        );
    }

    #[test]
    fn backup_creation_orders_parents_before_children() {
        let policy = policy("1y 8w", "2006-01-10T00:00:00Z");
        let items = [
            item(2, "2005-12-12T00:00:00Z", 9, Presence::Local, None),
            item(1, "2005-12-05T00:00:00Z", 5, Presence::Local, None),
        ];
        let p = plan_for(&items, &policy, false);
        let creates: Vec<&Action> = p
            .actions
            .iter()
            .filter(|a| matches!(a, Action::CreateBackup { .. }))
            .collect();
        assert_eq!(
            creates,
            vec![
                &Action::CreateBackup { id: ItemId::Existing(uid(1)), send_parent: None },
                &Action::CreateBackup {
                    id: ItemId::Existing(uid(2)),
                    send_parent: Some(ItemId::Existing(uid(1))),
                },
            ]
        );
    }

    #[test]
    fn kept_snapshot_with_wrong_name_is_renamed_first() {
        let policy = policy("1d", "2006-01-01T12:00:00Z");
        let mut it = item(1, "2006-01-01T00:00:00Z", 10, Presence::Both, None);
        it.current_name = Some("data.NEW.1234".to_string());
        it.canonical_name = Some("data.ctim2006-01-01T00:00:00+00:00.ctid10".to_string());
        let items = [it];
        let p = plan_for(&items, &policy, false);
        assert_eq!(
            p.actions,
            vec![Action::RenameSnapshot {
                uuid: uid(1),
                from: "data.NEW.1234".to_string(),
                to: "data.ctim2006-01-01T00:00:00+00:00.ctid10".to_string(),
            }]
        );
    }

    #[test]
    fn validation_rejects_backup_before_its_parent() {
        let policy = policy("1y 8w", "2006-01-10T00:00:00Z");
        let items = [
            item(1, "2005-12-05T00:00:00Z", 5, Presence::Local, None),
            item(2, "2005-12-12T00:00:00Z", 9, Presence::Local, None),
        ];
        let resolution =
            resolve(ResolveInput { items: &items, policy: &policy, source_changed: false })
                .unwrap();
        let bad = Plan {
            actions: vec![
                Action::CreateBackup {
                    id: ItemId::Existing(uid(2)),
                    send_parent: Some(ItemId::Existing(uid(1))),
                },
                Action::CreateBackup { id: ItemId::Existing(uid(1)), send_parent: None },
            ],
        };
        let err = validate(&bad, &items, &resolution).unwrap_err();
        assert!(matches!(err, ScheduleError::PlannerAssertion(_)));
    }

    #[test]
    fn validation_rejects_a_plan_that_misses_the_keep_set() {
        let policy = policy("1d", "2006-01-01T12:00:00Z");
        let items = [item(1, "2006-01-01T00:00:00Z", 10, Presence::Local, None)];
        let resolution =
            resolve(ResolveInput { items: &items, policy: &policy, source_changed: false })
                .unwrap();
        let empty = Plan::default();
        let err = validate(&empty, &items, &resolution).unwrap_err();
        assert!(matches!(err, ScheduleError::PlannerAssertion(_)));
    }
}

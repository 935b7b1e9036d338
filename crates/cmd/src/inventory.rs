//! Builds the resolver's item set from the two inventories
//!
//! Local side: the snapshot directory filtered to read-only snapshots of
//! the configured source. Remote side: the decoded bucket listing for the
//! same source. Items merge by uuid; kernel-reported attributes win over
//! key-recovered ones when both sides are present.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use log::debug;
use remote::BackupObject;
use schedule::{Item, Presence};
use snapfs::{Filesystem, SubvolInfo};
use snapmeta::BackupMeta;
use uuid::Uuid;

pub struct SourceInventory {
    pub source_path: PathBuf,
    pub snapshots_dir: PathBuf,
    /// Base name for snapshot filenames and object keys: the source's
    /// directory name.
    pub base: String,
    pub source: SubvolInfo,
    /// Read-only snapshots of this source, as (filename, info).
    pub snapshots: Vec<(String, SubvolInfo)>,
    /// Whether the source has advanced past every existing snapshot.
    pub source_changed: bool,
}

pub async fn load_source_inventory(
    fs: &dyn Filesystem,
    source_path: &Path,
    snapshots_dir: &Path,
) -> anyhow::Result<SourceInventory> {
    use anyhow::Context;

    let source = fs
        .subvolume_info(source_path)
        .await
        .with_context(|| format!("source {} is not a subvolume", source_path.display()))?;

    let mut snapshots = Vec::new();
    for (name, info) in fs.iter_subvolumes(snapshots_dir).await? {
        if !info.read_only || info.parent_uuid != Some(source.uuid) {
            debug!("ignoring unrelated subvolume {name}");
            continue;
        }
        snapshots.push((name, info));
    }

    let source_changed = snapshots
        .iter()
        .map(|(_, info)| info.ctransid)
        .max()
        .is_none_or(|newest| source.ctransid > newest);

    let base = source_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "subvol".to_string());

    Ok(SourceInventory {
        source_path: source_path.to_path_buf(),
        snapshots_dir: snapshots_dir.to_path_buf(),
        base,
        source,
        snapshots,
        source_changed,
    })
}

/// The canonical filename for a snapshot: its metadata encoded with the
/// source's base name. Snapshot names carry a nil send-parent; the actual
/// send-parent is a property of the backup object, not the snapshot.
#[must_use]
pub fn canonical_snapshot_name(base: &str, info: &SubvolInfo, tz: Tz) -> String {
    let meta = BackupMeta {
        uuid: info.uuid,
        parent_uuid: info.parent_uuid.unwrap_or_else(Uuid::nil),
        send_parent: None,
        ctransid: info.ctransid,
        ctime: info.ctime.with_timezone(&tz).fixed_offset(),
    };
    snapmeta::encode(&meta, base)
}

/// Merge the two inventories into resolver items for one source.
#[must_use]
pub fn build_items(inv: &SourceInventory, objects: &[BackupObject], tz: Tz) -> Vec<Item> {
    let mut by_uuid: HashMap<Uuid, Item> = HashMap::new();

    for (name, info) in &inv.snapshots {
        // A decodable filename keeps whatever base its creator chose; only
        // the metadata tokens are canonicalized.
        let base = snapmeta::decode(name)
            .map(|(base, _)| base)
            .ok()
            .filter(|base| !base.is_empty())
            .unwrap_or_else(|| inv.base.clone());
        by_uuid.insert(
            info.uuid,
            Item {
                uuid: info.uuid,
                ctime: info.ctime,
                ctransid: info.ctransid,
                send_parent: None,
                presence: Presence::Local,
                current_name: Some(name.clone()),
                canonical_name: Some(canonical_snapshot_name(&base, info, tz)),
            },
        );
    }

    for object in objects {
        let meta = &object.meta;
        by_uuid
            .entry(meta.uuid)
            .and_modify(|item| {
                item.presence = Presence::Both;
                item.send_parent = meta.send_parent;
            })
            .or_insert_with(|| Item {
                uuid: meta.uuid,
                ctime: meta.ctime.with_timezone(&chrono::Utc),
                ctransid: meta.ctransid,
                send_parent: meta.send_parent,
                presence: Presence::Remote,
                current_name: None,
                canonical_name: None,
            });
    }

    let mut items: Vec<Item> = by_uuid.into_values().collect();
    items.sort_by_key(|i| (i.ctime, i.uuid));
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use snapfs::memory::MemFilesystem;

    fn t(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn subvol(n: u8, parent: Option<u8>, ctransid: u64, ctime: &str, read_only: bool) -> SubvolInfo {
        SubvolInfo {
            uuid: Uuid::from_u128(u128::from(n)),
            parent_uuid: parent.map(|p| Uuid::from_u128(u128::from(p))),
            ctransid,
            ctime: t(ctime),
            read_only,
        }
    }

    #[tokio::test]
    async fn listing_filters_to_read_only_snapshots_of_the_source() {
        let fs = MemFilesystem::new(t("2006-01-01T00:00:00Z"));
        fs.add_subvolume("/data", subvol(1, None, 30, "2005-01-01T00:00:00Z", false));
        fs.add_subvolume("/snaps/good", subvol(2, Some(1), 10, "2006-01-01T00:00:00Z", true));
        fs.add_subvolume("/snaps/other", subvol(3, Some(9), 11, "2006-01-01T01:00:00Z", true));
        fs.add_subvolume("/snaps/rw", subvol(4, Some(1), 12, "2006-01-01T02:00:00Z", false));

        let inv = load_source_inventory(&fs, Path::new("/data"), Path::new("/snaps"))
            .await
            .unwrap();
        assert_eq!(inv.base, "data");
        assert_eq!(inv.snapshots.len(), 1);
        assert_eq!(inv.snapshots[0].0, "good");
        // source ctransid 30 > newest snapshot ctransid 10
        assert!(inv.source_changed);
    }

    #[tokio::test]
    async fn unchanged_source_is_detected() {
        let fs = MemFilesystem::new(t("2006-01-01T00:00:00Z"));
        fs.add_subvolume("/data", subvol(1, None, 10, "2005-01-01T00:00:00Z", false));
        fs.add_subvolume("/snaps/a", subvol(2, Some(1), 10, "2006-01-01T00:00:00Z", true));
        let inv = load_source_inventory(&fs, Path::new("/data"), Path::new("/snaps"))
            .await
            .unwrap();
        assert!(!inv.source_changed);
    }

    #[test]
    fn canonical_name_round_trips_through_the_codec() {
        let info = subvol(2, Some(1), 42, "2006-01-02T15:04:05Z", true);
        let name = canonical_snapshot_name("data", &info, chrono_tz::Tz::UTC);
        let (base, meta) = snapmeta::decode(&name).unwrap();
        assert_eq!(base, "data");
        assert_eq!(meta.uuid, info.uuid);
        assert_eq!(meta.ctransid, 42);
        assert!(meta.is_full());
    }

    #[test]
    fn canonicalization_preserves_a_custom_base_name() {
        let info = subvol(2, Some(1), 42, "2006-01-02T15:04:05Z", true);
        // A decodable name with a stale ctransid token and a custom base.
        let stale = canonical_snapshot_name("custom", &subvol(2, Some(1), 7, "2006-01-02T15:04:05Z", true), chrono_tz::Tz::UTC);
        let inv = SourceInventory {
            source_path: "/data".into(),
            snapshots_dir: "/snaps".into(),
            base: "data".to_string(),
            source: subvol(1, None, 50, "2005-01-01T00:00:00Z", false),
            snapshots: vec![(stale.clone(), info)],
            source_changed: true,
        };
        let items = build_items(&inv, &[], chrono_tz::Tz::UTC);
        let canonical = items[0].canonical_name.clone().unwrap();
        assert_ne!(canonical, stale);
        assert!(canonical.starts_with("custom."));
        assert!(canonical.contains("ctid42"));
    }

    #[tokio::test]
    async fn items_merge_by_uuid() {
        let fs = MemFilesystem::new(t("2006-01-03T00:00:00Z"));
        fs.add_subvolume("/data", subvol(1, None, 30, "2005-01-01T00:00:00Z", false));
        fs.add_subvolume("/snaps/a", subvol(2, Some(1), 10, "2006-01-01T00:00:00Z", true));
        fs.add_subvolume("/snaps/b", subvol(3, Some(1), 20, "2006-01-02T00:00:00Z", true));
        let inv = load_source_inventory(&fs, Path::new("/data"), Path::new("/snaps"))
            .await
            .unwrap();

        let both = BackupObject {
            key: "a-key".to_string(),
            base: "data".to_string(),
            meta: BackupMeta {
                uuid: Uuid::from_u128(2),
                parent_uuid: Uuid::from_u128(1),
                send_parent: None,
                ctransid: 10,
                ctime: "2006-01-01T00:00:00+00:00".parse().unwrap(),
            },
            size: 100,
        };
        let remote_only = BackupObject {
            key: "gone-key".to_string(),
            base: "data".to_string(),
            meta: BackupMeta {
                uuid: Uuid::from_u128(9),
                parent_uuid: Uuid::from_u128(1),
                send_parent: Some(Uuid::from_u128(2)),
                ctransid: 5,
                ctime: "2005-12-01T00:00:00+00:00".parse().unwrap(),
            },
            size: 1,
        };

        let items = build_items(&inv, &[both, remote_only], chrono_tz::Tz::UTC);
        assert_eq!(items.len(), 3);
        let find = |n: u8| items.iter().find(|i| i.uuid == Uuid::from_u128(u128::from(n))).unwrap();
        assert_eq!(find(2).presence, Presence::Both);
        assert_eq!(find(3).presence, Presence::Local);
        assert_eq!(find(9).presence, Presence::Remote);
        assert_eq!(find(9).send_parent, Some(Uuid::from_u128(2)));
    }
}

//! Applies a validated plan against the filesystem and the object store
//!
//! Actions run in plan order. A failed action is recorded and the run
//! continues, except that actions depending on the failed one (a backup
//! whose snapshot or send-parent never materialized) are skipped. Run
//! level atomicity is out of scope: the next run re-resolves whatever
//! state this one leaves behind.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use log::info;
use object_store::ObjectStore;
use remote::{delete_keys, upload_stream, Pipeline, UploadParams};
use schedule::{Action, Item, ItemId, Plan};
use snapfs::{Filesystem, SubvolInfo};
use snapmeta::BackupMeta;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::inventory::{canonical_snapshot_name, SourceInventory};

/// Mutable state shared by all plans of one source (one per remote): the
/// freshly-created snapshot, the current on-disk names, and what has
/// already been deleted.
pub struct SourceState {
    pub created: Option<SubvolInfo>,
    names: HashMap<Uuid, String>,
    deleted: HashSet<Uuid>,
}

impl SourceState {
    #[must_use]
    pub fn new(inv: &SourceInventory) -> Self {
        SourceState {
            created: None,
            names: inv
                .snapshots
                .iter()
                .map(|(name, info)| (info.uuid, name.clone()))
                .collect(),
            deleted: HashSet::new(),
        }
    }
}

/// Everything needed to apply one (source, remote) plan.
pub struct PlanContext<'a> {
    pub fs: &'a dyn Filesystem,
    pub store: &'a Arc<dyn ObjectStore>,
    pub remote_id: &'a str,
    pub tz: Tz,
    pub inv: &'a SourceInventory,
    pub items: &'a [Item],
    pub plan: &'a Plan,
    pub pipe_through: &'a [Vec<String>],
    pub upload: &'a UploadParams,
    /// Object key per uuid, from the remote listing.
    pub remote_keys: &'a HashMap<Uuid, String>,
    /// Snapshots kept by ANY remote's resolution for this source; local
    /// deletions are suppressed for these.
    pub keep_local: &'a HashSet<Uuid>,
    pub cancel: &'a CancellationToken,
}

#[derive(Debug, Default)]
pub struct ExecReport {
    pub failures: Vec<String>,
}

impl ExecReport {
    #[must_use]
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }
}

pub async fn execute_plan(ctx: &PlanContext<'_>, state: &mut SourceState) -> ExecReport {
    let mut report = ExecReport::default();
    let mut failed: HashSet<ItemId> = HashSet::new();
    let mut backups_deleted = false;

    for action in &ctx.plan.actions {
        if ctx.cancel.is_cancelled() {
            report.failures.push("run cancelled".to_string());
            break;
        }
        match action {
            Action::RenameSnapshot { uuid, to, .. } => {
                if let Err(e) = rename_snapshot(ctx, state, *uuid, to).await {
                    report.failures.push(format!("rename of {uuid}: {e:#}"));
                }
            }
            Action::CreateSnapshot => {
                if state.created.is_some() {
                    continue;
                }
                match create_fresh_snapshot(ctx, state).await {
                    Ok(info) => state.created = Some(info),
                    Err(e) => {
                        failed.insert(ItemId::Proposed);
                        report.failures.push(format!("snapshot creation: {e:#}"));
                    }
                }
            }
            Action::CreateBackup { id, send_parent } => {
                let dependency_failed = failed.contains(id)
                    || send_parent.is_some_and(|p| failed.contains(&p));
                if dependency_failed {
                    failed.insert(*id);
                    report.failures.push(format!("backup of {id} skipped: dependency failed"));
                    continue;
                }
                if let Err(e) = create_backup(ctx, state, *id, *send_parent).await {
                    failed.insert(*id);
                    report.failures.push(format!("backup of {id}: {e:#}"));
                }
            }
            Action::DeleteBackup { .. } => {
                if backups_deleted {
                    continue;
                }
                backups_deleted = true;
                delete_expired_backups(ctx, &mut report).await;
            }
            Action::DeleteSnapshot { uuid } => {
                if ctx.keep_local.contains(uuid) || !state.deleted.insert(*uuid) {
                    continue;
                }
                if let Err(e) = delete_snapshot(ctx, state, *uuid).await {
                    state.deleted.remove(uuid);
                    report.failures.push(format!("deletion of snapshot {uuid}: {e:#}"));
                }
            }
        }
    }
    report
}

async fn rename_snapshot(
    ctx: &PlanContext<'_>,
    state: &mut SourceState,
    uuid: Uuid,
    to: &str,
) -> anyhow::Result<()> {
    let current = state
        .names
        .get(&uuid)
        .ok_or_else(|| anyhow!("snapshot is not in the directory"))?;
    if current == to {
        return Ok(());
    }
    let dir = &ctx.inv.snapshots_dir;
    ctx.fs.rename(&dir.join(current), &dir.join(to)).await?;
    state.names.insert(uuid, to.to_string());
    Ok(())
}

async fn create_fresh_snapshot(
    ctx: &PlanContext<'_>,
    state: &mut SourceState,
) -> anyhow::Result<SubvolInfo> {
    let temp_name = format!("{}.NEW.{}", ctx.inv.base, std::process::id());
    let temp_path = ctx.inv.snapshots_dir.join(&temp_name);
    let info = ctx
        .fs
        .create_snapshot(&ctx.inv.source_path, &temp_path)
        .await
        .context("snapshot ioctl failed")?;
    let canonical = canonical_snapshot_name(&ctx.inv.base, &info, ctx.tz);
    ctx.fs
        .rename(&temp_path, &ctx.inv.snapshots_dir.join(&canonical))
        .await
        .context("could not give the new snapshot its canonical name")?;
    state.names.insert(info.uuid, canonical);
    Ok(info)
}

struct SnapshotFacts {
    uuid: Uuid,
    ctransid: u64,
    ctime: DateTime<Utc>,
}

fn facts_for(ctx: &PlanContext<'_>, state: &SourceState, id: ItemId) -> anyhow::Result<SnapshotFacts> {
    match id {
        ItemId::Proposed => {
            let info = state
                .created
                .as_ref()
                .ok_or_else(|| anyhow!("the fresh snapshot was never created"))?;
            Ok(SnapshotFacts { uuid: info.uuid, ctransid: info.ctransid, ctime: info.ctime })
        }
        ItemId::Existing(uuid) => {
            let item = ctx
                .items
                .iter()
                .find(|i| i.uuid == uuid)
                .ok_or_else(|| anyhow!("unknown item {uuid}"))?;
            Ok(SnapshotFacts { uuid, ctransid: item.ctransid, ctime: item.ctime })
        }
    }
}

fn snapshot_path(ctx: &PlanContext<'_>, state: &SourceState, uuid: Uuid) -> anyhow::Result<PathBuf> {
    let name = state
        .names
        .get(&uuid)
        .ok_or_else(|| anyhow!("snapshot {uuid} is not in the directory"))?;
    Ok(ctx.inv.snapshots_dir.join(name))
}

async fn create_backup(
    ctx: &PlanContext<'_>,
    state: &SourceState,
    id: ItemId,
    send_parent: Option<ItemId>,
) -> anyhow::Result<()> {
    let facts = facts_for(ctx, state, id)?;
    let parent_uuid = match send_parent {
        None => None,
        Some(parent_id) => Some(facts_for(ctx, state, parent_id)?.uuid),
    };

    let meta = BackupMeta {
        uuid: facts.uuid,
        parent_uuid: ctx.inv.source.uuid,
        send_parent: parent_uuid,
        ctransid: facts.ctransid,
        ctime: facts.ctime.with_timezone(&ctx.tz).fixed_offset(),
    };
    let key = snapmeta::encode(&meta, &ctx.inv.base);
    if key.len() > snapmeta::MAX_KEY_LEN {
        bail!("object key would exceed {} bytes: {key}", snapmeta::MAX_KEY_LEN);
    }

    let snap_path = snapshot_path(ctx, state, facts.uuid)?;
    let parent_path = match parent_uuid {
        None => None,
        Some(uuid) => Some(snapshot_path(ctx, state, uuid)?),
    };
    info!(
        "creating backup of {} ({}) on {}",
        snap_path.display(),
        match &parent_path {
            Some(p) => format!("differential from {}", p.display()),
            None => "full".to_string(),
        },
        ctx.remote_id,
    );

    let mut commands = vec![ctx.fs.send_args(&snap_path, parent_path.as_deref())];
    commands.extend(ctx.pipe_through.iter().cloned());

    let mut pipeline = Pipeline::spawn(&commands)?;
    let tail = pipeline
        .take_stdout()
        .ok_or_else(|| anyhow!("pipeline produced no output handle"))?;

    let upload = tokio::select! {
        result = upload_stream(ctx.store, &key, tail, ctx.upload) => Some(result),
        () = ctx.cancel.cancelled() => None,
    };
    match upload {
        None => {
            pipeline.terminate().await;
            let _ = pipeline.wait().await;
            let _ = delete_keys(ctx.store, std::slice::from_ref(&key)).await;
            bail!("cancelled during upload");
        }
        Some(Err(e)) => {
            // Dropping the read side unblocks the children; reap them and
            // surface the upload error.
            let _ = pipeline.wait().await;
            Err(e.into())
        }
        Some(Ok(summary)) => match pipeline.wait().await {
            Ok(()) => {
                info!("uploaded {key} ({} bytes)", summary.bytes);
                Ok(())
            }
            Err(e) => {
                // Assume the object is a truncated stream.
                let _ = delete_keys(ctx.store, std::slice::from_ref(&key)).await;
                Err(e.into())
            }
        },
    }
}

async fn delete_expired_backups(ctx: &PlanContext<'_>, report: &mut ExecReport) {
    let mut keys = Vec::new();
    for action in &ctx.plan.actions {
        let Action::DeleteBackup { uuid } = action else { continue };
        match ctx.remote_keys.get(uuid) {
            Some(key) => keys.push(key.clone()),
            None => report
                .failures
                .push(format!("no object key known for expired backup {uuid}")),
        }
    }
    if let Err(e) = delete_keys(ctx.store, &keys).await {
        report.failures.push(format!("backup deletion on {}: {e}", ctx.remote_id));
    }
}

async fn delete_snapshot(
    ctx: &PlanContext<'_>,
    state: &mut SourceState,
    uuid: Uuid,
) -> anyhow::Result<()> {
    let path = snapshot_path(ctx, state, uuid)?;
    ctx.fs.delete_subvolume(&path).await?;
    state.names.remove(&uuid);
    Ok(())
}

//! The `update` command: one-time reconciliation of snapshots and backups
//!
//! Assess, preview, confirm, execute. Errors scoped to one action do not
//! abort the run; errors detected before execution do, so a bad plan never
//! half-applies.

use std::collections::{HashMap, HashSet};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use log::error;
use object_store::ObjectStore;
use remote::{BackupObject, UploadParams};
use schedule::{resolve, Item, ItemId, Plan, Policy, ResolveInput, Resolution, ScheduleError};
use snapfs::{BtrfsCli, DirLock, Filesystem};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{self, Config, UploadConfig};
use crate::executor::{execute_plan, ExecReport, PlanContext, SourceState};
use crate::{exitcode, inventory, preview};

#[derive(Debug, Clone)]
pub struct UpdateArgs {
    pub config_file: PathBuf,
    pub force: bool,
    pub pretend: bool,
    pub spill_dir: Option<PathBuf>,
}

/// How to proceed once the plan has been shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirm {
    /// Execute without asking.
    Force,
    /// Show the plan and stop.
    Pretend,
    /// Ask on the terminal.
    Interactive,
}

#[derive(Debug, Default)]
pub struct Outcome {
    pub planned_actions: usize,
    pub executed: bool,
    pub failures: Vec<String>,
}

/// Entry point for `snapship update`. Returns the process exit code.
pub async fn run(args: UpdateArgs) -> i32 {
    let config = match config::load(&args.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            eprintln!("configuration error: {e:#}");
            return exitcode::CONFIG;
        }
    };

    if !args.force && !args.pretend && !std::io::stdout().is_terminal() {
        eprintln!("to run in unattended mode, use --force");
        return exitcode::PRECONDITION;
    }

    // One advisory lock per snapshot directory for the life of the run.
    let mut locks = Vec::new();
    let mut locked = HashSet::new();
    for source in &config.sources {
        if !locked.insert(source.snapshots.clone()) {
            continue;
        }
        match DirLock::acquire(&source.snapshots) {
            Ok(lock) => locks.push(lock),
            Err(e) => {
                eprintln!("{e}");
                return exitcode::PRECONDITION;
            }
        }
    }

    let mut stores: HashMap<String, Arc<dyn ObjectStore>> = HashMap::new();
    for remote_cfg in &config.remotes {
        match remote::build_object_store(&remote_cfg.s3) {
            Ok(store) => {
                stores.insert(remote_cfg.id.clone(), store);
            }
            Err(e) => {
                eprintln!("configuration error: {e}");
                return exitcode::CONFIG;
            }
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("cancelling; finishing the current action");
                cancel.cancel();
            }
        });
    }

    let confirm = if args.pretend {
        Confirm::Pretend
    } else if args.force {
        Confirm::Force
    } else {
        Confirm::Interactive
    };
    let upload = UploadParams { spill_dir: args.spill_dir.clone(), ..UploadParams::default() };

    let fs = BtrfsCli::default();
    match update(&config, &fs, &stores, Utc::now(), confirm, &upload, &cancel).await {
        Ok(outcome) if outcome.failures.is_empty() => exitcode::OK,
        Ok(outcome) => {
            for failure in &outcome.failures {
                eprintln!("failed: {failure}");
            }
            exitcode::PARTIAL_FAILURE
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            match e.downcast_ref::<ScheduleError>() {
                Some(ScheduleError::InvalidParams(_)) => exitcode::CONFIG,
                Some(_) => exitcode::INTERNAL,
                None => exitcode::PARTIAL_FAILURE,
            }
        }
    }
}

struct PlannedPair<'a> {
    upload: &'a UploadConfig,
    items: Vec<Item>,
    resolution: Resolution,
    plan: Plan,
    remote_keys: HashMap<Uuid, String>,
}

/// Assess every (source, remote) pair, show the combined plan, and apply
/// it. Collaborators are injected so tests can run the whole flow against
/// in-memory doubles.
pub async fn update(
    config: &Config,
    fs: &dyn Filesystem,
    stores: &HashMap<String, Arc<dyn ObjectStore>>,
    now: DateTime<Utc>,
    confirm: Confirm,
    upload: &UploadParams,
    cancel: &CancellationToken,
) -> anyhow::Result<Outcome> {
    let tz = config.timezone()?;

    // One listing per bucket, shared by every source uploading to it.
    let mut listings: HashMap<String, Vec<BackupObject>> = HashMap::new();

    let mut source_runs = Vec::new();
    for source_cfg in &config.sources {
        let inv = inventory::load_source_inventory(fs, &source_cfg.path, &source_cfg.snapshots)
            .await?;

        let mut pairs = Vec::new();
        for upload_cfg in &source_cfg.upload_to_remotes {
            let store = stores
                .get(&upload_cfg.id)
                .ok_or_else(|| anyhow!("no object store for remote {}", upload_cfg.id))?;
            if !listings.contains_key(&upload_cfg.id) {
                let listing = remote::list_backups(store)
                    .await
                    .with_context(|| format!("listing bucket of remote {}", upload_cfg.id))?;
                listings.insert(upload_cfg.id.clone(), listing);
            }
            let objects: Vec<BackupObject> = listings[&upload_cfg.id]
                .iter()
                .filter(|o| o.meta.parent_uuid == inv.source.uuid)
                .cloned()
                .collect();

            let policy = Policy::new(schedule::Params::parse(&upload_cfg.preserve)?, now, tz)?;
            let items = inventory::build_items(&inv, &objects, tz);
            let resolution = resolve(ResolveInput {
                items: &items,
                policy: &policy,
                source_changed: inv.source_changed,
            })?;
            let plan = schedule::plan(&items, &resolution)?;
            let remote_keys =
                objects.iter().map(|o| (o.meta.uuid, o.key.clone())).collect();
            pairs.push(PlannedPair {
                upload: upload_cfg,
                items,
                resolution,
                plan,
                remote_keys,
            });
        }
        source_runs.push((inv, pairs));
    }

    let planned_actions: usize =
        source_runs.iter().flat_map(|(_, pairs)| pairs).map(|p| p.plan.actions.len()).sum();

    for (inv, pairs) in &source_runs {
        for pair in pairs {
            print!(
                "{}",
                preview::render(
                    inv,
                    &pair.upload.id,
                    &pair.upload.preserve,
                    &pair.plan,
                    &pair.items,
                    &pair.remote_keys,
                )
            );
        }
    }

    if planned_actions == 0 {
        println!("nothing to be done!");
        return Ok(Outcome { planned_actions, executed: false, failures: vec![] });
    }
    match confirm {
        Confirm::Pretend => {
            return Ok(Outcome { planned_actions, executed: false, failures: vec![] });
        }
        Confirm::Interactive => {
            if !ask_to_continue()? {
                return Ok(Outcome { planned_actions, executed: false, failures: vec![] });
            }
        }
        Confirm::Force => {}
    }

    let mut failures = Vec::new();
    'sources: for (inv, pairs) in &source_runs {
        let keep_local: HashSet<Uuid> = pairs
            .iter()
            .flat_map(|p| p.resolution.keep.keys())
            .filter_map(|id| match id {
                ItemId::Existing(uuid) => Some(*uuid),
                ItemId::Proposed => None,
            })
            .collect();

        let mut state = SourceState::new(inv);
        for pair in pairs {
            let store = &stores[&pair.upload.id];
            let ctx = PlanContext {
                fs,
                store,
                remote_id: &pair.upload.id,
                tz,
                inv,
                items: &pair.items,
                plan: &pair.plan,
                pipe_through: &pair.upload.pipe_through,
                upload,
                remote_keys: &pair.remote_keys,
                keep_local: &keep_local,
                cancel,
            };
            let ExecReport { failures: plan_failures } = execute_plan(&ctx, &mut state).await;
            failures.extend(plan_failures.into_iter().map(|f| {
                format!("{} -> {}: {f}", inv.source_path.display(), pair.upload.id)
            }));
            if cancel.is_cancelled() {
                break 'sources;
            }
        }
    }

    Ok(Outcome { planned_actions, executed: true, failures })
}

fn ask_to_continue() -> anyhow::Result<bool> {
    use std::io::Write;

    print!("continue? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

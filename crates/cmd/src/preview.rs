//! Plain-text rendering of a plan for the operator
//!
//! One block per (source, remote) pair, listing the actions in the order
//! they will run. Kept deliberately terminal-agnostic; `--pretend` and the
//! interactive confirmation both print this.

use std::collections::HashMap;

use schedule::{Action, Item, ItemId, Plan};
use uuid::Uuid;

use crate::inventory::SourceInventory;

pub fn render(
    inv: &SourceInventory,
    remote_id: &str,
    preserve: &str,
    plan: &Plan,
    items: &[Item],
    remote_keys: &HashMap<Uuid, String>,
) -> String {
    let mut out = format!(
        "{} -> {} (preserve {})\n",
        inv.source_path.display(),
        remote_id,
        preserve
    );
    if plan.is_empty() {
        out.push_str("  nothing to be done\n");
        return out;
    }

    let name_of = |uuid: &Uuid| {
        items
            .iter()
            .find(|i| i.uuid == *uuid)
            .and_then(|i| i.current_name.clone())
            .unwrap_or_else(|| uuid.to_string())
    };

    for action in &plan.actions {
        let line = match action {
            Action::RenameSnapshot { from, to, .. } => format!("rename: {from} -> {to}"),
            Action::CreateSnapshot => {
                format!("snapshot: create fresh snapshot of {}", inv.source_path.display())
            }
            Action::CreateBackup { id, send_parent } => {
                let what = match id {
                    ItemId::Proposed => "the fresh snapshot".to_string(),
                    ItemId::Existing(uuid) => name_of(uuid),
                };
                match send_parent {
                    None => format!("upload: {what} (full)"),
                    Some(ItemId::Proposed) => {
                        format!("upload: {what} (differential from the fresh snapshot)")
                    }
                    Some(ItemId::Existing(parent)) => {
                        format!("upload: {what} (differential from {})", name_of(parent))
                    }
                }
            }
            Action::DeleteBackup { uuid } => format!(
                "delete backup: {}",
                remote_keys.get(uuid).cloned().unwrap_or_else(|| uuid.to_string())
            ),
            Action::DeleteSnapshot { uuid } => format!("delete snapshot: {}", name_of(uuid)),
        };
        out.push_str("  ");
        out.push_str(&line);
        out.push('\n');
    }
    out
}

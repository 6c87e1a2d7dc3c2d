//! Plan command implementation: a reconciler dry run.

use super::{open_mirror, scan_journal};
use mdir_core::{FileRecord, MaterializedView, SyncMap};
use mdir_sync_engine::reconcile::{plan, Plan};
use mdir_sync_engine::FolderTree;
use std::path::Path;

/// Runs the plan command over every durable folder, or only `folder`.
pub fn run(
    path: &Path,
    root_dir_id: &str,
    folder: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (mirror, tree) = open_mirror(path, root_dir_id)?;
    let wanted = folder.map(FolderTree::normalize).transpose()?;

    let mut pending = 0;
    for (tree_path, dir_id) in tree.folders() {
        if wanted.as_ref().is_some_and(|wanted| *wanted != tree_path) {
            continue;
        }
        let label = if tree_path.is_empty() { "/" } else { tree_path.as_str() };
        if dir_id.is_transient() {
            println!("{label}: awaiting confirmation, not reconciled yet");
            continue;
        }
        let folder_mirror = mirror.folder(&dir_id);
        if !folder_mirror.exists() {
            continue;
        }

        let remote = if folder_mirror.journal_path().is_file() {
            remote_files(&folder_mirror.journal_path())?
        } else {
            Vec::new()
        };
        let map = SyncMap::load(&folder_mirror.sync_map_path())?;
        let folder_plan = plan(&folder_mirror, &map, &remote)?;
        pending += folder_plan.entries.len();
        print_plan(label, &folder_plan);
    }

    if let Some(wanted) = wanted {
        if tree.resolve(&wanted).is_none() {
            return Err(format!("folder {wanted:?} is not linked").into());
        }
    }
    println!();
    println!("{pending} pending step(s)");
    Ok(())
}

fn remote_files(journal: &Path) -> Result<Vec<FileRecord>, Box<dyn std::error::Error>> {
    let scan = scan_journal(journal)?;
    if let Some(e) = scan.error {
        return Err(format!("{}: {e}", scan.path.display()).into());
    }
    let mut view = MaterializedView::new();
    for (_, patch) in &scan.records {
        view.apply(patch);
    }
    Ok(view.files().collect())
}

fn print_plan(label: &str, plan: &Plan) {
    if plan.is_empty() && plan.busy.is_empty() {
        println!("{label}: in sync");
        return;
    }
    println!("{label}:");
    for entry in &plan.entries {
        println!("  {:<16} {}", format!("{:?}", entry.decision), entry.name);
    }
    for name in &plan.busy {
        println!("  {:<16} {name}", "Busy");
    }
}

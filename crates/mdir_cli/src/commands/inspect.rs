//! Inspect command implementation.

use super::{open_mirror, scan_journal};
use mdir_core::SyncMap;
use serde::Serialize;
use std::path::Path;

/// Mirror inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Mirror root.
    pub path: String,
    /// Every linked folder.
    pub folders: Vec<FolderInfo>,
}

/// Statistics for one mirrored folder.
#[derive(Debug, Serialize)]
pub struct FolderInfo {
    /// Tree path; empty for the top folder.
    pub path: String,
    /// Folder identifier.
    pub dir_id: String,
    /// Not yet confirmed by the server.
    pub transient: bool,
    /// Version after the last journal record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_version: Option<i64>,
    /// Number of journal records.
    pub journal_records: usize,
    /// Version recorded in `.version`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_version: Option<i64>,
    /// Staged PUTs waiting for an answer.
    pub staged_puts: usize,
    /// Staged removals waiting for an answer.
    pub staged_removals: usize,
    /// User files in the mirror directory.
    pub files: usize,
    /// Entries in the sync map.
    pub sync_map_entries: usize,
    /// Why the journal could not be read.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
}

/// Runs the inspect command.
pub fn run(path: &Path, root_dir_id: &str, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (mirror, tree) = open_mirror(path, root_dir_id)?;

    let mut folders = Vec::new();
    for (tree_path, dir_id) in tree.folders() {
        let folder = mirror.folder(&dir_id);
        let mut info = FolderInfo {
            path: tree_path,
            dir_id: dir_id.to_string(),
            transient: dir_id.is_transient(),
            journal_version: None,
            journal_records: 0,
            recorded_version: folder.load_version()?,
            staged_puts: 0,
            staged_removals: 0,
            files: 0,
            sync_map_entries: 0,
            problem: None,
        };
        if !folder.exists() {
            info.problem = Some("not mirrored".to_string());
            folders.push(info);
            continue;
        }
        info.staged_puts = folder.staged_puts()?.len();
        info.staged_removals = folder.staged_removals()?.len();
        info.files = folder.user_files()?.len();
        info.sync_map_entries = SyncMap::load(&folder.sync_map_path())?.len();
        if folder.journal_path().is_file() {
            match scan_journal(&folder.journal_path()) {
                Ok(scan) => {
                    info.journal_version = Some(scan.last_version());
                    info.journal_records = scan.records.len();
                    info.problem = scan.error.map(|e| e.to_string());
                }
                Err(e) => info.problem = Some(e.to_string()),
            }
        }
        folders.push(info);
    }

    let result = InspectResult {
        path: path.display().to_string(),
        folders,
    };
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result)?),
        _ => print_text_output(&result, tree.pending().count()),
    }
    Ok(())
}

fn print_text_output(result: &InspectResult, pending: usize) {
    println!("Mirror: {}", result.path);
    println!("Folders: {} ({pending} awaiting confirmation)", result.folders.len());
    println!();
    for folder in &result.folders {
        let label = if folder.path.is_empty() { "/" } else { folder.path.as_str() };
        let marker = if folder.transient { " (transient)" } else { "" };
        println!("{label} -> {}{marker}", folder.dir_id);
        if let Some(version) = folder.journal_version {
            println!("  Journal:       v{version}, {} record(s)", folder.journal_records);
        }
        if let Some(version) = folder.recorded_version {
            println!("  Recorded:      v{version}");
        }
        println!("  Files:         {}", folder.files);
        println!("  Sync map:      {}", folder.sync_map_entries);
        if folder.staged_puts + folder.staged_removals > 0 {
            println!(
                "  Staged:        {} put(s), {} removal(s)",
                folder.staged_puts, folder.staged_removals
            );
        }
        if let Some(problem) = &folder.problem {
            println!("  Problem:       {problem}");
        }
    }
}

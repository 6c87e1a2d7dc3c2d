//! Content-addressed reconciliation of a folder mirror.
//!
//! Per file name three digests are compared: `L` (the local file), `M` (the
//! sync map, i.e. what both sides agreed on last time) and `R` (the newest
//! live file record in the folder journal).
//!
//! | L      | M      | R          | decision        |
//! |--------|--------|------------|-----------------|
//! | = M    | = R    | = M        | in sync         |
//! | = M    | set    | ≠ M        | fetch           |
//! | = M    | set    | none       | delete local    |
//! | ≠ M    | set    | = M        | upload          |
//! | ≠ M    | set    | = L        | adopt           |
//! | ≠ M    | set    | ≠ L, ≠ M   | conflict        |
//! | ≠ M    | set    | none       | conflict        |
//! | set    | none   | none       | upload          |
//! | set    | none   | = L        | adopt           |
//! | set    | none   | ≠ L        | conflict        |
//! | none   | set    | = M        | request removal |
//! | none   | set    | ≠ M        | conflict        |
//! | none   | set    | none       | forget          |
//! | none   | none   | set        | fetch           |
//!
//! A conflict always moves the local file aside under a dotted backup name
//! before the remote version (if any) is fetched, so nothing is lost.

use crate::content::ContentStore;
use crate::error::{SyncError, SyncResult};
use mdir_codec::{DocType, Header};
use mdir_core::{
    backup_name, digest_file, Digest, FileRecord, FolderMirror, StagedPut, SyncMap,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// What to do with one file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Nothing changed anywhere.
    InSync,
    /// Local and remote agree; only the sync map is behind.
    Adopt,
    /// Remote wins: bring the remote body into place.
    Fetch,
    /// Local wins: upload and add a file document.
    Upload,
    /// The remote file was removed: delete the local copy.
    DeleteLocal,
    /// The local file was deleted: remove the remote document.
    RequestRemoval,
    /// Gone on both sides: drop the map entry.
    Forget,
    /// Both sides changed: back up local, then remote wins.
    Conflict,
}

/// Decides the fate of one file name.
#[must_use]
pub fn decide(local: Option<&Digest>, map: Option<&Digest>, remote: Option<&Digest>) -> Decision {
    match (local, map, remote) {
        (None, None, None) => Decision::InSync,
        (None, None, Some(_)) => Decision::Fetch,
        (None, Some(_), None) => Decision::Forget,
        (None, Some(m), Some(r)) if r == m => Decision::RequestRemoval,
        (None, Some(_), Some(_)) => Decision::Conflict,
        (Some(_), None, None) => Decision::Upload,
        (Some(l), None, Some(r)) if l == r => Decision::Adopt,
        (Some(_), None, Some(_)) => Decision::Conflict,
        (Some(l), Some(m), None) if l == m => Decision::DeleteLocal,
        (Some(_), Some(_), None) => Decision::Conflict,
        (Some(l), Some(m), Some(r)) => {
            if l == m && r == m {
                Decision::InSync
            } else if l == m {
                Decision::Fetch
            } else if r == m {
                Decision::Upload
            } else if l == r {
                Decision::Adopt
            } else {
                Decision::Conflict
            }
        }
    }
}

/// One planned step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    /// File name.
    pub name: String,
    /// What to do.
    pub decision: Decision,
    /// Digest of the local file.
    pub local: Option<Digest>,
    /// Newest live remote record.
    pub remote: Option<FileRecord>,
}

/// Reconciliation plan for one folder.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    /// Steps, sorted by name. Names already in sync are omitted.
    pub entries: Vec<PlanEntry>,
    /// Names skipped because an upload or removal is still in flight.
    pub busy: Vec<String>,
}

impl Plan {
    /// Returns true if nothing needs doing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Names with a staged PUT or a staged removal that has not been answered.
///
/// Deciding on those before the server applies the change would read a
/// half-applied state as a remote edit.
pub fn busy_names(mirror: &FolderMirror, remote: &[FileRecord]) -> SyncResult<HashSet<String>> {
    let mut busy = HashSet::new();
    for StagedPut { header, .. } in mirror.staged_puts()? {
        if header.doc_type() == DocType::File {
            if let Some(name) = header.name() {
                busy.insert(name.to_string());
            }
        }
    }
    let removing: HashSet<_> = mirror
        .staged_removals()?
        .into_iter()
        .map(|removal| removal.version)
        .collect();
    for record in remote {
        if removing.contains(&record.version) {
            busy.insert(record.name.clone());
        }
    }
    Ok(busy)
}

/// Builds the plan for a mirror from its files, its sync map and the live
/// remote file records.
pub fn plan(mirror: &FolderMirror, map: &SyncMap, remote: &[FileRecord]) -> SyncResult<Plan> {
    let busy = busy_names(mirror, remote)?;

    let mut newest: HashMap<&str, &FileRecord> = HashMap::new();
    for record in remote {
        let slot = newest.entry(record.name.as_str()).or_insert(record);
        if record.version > slot.version {
            *slot = record;
        }
    }

    let local_names = mirror.user_files()?;
    let mut names: BTreeSet<String> = local_names.iter().cloned().collect();
    names.extend(map.names().map(str::to_string));
    names.extend(newest.keys().map(|name| (*name).to_string()));

    let mut result = Plan::default();
    for name in names {
        if busy.contains(&name) {
            result.busy.push(name);
            continue;
        }
        // remote names that cannot be mirrored are left in the journal
        let Ok(path) = mirror.user_path(&name) else {
            warn!(name = %name, "skipping unusable file name");
            continue;
        };
        let local = if path.is_file() {
            Some(digest_file(&path)?)
        } else {
            None
        };
        let remote = newest.get(name.as_str()).map(|record| (*record).clone());
        let remote_digest = remote.as_ref().map(|record| Digest::from_hex(&record.digest));
        let decision = decide(local.as_ref(), map.get(&name), remote_digest.as_ref());
        if decision != Decision::InSync {
            result.entries.push(PlanEntry {
                name,
                decision,
                local,
                remote,
            });
        }
    }
    Ok(result)
}

/// Counters of one reconciliation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Remote bodies brought into place.
    pub fetched: usize,
    /// Local files staged for upload.
    pub uploaded: usize,
    /// Uploads that reused an existing resource.
    pub deduplicated: usize,
    /// Local files deleted after a remote removal.
    pub deleted: usize,
    /// Remote removals staged.
    pub removals: usize,
    /// Conflicts (local file backed up).
    pub conflicts: usize,
    /// Steps that failed; retried on the next pass.
    pub errors: usize,
}

/// Applies plans to one folder mirror.
pub struct Reconciler<'a> {
    mirror: &'a FolderMirror,
    cache_dir: &'a Path,
    content: &'a dyn ContentStore,
    known: &'a HashMap<Digest, String>,
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler. `known` maps digests to resource references
    /// already present on the server, for upload deduplication.
    pub fn new(
        mirror: &'a FolderMirror,
        cache_dir: &'a Path,
        content: &'a dyn ContentStore,
        known: &'a HashMap<Digest, String>,
    ) -> Self {
        Self {
            mirror,
            cache_dir,
            content,
            known,
        }
    }

    /// Executes `plan`, updating `map`. A failing step is logged and
    /// skipped; the rest of the plan still runs.
    pub fn execute(&self, plan: &Plan, map: &mut SyncMap, remote: &[FileRecord]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        for entry in &plan.entries {
            if let Err(e) = self.apply(entry, map, remote, &mut report) {
                error!(
                    name = %entry.name,
                    decision = ?entry.decision,
                    mirror = %self.mirror.path().display(),
                    error = %e,
                    "reconciliation step failed"
                );
                report.errors += 1;
            }
        }
        report
    }

    fn apply(
        &self,
        entry: &PlanEntry,
        map: &mut SyncMap,
        remote: &[FileRecord],
        report: &mut ReconcileReport,
    ) -> SyncResult<()> {
        let name = entry.name.as_str();
        match entry.decision {
            Decision::InSync => {}
            Decision::Adopt => {
                if let Some(local) = &entry.local {
                    map.insert(name, local.clone());
                }
            }
            Decision::Fetch => {
                self.fetch(entry)?;
                report.fetched += 1;
                if let Some(record) = &entry.remote {
                    map.insert(name, Digest::from_hex(&record.digest));
                }
            }
            Decision::Upload => {
                let local = entry
                    .local
                    .clone()
                    .ok_or_else(|| SyncError::invalid_path(name, "no local file to upload"))?;
                let resource = match self.known.get(&local) {
                    Some(resource) => {
                        report.deduplicated += 1;
                        resource.clone()
                    }
                    None => self.content.upload(&self.mirror.user_path(name)?)?,
                };
                self.mirror
                    .stage_put(&Header::file(name, local.as_str(), resource))?;
                for record in remote.iter().filter(|record| record.name == name) {
                    self.mirror.stage_removal(record.version)?;
                }
                debug!(name, digest = %local, "upload staged");
                report.uploaded += 1;
                map.insert(name, local);
            }
            Decision::DeleteLocal => {
                fs::remove_file(self.mirror.user_path(name)?)?;
                info!(name, "removed locally after remote removal");
                report.deleted += 1;
                map.remove(name);
            }
            Decision::RequestRemoval => {
                for record in remote.iter().filter(|record| record.name == name) {
                    self.mirror.stage_removal(record.version)?;
                    report.removals += 1;
                }
                map.remove(name);
            }
            Decision::Forget => {
                map.remove(name);
            }
            Decision::Conflict => {
                report.conflicts += 1;
                let path = self.mirror.user_path(name)?;
                if path.is_file() {
                    let backup = self.mirror.path().join(backup_name(name));
                    fs::rename(&path, &backup)?;
                    warn!(name, backup = %backup.display(), "conflict, local copy kept aside");
                } else {
                    warn!(name, "conflict, local file was deleted while remote changed");
                }
                match &entry.remote {
                    Some(record) => {
                        self.fetch(entry)?;
                        report.fetched += 1;
                        map.insert(name, Digest::from_hex(&record.digest));
                    }
                    None => {
                        map.remove(name);
                    }
                }
            }
        }
        Ok(())
    }

    /// Brings the remote body into place through the shared cache.
    fn fetch(&self, entry: &PlanEntry) -> SyncResult<()> {
        let record = entry
            .remote
            .as_ref()
            .ok_or_else(|| SyncError::invalid_path(&entry.name, "no remote record to fetch"))?;
        let cached = self.cached_body(record)?;
        let target = self.mirror.user_path(&entry.name)?;
        if target.exists() {
            fs::remove_file(&target)?;
        }
        if fs::hard_link(&cached, &target).is_err() {
            // cache on another filesystem
            fs::copy(&cached, &target)?;
        }
        debug!(name = %entry.name, version = record.version, "remote body placed");
        Ok(())
    }

    /// The cache entry for `record`, filled from the content store when it is
    /// missing or no longer matches its digest.
    fn cached_body(&self, record: &FileRecord) -> SyncResult<PathBuf> {
        let expected = Digest::from_hex(&record.digest);
        let cached = self.cache_dir.join(expected.as_str());
        if cached.is_file() && digest_file(&cached)? == expected {
            return Ok(cached);
        }
        let source = self.content.fetch(&record.resource)?;
        let mut temp = cached.clone().into_os_string();
        temp.push(".part");
        fs::copy(&source, &temp)?;
        let actual = digest_file(Path::new(&temp))?;
        if actual != expected {
            fs::remove_file(&temp)?;
            return Err(SyncError::Content(format!(
                "resource {} has digest {actual}, expected {expected}",
                record.resource
            )));
        }
        fs::rename(&temp, &cached)?;
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::LocalContentStore;
    use mdir_core::digest_bytes;
    use proptest::prelude::*;
    use tempfile::{tempdir, TempDir};

    fn d(s: &str) -> Digest {
        digest_bytes(s.as_bytes())
    }

    #[test]
    fn decision_table() {
        let (a, b, c) = (d("a"), d("b"), d("c"));
        let cases = [
            (Some(&a), Some(&a), Some(&a), Decision::InSync),
            (Some(&a), Some(&a), Some(&b), Decision::Fetch),
            (Some(&b), Some(&a), Some(&a), Decision::Upload),
            (Some(&b), Some(&a), Some(&c), Decision::Conflict),
            (Some(&b), Some(&a), Some(&b), Decision::Adopt),
            (Some(&a), Some(&a), None, Decision::DeleteLocal),
            (Some(&b), Some(&a), None, Decision::Conflict),
            (None, Some(&a), Some(&a), Decision::RequestRemoval),
            (None, Some(&a), Some(&b), Decision::Conflict),
            (None, Some(&a), None, Decision::Forget),
            (Some(&a), None, None, Decision::Upload),
            (Some(&a), None, Some(&a), Decision::Adopt),
            (Some(&a), None, Some(&b), Decision::Conflict),
            (None, None, Some(&a), Decision::Fetch),
        ];
        for (local, map, remote, expected) in cases {
            assert_eq!(decide(local, map, remote), expected, "{local:?} {map:?} {remote:?}");
        }
    }

    proptest! {
        #[test]
        fn three_way_difference_is_a_conflict(l in "[a-z]{1,4}", m in "[a-z]{1,4}", r in "[a-z]{1,4}") {
            prop_assume!(l != m && m != r && l != r);
            prop_assert_eq!(decide(Some(&d(&l)), Some(&d(&m)), Some(&d(&r))), Decision::Conflict);
        }
    }

    struct Fixture {
        _dir: TempDir,
        mirror: FolderMirror,
        cache: PathBuf,
        store: LocalContentStore,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let mirror = FolderMirror::at(dir.path().join("mirror"));
        mirror.create().unwrap();
        let cache = dir.path().join("cache");
        fs::create_dir_all(&cache).unwrap();
        let store = LocalContentStore::open(dir.path().join("store")).unwrap();
        Fixture {
            _dir: dir,
            mirror,
            cache,
            store,
        }
    }

    fn remote_record(store: &LocalContentStore, name: &str, body: &[u8], version: i64) -> FileRecord {
        let scratch = store.path().join("scratch");
        fs::write(&scratch, body).unwrap();
        let resource = store.upload(&scratch).unwrap();
        fs::remove_file(&scratch).unwrap();
        FileRecord {
            name: name.to_string(),
            digest: digest_bytes(body).as_str().to_string(),
            resource,
            version,
        }
    }

    fn run(f: &Fixture, map: &mut SyncMap, remote: &[FileRecord]) -> ReconcileReport {
        let known = HashMap::new();
        let plan = plan(&f.mirror, map, remote).unwrap();
        Reconciler::new(&f.mirror, &f.cache, &f.store, &known).execute(&plan, map, remote)
    }

    #[test]
    fn remote_file_is_fetched() {
        let f = fixture();
        let remote = vec![remote_record(&f.store, "a.txt", b"remote", 3)];
        let mut map = SyncMap::new();

        let report = run(&f, &mut map, &remote);
        assert_eq!(report.fetched, 1);
        assert_eq!(fs::read(f.mirror.path().join("a.txt")).unwrap(), b"remote");
        assert_eq!(map.get("a.txt"), Some(&digest_bytes(b"remote")));

        // second pass is a no-op
        assert!(plan(&f.mirror, &map, &remote).unwrap().is_empty());
    }

    #[test]
    fn new_local_file_is_uploaded() {
        let f = fixture();
        fs::write(f.mirror.path().join("new.txt"), b"mine").unwrap();
        let mut map = SyncMap::new();

        let report = run(&f, &mut map, &[]);
        assert_eq!(report.uploaded, 1);
        let staged = f.mirror.staged_puts().unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].header.name(), Some("new.txt"));
        assert_eq!(staged[0].header.digest(), Some(digest_bytes(b"mine").as_str()));

        // in flight: not planned again
        let again = plan(&f.mirror, &map, &[]).unwrap();
        assert!(again.entries.is_empty());
        assert_eq!(again.busy, vec!["new.txt"]);
    }

    #[test]
    fn local_edit_replaces_remote() {
        let f = fixture();
        let remote = vec![remote_record(&f.store, "a.txt", b"v1", 2)];
        let mut map = SyncMap::new();
        map.insert("a.txt", digest_bytes(b"v1"));
        fs::write(f.mirror.path().join("a.txt"), b"v2").unwrap();

        let report = run(&f, &mut map, &remote);
        assert_eq!(report.uploaded, 1);
        let removals: Vec<_> = f
            .mirror
            .staged_removals()
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(removals, vec![2]);
    }

    #[test]
    fn upload_reuses_known_resource() {
        let f = fixture();
        fs::write(f.mirror.path().join("copy.txt"), b"shared").unwrap();
        let mut known = HashMap::new();
        known.insert(digest_bytes(b"shared"), "existing-ref".to_string());
        let mut map = SyncMap::new();

        let plan = plan(&f.mirror, &map, &[]).unwrap();
        let report = Reconciler::new(&f.mirror, &f.cache, &f.store, &known).execute(&plan, &mut map, &[]);
        assert_eq!(report.deduplicated, 1);
        assert_eq!(
            f.mirror.staged_puts().unwrap()[0].header.resource(),
            Some("existing-ref")
        );
    }

    #[test]
    fn conflict_keeps_local_copy() {
        let f = fixture();
        let remote = vec![remote_record(&f.store, "a.txt", b"theirs", 4)];
        let mut map = SyncMap::new();
        map.insert("a.txt", digest_bytes(b"base"));
        fs::write(f.mirror.path().join("a.txt"), b"mine").unwrap();

        let report = run(&f, &mut map, &remote);
        assert_eq!(report.conflicts, 1);
        assert_eq!(fs::read(f.mirror.path().join("a.txt")).unwrap(), b"theirs");
        let backups: Vec<_> = fs::read_dir(f.mirror.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".a.txt."))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(fs::read(backups[0].path()).unwrap(), b"mine");
    }

    #[test]
    fn repeated_conflicts_keep_every_local_copy() {
        let f = fixture();
        let mut map = SyncMap::new();
        map.insert("a.txt", digest_bytes(b"base"));

        fs::write(f.mirror.path().join("a.txt"), b"mine1").unwrap();
        let remote = vec![remote_record(&f.store, "a.txt", b"theirs1", 4)];
        assert_eq!(run(&f, &mut map, &remote).conflicts, 1);

        fs::write(f.mirror.path().join("a.txt"), b"mine2").unwrap();
        let remote = vec![remote_record(&f.store, "a.txt", b"theirs2", 6)];
        assert_eq!(run(&f, &mut map, &remote).conflicts, 1);

        let mut kept: Vec<Vec<u8>> = fs::read_dir(f.mirror.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".a.txt."))
            .map(|e| fs::read(e.path()).unwrap())
            .collect();
        kept.sort();
        assert_eq!(kept, vec![b"mine1".to_vec(), b"mine2".to_vec()]);
        assert_eq!(fs::read(f.mirror.path().join("a.txt")).unwrap(), b"theirs2");
    }

    #[test]
    fn deletions_flow_both_ways() {
        let f = fixture();
        let remote = vec![remote_record(&f.store, "gone.txt", b"x", 1)];
        let mut map = SyncMap::new();
        map.insert("gone.txt", digest_bytes(b"x"));
        map.insert("dropped.txt", digest_bytes(b"y"));
        fs::write(f.mirror.path().join("dropped.txt"), b"y").unwrap();

        // gone.txt deleted locally, dropped.txt removed remotely
        let report = run(&f, &mut map, &remote);
        assert_eq!(report.removals, 1);
        assert_eq!(report.deleted, 1);
        assert!(!f.mirror.path().join("dropped.txt").exists());
        assert!(map.is_empty());
    }

    #[test]
    fn corrupted_cache_entry_is_refetched() {
        let f = fixture();
        let record = remote_record(&f.store, "a.txt", b"good", 1);
        fs::write(f.cache.join(&record.digest), b"tampered").unwrap();
        let mut map = SyncMap::new();

        run(&f, &mut map, std::slice::from_ref(&record));
        assert_eq!(fs::read(f.mirror.path().join("a.txt")).unwrap(), b"good");
    }
}

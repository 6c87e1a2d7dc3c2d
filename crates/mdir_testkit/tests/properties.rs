//! Journal and reassembly properties over generated patch chains.

use mdir_core::{DirId, Folder, FolderKind};
use mdir_testkit::prelude::*;
use proptest::prelude::*;

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn any_delivery_order_commits_the_chain(shuffled in shuffled_chain_strategy(24)) {
        let folder = Folder::in_memory(DirId::new("X"), FolderKind::Plain);
        for patch in shuffled.iter().cloned() {
            folder.apply_remote(patch).unwrap();
        }

        let mut chain = shuffled;
        chain.sort_by_key(|patch| patch.old_version);
        prop_assert_eq!(folder.pending(), 0);
        prop_assert_eq!(folder.version(), chain.last().map_or(0, |p| p.new_version));
        prop_assert_eq!(folder.patches_since(0).unwrap(), chain);
    }

    #[test]
    fn redelivery_changes_nothing(chain in patch_chain_strategy(12)) {
        let folder = Folder::in_memory(DirId::new("X"), FolderKind::Plain);
        for patch in chain.iter().cloned() {
            folder.apply_remote(patch).unwrap();
        }
        let version = folder.version();
        for patch in chain.iter().cloned() {
            let report = folder.apply_remote(patch).unwrap();
            prop_assert!(report.applied.is_empty());
        }
        prop_assert_eq!(folder.version(), version);
        prop_assert_eq!(folder.journal().len(), chain.len());
    }

    #[test]
    fn journal_survives_reopen(chain in patch_chain_strategy(16)) {
        let journal = TempJournal::new();
        {
            let open = journal.open();
            for patch in &chain {
                open.append_patch(patch).unwrap();
            }
        }
        let reopened = journal.open();
        prop_assert_eq!(reopened.recovery().records, chain.len());
        prop_assert_eq!(reopened.patches_since(0).unwrap(), chain);
    }
}

#[test]
fn torn_tail_is_cut_on_reopen() {
    let journal = TempJournal::new();
    {
        let open = journal.open();
        for patch in sample_chain(4) {
            open.append_patch(&patch).unwrap();
        }
    }
    let full = std::fs::metadata(journal.path()).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(journal.path()).unwrap();
    file.set_len(full - 3).unwrap();
    drop(file);

    let reopened = journal.open();
    assert_eq!(reopened.last_version(), 3);
    assert!(reopened.recovery().truncated_bytes > 0);
}

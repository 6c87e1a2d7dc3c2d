//! Property-based test generators using proptest.
//!
//! Provides strategies for generating documents, file names and patch
//! chains that keep the journal invariants: every chain starts at version 0
//! and each patch starts where the previous one ended.

use mdir_codec::Header;
use mdir_protocol::{Action, Patch};
use proptest::prelude::*;

/// Strategy for generating document field names.
pub fn field_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-zA-Z0-9_-]{0,11}").expect("Invalid regex")
}

/// Strategy for generating field values, including characters the text
/// form has to escape.
pub fn field_value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[ -~\\n\\r\\\\é]{0,40}").expect("Invalid regex")
}

/// Strategy for generating documents with up to `max_fields` fields.
pub fn header_strategy(max_fields: usize) -> impl Strategy<Value = Header> {
    prop::collection::vec((field_name_strategy(), field_value_strategy()), 0..=max_fields).prop_map(
        |fields| {
            let mut header = Header::new();
            for (name, value) in fields {
                header.push(name, value);
            }
            header
        },
    )
}

/// Strategy for generating file names a mirror accepts.
pub fn file_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9][a-zA-Z0-9_-]{0,15}(\\.[a-z]{1,4})?")
        .expect("Invalid regex")
}

/// Strategy for generating durable folder identifiers.
pub fn dir_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[1-9][0-9]{0,5}").expect("Invalid regex")
}

/// Strategy for generating a gapless chain of 1 to `max_len` patches.
///
/// About one patch in five skips versions, the way a server records
/// versions it never committed.
pub fn patch_chain_strategy(max_len: usize) -> impl Strategy<Value = Vec<Patch>> {
    prop::collection::vec(
        (prop_oneof![4 => Just(0i64), 1 => 1i64..4], header_strategy(4)),
        1..=max_len.max(1),
    )
    .prop_map(|steps| {
        let mut version = 0;
        steps
            .into_iter()
            .map(|(skipped, header)| {
                let patch = Patch {
                    old_version: version,
                    new_version: version + 1 + skipped,
                    action: Action::Add,
                    header,
                };
                version = patch.new_version;
                patch
            })
            .collect()
    })
}

/// Strategy for generating a patch chain in arbitrary delivery order.
///
/// Sorting by `old_version` recovers the chain.
pub fn shuffled_chain_strategy(max_len: usize) -> impl Strategy<Value = Vec<Patch>> {
    patch_chain_strategy(max_len).prop_flat_map(|chain| Just(chain).prop_shuffle())
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn chains_are_contiguous(chain in patch_chain_strategy(20)) {
            let mut version = 0;
            for patch in &chain {
                prop_assert_eq!(patch.old_version, version);
                prop_assert!(patch.new_version > patch.old_version);
                version = patch.new_version;
            }
        }

        #[test]
        fn shuffles_keep_every_patch(mut shuffled in shuffled_chain_strategy(20)) {
            shuffled.sort_by_key(|patch| patch.old_version);
            let mut version = 0;
            for patch in &shuffled {
                prop_assert_eq!(patch.old_version, version);
                version = patch.new_version;
            }
        }

        #[test]
        fn file_names_are_plain(name in file_name_strategy()) {
            prop_assert!(!name.starts_with('.'));
            prop_assert!(!name.contains('/'));
        }
    }
}

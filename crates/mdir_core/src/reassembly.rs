//! Patch reassembly buffer.
//!
//! Patches may arrive out of order or more than once. Each folder keeps one
//! buffer ordered by `old_version`; `drain` releases the run of patches that
//! continues from the committed version and stops at the first gap.

use mdir_protocol::{Patch, Version};
use std::collections::BTreeMap;

/// What happened to an offered patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Held until it can be applied.
    Buffered,
    /// Already committed: a retransmission, discarded.
    Stale,
    /// A patch for the same `old_version` is already waiting, discarded.
    Duplicate,
}

/// Holds patches until the versions before them have been applied.
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    pending: BTreeMap<Version, Patch>,
}

impl ReassemblyBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a patch, given the folder's committed version.
    ///
    /// A patch whose `old_version` is below `committed` is a no-op.
    pub fn offer(&mut self, patch: Patch, committed: Version) -> OfferOutcome {
        if patch.old_version < committed {
            return OfferOutcome::Stale;
        }
        if self.pending.contains_key(&patch.old_version) {
            return OfferOutcome::Duplicate;
        }
        self.pending.insert(patch.old_version, patch);
        OfferOutcome::Buffered
    }

    /// Removes and yields, in order, every patch continuing from `current`.
    ///
    /// The iterator is lazy: patches not pulled from it stay buffered.
    /// Entries left behind `current` by earlier applies are dropped on the way.
    pub fn drain(&mut self, current: Version) -> Drain<'_> {
        Drain {
            pending: &mut self.pending,
            running: current,
        }
    }

    /// Puts back patches taken by [`ReassemblyBuffer::drain`] but not applied.
    pub fn restore(&mut self, patches: impl IntoIterator<Item = Patch>) {
        for patch in patches {
            self.pending.entry(patch.old_version).or_insert(patch);
        }
    }

    /// Number of waiting patches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns true if nothing is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Lowest `old_version` waiting, if any.
    #[must_use]
    pub fn first_pending(&self) -> Option<Version> {
        self.pending.keys().next().copied()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Lazy iterator returned by [`ReassemblyBuffer::drain`].
#[derive(Debug)]
pub struct Drain<'a> {
    pending: &'a mut BTreeMap<Version, Patch>,
    running: Version,
}

impl Drain<'_> {
    /// Version reached after the patches yielded so far.
    #[must_use]
    pub fn running_version(&self) -> Version {
        self.running
    }
}

impl Iterator for Drain<'_> {
    type Item = Patch;

    fn next(&mut self) -> Option<Patch> {
        loop {
            let (&first, _) = self.pending.iter().next()?;
            if first < self.running {
                self.pending.remove(&first);
                continue;
            }
            if first > self.running {
                return None;
            }
            let patch = self.pending.remove(&first)?;
            self.running = patch.new_version;
            return Some(patch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdir_codec::Header;
    use proptest::prelude::*;

    fn add(old: Version) -> Patch {
        Patch::add(old, Header::new().with("v", old.to_string()))
    }

    #[test]
    fn holds_until_gap_closes() {
        let mut buffer = ReassemblyBuffer::new();
        assert_eq!(buffer.offer(add(5), 3), OfferOutcome::Buffered);
        assert_eq!(buffer.drain(3).count(), 0);
        assert_eq!(buffer.len(), 1);

        buffer.offer(add(3), 3);
        let drained: Vec<_> = buffer.drain(3).map(|p| p.old_version).collect();
        assert_eq!(drained, vec![3]);

        buffer.offer(add(4), 4);
        let drained: Vec<_> = buffer.drain(4).map(|p| p.old_version).collect();
        assert_eq!(drained, vec![4, 5]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn stale_and_duplicate() {
        let mut buffer = ReassemblyBuffer::new();
        assert_eq!(buffer.offer(add(1), 2), OfferOutcome::Stale);
        assert_eq!(buffer.offer(add(2), 2), OfferOutcome::Buffered);
        assert_eq!(buffer.offer(add(2), 2), OfferOutcome::Duplicate);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn gap_patch_jumps_running_version() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.offer(Patch::new(0, 4, mdir_protocol::Action::Add, Header::new()).unwrap(), 0);
        buffer.offer(add(4), 0);
        let mut drain = buffer.drain(0);
        assert_eq!(drain.next().unwrap().new_version, 4);
        assert_eq!(drain.next().unwrap().new_version, 5);
        assert_eq!(drain.running_version(), 5);
    }

    #[test]
    fn drain_is_lazy_and_restorable() {
        let mut buffer = ReassemblyBuffer::new();
        for old in 0..3 {
            buffer.offer(add(old), 0);
        }
        let first = buffer.drain(0).next().unwrap();
        assert_eq!(first.old_version, 0);
        assert_eq!(buffer.len(), 2);

        buffer.restore([first]);
        assert_eq!(buffer.first_pending(), Some(0));
    }

    #[test]
    fn entries_left_behind_are_dropped() {
        let mut buffer = ReassemblyBuffer::new();
        buffer.offer(add(1), 0);
        buffer.offer(add(2), 0);
        // version 2 was reached some other way
        let drained: Vec<_> = buffer.drain(2).map(|p| p.old_version).collect();
        assert_eq!(drained, vec![2]);
        assert!(buffer.is_empty());
    }

    proptest! {
        #[test]
        fn any_permutation_drains_in_order(
            order in Just((0..16i64).collect::<Vec<_>>()).prop_shuffle()
        ) {
            let mut buffer = ReassemblyBuffer::new();
            let mut current = 0;
            let mut applied = Vec::new();
            for old in order {
                buffer.offer(add(old), current);
                for patch in buffer.drain(current) {
                    prop_assert_eq!(patch.old_version, current);
                    current = patch.new_version;
                    applied.push(patch.old_version);
                }
                // nothing is released while a gap remains
                if let Some(first) = buffer.first_pending() {
                    prop_assert!(first > current);
                }
            }
            prop_assert_eq!(applied, (0..16).collect::<Vec<_>>());
            prop_assert!(buffer.is_empty());
        }
    }
}

//! Metadata-only change detection between a classification and the stored
//! mirror state. Pure: no I/O, same inputs give the same output.

use crate::classify::Classification;
use crate::constants::MTIME_TOLERANCE;
use crate::context::FileMeta;
use crate::state::MirrorState;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Tracked now, but absent from the state or recorded there as untracked.
    pub new_tracked: BTreeSet<String>,
    /// Tracked before and now, with different size or mtime.
    pub changed_tracked: BTreeSet<String>,
    /// Recorded as tracked, no longer in the classification.
    pub deleted_tracked: BTreeSet<String>,
    /// Any classified path whose mirror copy is missing or stale.
    pub mirror_updates: BTreeSet<String>,
    /// Any recorded path no longer in the classification.
    pub mirror_removals: BTreeSet<String>,
}

impl ChangeSet {
    pub fn has_tracked_changes(&self) -> bool {
        !(self.new_tracked.is_empty()
            && self.changed_tracked.is_empty()
            && self.deleted_tracked.is_empty())
    }

    /// New and changed tracked paths, the content of an increment's `track/`.
    pub fn tracked_updates(&self) -> BTreeSet<String> {
        self.new_tracked
            .union(&self.changed_tracked)
            .cloned()
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        !self.has_tracked_changes()
            && self.mirror_updates.is_empty()
            && self.mirror_removals.is_empty()
    }
}

/// Exact size match and an mtime difference above [`MTIME_TOLERANCE`].
pub fn is_modified(current: FileMeta, stored: FileMeta) -> bool {
    current.size != stored.size || (current.mtime - stored.mtime).abs() > MTIME_TOLERANCE
}

pub fn diff(classification: &Classification, state: &MirrorState) -> ChangeSet {
    let mut changes = ChangeSet::default();

    for (rel, file) in &classification.files {
        let stored = state.get(rel);
        let modified = stored.is_none_or(|entry| is_modified(file.meta, entry.meta()));
        if modified {
            changes.mirror_updates.insert(rel.clone());
        }
        if !file.tracked {
            continue;
        }
        match stored {
            Some(entry) if entry.tracked => {
                if modified {
                    changes.changed_tracked.insert(rel.clone());
                }
            }
            _ => {
                changes.new_tracked.insert(rel.clone());
            }
        }
    }

    for (rel, entry) in state {
        if classification.files.contains_key(rel) {
            continue;
        }
        changes.mirror_removals.insert(rel.clone());
        if entry.tracked {
            changes.deleted_tracked.insert(rel.clone());
        }
    }

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassifiedFile;
    use crate::state::MirrorEntry;

    fn file(size: u64, mtime: f64, tracked: bool) -> ClassifiedFile {
        ClassifiedFile {
            tracked,
            explicit: false,
            meta: FileMeta { size, mtime },
        }
    }

    fn entry(size: u64, mtime: f64, tracked: bool) -> MirrorEntry {
        MirrorEntry {
            size,
            mtime,
            tracked,
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_against_empty_state() {
        let mut classification = Classification::default();
        classification.files.insert("notes/todo.track".into(), file(100, 10.0, true));
        classification.files.insert("docs/a.txt".into(), file(5, 10.0, false));

        let changes = diff(&classification, &MirrorState::new());
        assert_eq!(changes.new_tracked, set(&["notes/todo.track"]));
        assert!(changes.changed_tracked.is_empty());
        assert!(changes.deleted_tracked.is_empty());
        assert_eq!(changes.mirror_updates, set(&["docs/a.txt", "notes/todo.track"]));
        assert!(changes.mirror_removals.is_empty());
    }

    #[test]
    fn test_mtime_tolerance() {
        let mut classification = Classification::default();
        classification.files.insert("a".into(), file(1, 100.9, true));
        classification.files.insert("b".into(), file(1, 101.5, true));
        classification.files.insert("c".into(), file(2, 100.0, true));
        let mut state = MirrorState::new();
        for rel in ["a", "b", "c"] {
            state.insert(rel.into(), entry(1, 100.0, true));
        }

        let changes = diff(&classification, &state);
        assert_eq!(changes.changed_tracked, set(&["b", "c"]));
        assert_eq!(changes.mirror_updates, set(&["b", "c"]));
        assert!(changes.new_tracked.is_empty());
    }

    #[test]
    fn test_deleted_and_untracked() {
        let mut classification = Classification::default();
        classification.files.insert("demoted".into(), file(1, 1.0, false));
        classification.files.insert("promoted".into(), file(1, 1.0, true));
        let mut state = MirrorState::new();
        state.insert("demoted".into(), entry(1, 1.0, true));
        state.insert("promoted".into(), entry(1, 1.0, false));
        state.insert("gone.track".into(), entry(3, 1.0, true));
        state.insert("gone.txt".into(), entry(3, 1.0, false));

        let changes = diff(&classification, &state);
        assert_eq!(changes.new_tracked, set(&["promoted"]));
        assert_eq!(changes.deleted_tracked, set(&["gone.track"]));
        assert_eq!(changes.mirror_removals, set(&["gone.track", "gone.txt"]));
        assert!(changes.mirror_updates.is_empty());
    }

    #[test]
    fn test_diff_is_pure_and_noop_when_unchanged() {
        let mut classification = Classification::default();
        classification.files.insert("x".into(), file(9, 50.0, true));
        let mut state = MirrorState::new();
        state.insert("x".into(), entry(9, 50.0, true));

        let first = diff(&classification, &state);
        let second = diff(&classification, &state);
        assert_eq!(first, second);
        assert!(first.is_noop());
    }
}

//! Set differences between two observed key sets.

use std::collections::BTreeSet;

/// Keys gained and lost between two observations of the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyDiff {
    /// Keys present in the new set only.
    pub added: Vec<String>,
    /// Keys present in the old set only.
    pub removed: Vec<String>,
}

impl KeyDiff {
    /// Returns true if neither side changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diffs `old` against `new`.
pub fn diff_keys(old: &BTreeSet<String>, new: &BTreeSet<String>) -> KeyDiff {
    KeyDiff {
        added: new.difference(old).cloned().collect(),
        removed: old.difference(new).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn diff_both_directions() {
        let diff = diff_keys(&set(&["a", "b"]), &set(&["b", "c"]));
        assert_eq!(diff.added, vec!["c".to_string()]);
        assert_eq!(diff.removed, vec!["a".to_string()]);
    }

    #[test]
    fn identical_sets() {
        assert!(diff_keys(&set(&["a"]), &set(&["a"])).is_empty());
    }
}

//! Watch reconciliation
//!
//! Decides what a settled filesystem change means for one watched root. A
//! path is reported added once per appearance, and only when it is present
//! with a non-zero size; it is reported removed once per disappearance.

use crate::scan::walk_videos;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Logical change emitted to watch subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    Added { root: PathBuf, file_path: PathBuf },
    Removed { root: PathBuf, file_path: PathBuf },
}

impl WatchEvent {
    pub fn file_path(&self) -> &Path {
        match self {
            WatchEvent::Added { file_path, .. } | WatchEvent::Removed { file_path, .. } => {
                file_path
            }
        }
    }

    pub fn root(&self) -> &Path {
        match self {
            WatchEvent::Added { root, .. } | WatchEvent::Removed { root, .. } => root,
        }
    }
}

/// What the filesystem showed once a path's debounce window elapsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Present { size: u64 },
    Missing,
}

/// Net effect of an observation on the known-file set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Added,
    Removed,
    Unchanged,
}

/// Pure decision for one observation against the path's known status.
pub fn decide(known: bool, observation: Observation) -> Reconciliation {
    match observation {
        Observation::Present { size } if size > 0 && !known => Reconciliation::Added,
        Observation::Missing if known => Reconciliation::Removed,
        _ => Reconciliation::Unchanged,
    }
}

/// Known-file set of one watched root
#[derive(Debug, Clone)]
pub struct WatchState {
    root: PathBuf,
    known: HashSet<PathBuf>,
}

impl WatchState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            known: HashSet::new(),
        }
    }

    /// State seeded with every video file currently under `root`
    ///
    /// The baseline is never reported as events.
    pub fn baseline(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let known = walk_videos(&root).map(|entry| entry.into_path()).collect();
        Self { root, known }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_known(&self, path: &Path) -> bool {
        self.known.contains(path)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    /// Known files below `dir`, used when a whole directory disappears
    pub fn known_under(&self, dir: &Path) -> Vec<PathBuf> {
        self.known
            .iter()
            .filter(|path| path.starts_with(dir) && path.as_path() != dir)
            .cloned()
            .collect()
    }

    /// Apply an observation and return the event it produces, if any
    pub fn reconcile(&mut self, path: &Path, observation: Observation) -> Option<WatchEvent> {
        match decide(self.is_known(path), observation) {
            Reconciliation::Added => {
                self.known.insert(path.to_path_buf());
                Some(WatchEvent::Added {
                    root: self.root.clone(),
                    file_path: path.to_path_buf(),
                })
            }
            Reconciliation::Removed => {
                self.known.remove(path);
                Some(WatchEvent::Removed {
                    root: self.root.clone(),
                    file_path: path.to_path_buf(),
                })
            }
            Reconciliation::Unchanged => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_added_once_per_appearance() {
        let mut state = WatchState::new("/clips");
        let path = Path::new("/clips/a.mp4");

        assert_eq!(state.reconcile(path, Observation::Present { size: 0 }), None);
        assert!(matches!(
            state.reconcile(path, Observation::Present { size: 10 }),
            Some(WatchEvent::Added { .. })
        ));
        assert_eq!(state.reconcile(path, Observation::Present { size: 20 }), None);
        assert!(state.is_known(path));
    }

    #[test]
    fn test_removed_once_per_disappearance() {
        let mut state = WatchState::new("/clips");
        let path = Path::new("/clips/a.mp4");

        assert_eq!(state.reconcile(path, Observation::Missing), None);
        state.reconcile(path, Observation::Present { size: 1 });

        let event = state.reconcile(path, Observation::Missing).unwrap();
        assert_eq!(
            event,
            WatchEvent::Removed {
                root: PathBuf::from("/clips"),
                file_path: path.to_path_buf(),
            }
        );
        assert_eq!(state.reconcile(path, Observation::Missing), None);
        assert_eq!(state.known_count(), 0);
    }

    #[test]
    fn test_baseline_records_existing_videos() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.mp4"), b"x").unwrap();
        fs::write(root.join("sub").join("b.mkv"), b"x").unwrap();
        fs::write(root.join("c.txt"), b"x").unwrap();

        let state = WatchState::baseline(root);
        assert_eq!(state.known_count(), 2);
        assert!(state.is_known(&root.join("sub").join("b.mkv")));
        assert_eq!(state.known_under(&root.join("sub")).len(), 1);
    }

    // *For any* known status and observation, an event is produced only for a
    // net change: non-empty and previously unknown, or missing and previously known.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_decide_reports_only_net_changes(
            known in proptest::bool::ANY,
            present in proptest::bool::ANY,
            size in 0u64..1_000_000,
        ) {
            let observation = if present {
                Observation::Present { size }
            } else {
                Observation::Missing
            };
            let expected = match (known, present) {
                (false, true) if size > 0 => Reconciliation::Added,
                (true, false) => Reconciliation::Removed,
                _ => Reconciliation::Unchanged,
            };
            prop_assert_eq!(decide(known, observation), expected);
        }
    }
}

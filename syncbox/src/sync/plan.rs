//! Reconciliation of the previous manifest against the current scan.

use crate::executor::manifest::Manifest;
use crate::fs::FileEntry;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Kind of an [`Action`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Create,
    Update,
    Delete,
    Skip,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Skip => "skip",
        };
        f.write_str(name)
    }
}

/// One step of an action plan. Each path appears at most once per plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Not in the manifest: upload
    Create(FileEntry),
    /// In the manifest with a different fingerprint: upload
    Update(FileEntry),
    /// In the manifest but no longer in the source: remove remotely
    Delete(String),
    /// Unchanged
    Skip(FileEntry),
}

impl Action {
    pub fn path(&self) -> &str {
        match self {
            Self::Create(entry) | Self::Update(entry) | Self::Skip(entry) => &entry.relative_path,
            Self::Delete(path) => path,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Create(_) => ActionKind::Create,
            Self::Update(_) => ActionKind::Update,
            Self::Delete(_) => ActionKind::Delete,
            Self::Skip(_) => ActionKind::Skip,
        }
    }

    /// Whether executing this action touches the target.
    pub fn is_transfer(&self) -> bool {
        !matches!(self, Self::Skip(_))
    }

    /// Record the effect of a successfully applied action in `manifest`.
    pub fn apply_to(&self, manifest: &mut Manifest) {
        match self {
            Self::Create(entry) | Self::Update(entry) | Self::Skip(entry) => {
                manifest.insert(entry.clone());
            }
            Self::Delete(path) => {
                manifest.remove(path);
            }
        }
    }
}

/// Build the path-ordered action plan.
///
/// With `skip_removal`, manifest entries missing from `current` produce no
/// action at all and are therefore carried forward unchanged.
pub fn plan(previous: &Manifest, current: &[FileEntry], skip_removal: bool) -> Vec<Action> {
    let mut actions = Vec::with_capacity(current.len());
    let mut seen = HashSet::with_capacity(current.len());

    for entry in current {
        if !seen.insert(entry.relative_path.as_str()) {
            continue;
        }
        let action = match previous.get(&entry.relative_path) {
            None => Action::Create(entry.clone()),
            Some(known) if known.same_content(entry) => Action::Skip(entry.clone()),
            Some(_) => Action::Update(entry.clone()),
        };
        actions.push(action);
    }

    if !skip_removal {
        for known in previous.entries() {
            if !seen.contains(known.relative_path.as_str()) {
                actions.push(Action::Delete(known.relative_path.clone()));
            }
        }
    }

    actions.sort_by(|a, b| a.path().cmp(b.path()));
    actions
}

/// Per-kind counts of a plan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub skip: usize,
}

impl PlanSummary {
    pub fn of(actions: &[Action]) -> Self {
        let mut summary = Self::default();
        for action in actions {
            match action.kind() {
                ActionKind::Create => summary.create += 1,
                ActionKind::Update => summary.update += 1,
                ActionKind::Delete => summary.delete += 1,
                ActionKind::Skip => summary.skip += 1,
            }
        }
        summary
    }

    /// Actions that need the target
    pub fn pending(&self) -> usize {
        self.create + self.update + self.delete
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.skip
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(path: &str, size: u64, mtime: i64) -> FileEntry {
        FileEntry {
            relative_path: path.to_string(),
            size,
            modified_time: mtime,
            content_hash: None,
        }
    }

    fn hashed(path: &str, size: u64, mtime: i64, hash: &str) -> FileEntry {
        FileEntry {
            content_hash: Some(hash.to_string()),
            ..small(path, size, mtime)
        }
    }

    fn pending(actions: &[Action]) -> Vec<(ActionKind, &str)> {
        actions
            .iter()
            .filter(|a| a.is_transfer())
            .map(|a| (a.kind(), a.path()))
            .collect()
    }

    #[test]
    fn test_empty() {
        assert!(plan(&Manifest::new(), &[], false).is_empty());
    }

    #[test]
    fn test_create_into_empty_manifest() {
        let actions = plan(&Manifest::new(), &[small("a.txt", 8, 100)], false);
        assert_eq!(actions, vec![Action::Create(small("a.txt", 8, 100))]);
    }

    #[test]
    fn test_unchanged_is_skipped() {
        let previous = Manifest::from_entries(vec![small("a.txt", 8, 100)]);
        let actions = plan(&previous, &[small("a.txt", 8, 100)], false);
        assert_eq!(actions, vec![Action::Skip(small("a.txt", 8, 100))]);
        assert!(pending(&actions).is_empty());
    }

    #[test]
    fn test_metadata_change_is_update() {
        let previous = Manifest::from_entries(vec![small("a.txt", 8, 100), small("b.txt", 8, 100)]);
        let actions = plan(&previous, &[small("a.txt", 8, 101), small("b.txt", 9, 100)], false);
        assert_eq!(
            pending(&actions),
            vec![(ActionKind::Update, "a.txt"), (ActionKind::Update, "b.txt")]
        );
    }

    #[test]
    fn test_hash_decides_above_threshold() {
        let previous = Manifest::from_entries(vec![
            hashed("same.bin", 4096, 100, "aaa"),
            hashed("changed.bin", 4096, 100, "bbb"),
        ]);
        let current = vec![
            hashed("changed.bin", 4096, 100, "ccc"),
            // touched but identical content
            hashed("same.bin", 4096, 200, "aaa"),
        ];

        let actions = plan(&previous, &current, false);
        assert_eq!(pending(&actions), vec![(ActionKind::Update, "changed.bin")]);
        assert_eq!(actions[1].kind(), ActionKind::Skip);
    }

    #[test]
    fn test_threshold_crossing_forces_update() {
        let previous = Manifest::from_entries(vec![small("grew.txt", 8, 100)]);
        let current = vec![hashed("grew.txt", 8, 100, "aaa")];
        assert_eq!(
            pending(&plan(&previous, &current, false)),
            vec![(ActionKind::Update, "grew.txt")]
        );

        let previous = Manifest::from_entries(vec![hashed("shrank.txt", 8, 100, "aaa")]);
        let current = vec![small("shrank.txt", 8, 100)];
        assert_eq!(
            pending(&plan(&previous, &current, false)),
            vec![(ActionKind::Update, "shrank.txt")]
        );
    }

    #[test]
    fn test_removed_file_is_deleted() {
        let previous = Manifest::from_entries(vec![small("a.txt", 8, 100), small("b.txt", 8, 100)]);
        let actions = plan(&previous, &[small("a.txt", 8, 100)], false);
        assert_eq!(pending(&actions), vec![(ActionKind::Delete, "b.txt")]);
    }

    #[test]
    fn test_skip_removal_suppresses_delete() {
        let previous = Manifest::from_entries(vec![small("a.txt", 8, 100), small("b.txt", 8, 100)]);
        let actions = plan(&previous, &[small("a.txt", 8, 100)], true);
        assert!(pending(&actions).is_empty());
        assert!(actions.iter().all(|a| a.path() != "b.txt"));
    }

    #[test]
    fn test_plan_is_sorted_and_unique() {
        let previous = Manifest::from_entries(vec![
            small("dir/old.txt", 1, 1),
            small("dir/keep.txt", 1, 1),
            small("z.txt", 1, 1),
        ]);
        let current = vec![
            small("z.txt", 2, 1),
            small("a.txt", 1, 1),
            small("dir/keep.txt", 1, 1),
            small("dir/new.txt", 1, 1),
        ];

        let actions = plan(&previous, &current, false);
        let order: Vec<_> = actions.iter().map(|a| (a.kind(), a.path())).collect();
        assert_eq!(
            order,
            vec![
                (ActionKind::Create, "a.txt"),
                (ActionKind::Skip, "dir/keep.txt"),
                (ActionKind::Create, "dir/new.txt"),
                (ActionKind::Delete, "dir/old.txt"),
                (ActionKind::Update, "z.txt"),
            ]
        );

        let summary = PlanSummary::of(&actions);
        assert_eq!(
            summary,
            PlanSummary {
                create: 2,
                update: 1,
                delete: 1,
                skip: 1
            }
        );
        assert_eq!(summary.pending(), 4);
    }

    #[test]
    fn test_apply_to_manifest() {
        let mut manifest = Manifest::from_entries(vec![small("a.txt", 1, 1), small("b.txt", 1, 1)]);

        Action::Update(small("a.txt", 2, 2)).apply_to(&mut manifest);
        Action::Delete("b.txt".into()).apply_to(&mut manifest);
        Action::Create(small("c.txt", 3, 3)).apply_to(&mut manifest);

        assert_eq!(manifest.get("a.txt").map(|e| e.size), Some(2));
        assert!(!manifest.contains("b.txt"));
        assert!(manifest.contains("c.txt"));
    }

    #[test]
    fn test_second_plan_is_empty() {
        let current = vec![small("a.txt", 8, 100), hashed("big.bin", 4096, 100, "aaa")];
        let mut manifest = Manifest::new();
        for action in plan(&manifest.clone(), &current, false) {
            action.apply_to(&mut manifest);
        }
        assert!(pending(&plan(&manifest, &current, false)).is_empty());
    }
}

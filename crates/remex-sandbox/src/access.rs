// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Observed file accesses.

use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use remex_pips::AbsolutePath;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct RequestedAccess: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const PROBE = 1 << 2;
        const ENUMERATE = 1 << 3;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportedFileAccess {
    /// Manifest scope the access fell under, or `AbsolutePath::INVALID`
    /// when the path is not interned in the manifest's table.
    pub manifest_path: AbsolutePath,
    pub path: PathBuf,
    pub requested_access: RequestedAccess,
}

impl ReportedFileAccess {
    pub fn is_write(&self) -> bool {
        self.requested_access.contains(RequestedAccess::WRITE)
    }
}

/// Identity of a file's contents as far as metadata can tell.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct FileStamp {
    len: u64,
    ino: u64,
    mtime: (i64, i64),
    ctime: (i64, i64),
}

impl FileStamp {
    fn of(meta: &std::fs::Metadata) -> Self {
        Self {
            len: meta.len(),
            ino: meta.ino(),
            mtime: (meta.mtime(), meta.mtime_nsec()),
            ctime: (meta.ctime(), meta.ctime_nsec()),
        }
    }
}

/// Regular files and symlinks at or below each root, keyed by path.
/// Directories are walked without following symlinks.
pub(crate) fn snapshot(roots: &[PathBuf]) -> HashMap<PathBuf, FileStamp> {
    let mut files = HashMap::new();
    for root in roots {
        visit(root, &mut files);
    }
    files
}

fn visit(path: &Path, files: &mut HashMap<PathBuf, FileStamp>) {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return;
    };
    if meta.is_dir() {
        let Ok(entries) = std::fs::read_dir(path) else {
            return;
        };
        for entry in entries.flatten() {
            visit(&entry.path(), files);
        }
    } else {
        files.insert(path.to_path_buf(), FileStamp::of(&meta));
    }
}

/// Files that appeared are writes; files whose stamp changed were
/// rewritten in place. Sorted by path.
pub(crate) fn diff(
    before: &HashMap<PathBuf, FileStamp>,
    after: &HashMap<PathBuf, FileStamp>,
) -> Vec<(PathBuf, RequestedAccess)> {
    let mut changes: Vec<_> = after
        .iter()
        .filter_map(|(path, stamp)| match before.get(path) {
            None => Some((path.clone(), RequestedAccess::WRITE)),
            Some(old) if old != stamp => Some((path.clone(), RequestedAccess::READ | RequestedAccess::WRITE)),
            Some(_) => None,
        })
        .collect();
    changes.sort_by(|a, b| a.0.cmp(&b.0));
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[remex_test_utils::logged_test]
    fn diff_classifies_created_and_modified_files() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.txt");
        let changed = dir.path().join("changed.txt");
        std::fs::write(&kept, b"same").unwrap();
        std::fs::write(&changed, b"v1").unwrap();
        let roots = vec![dir.path().to_path_buf()];
        let before = snapshot(&roots);

        std::fs::write(&changed, b"version two").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        let created = dir.path().join("nested/new.txt");
        std::fs::write(&created, b"new").unwrap();
        let after = snapshot(&roots);

        let changes = diff(&before, &after);
        assert_eq!(
            changes,
            vec![
                (changed, RequestedAccess::READ | RequestedAccess::WRITE),
                (created, RequestedAccess::WRITE),
            ]
        );
    }

    #[remex_test_utils::logged_test]
    fn missing_roots_snapshot_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(snapshot(&[dir.path().join("absent")]).is_empty());
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Process-local hierarchical path namespace.
//!
//! Every absolute path is interned as a chain of `(parent, name)` nodes and
//! handed out as a small [`AbsolutePath`] handle. Handles are only meaningful
//! for the [`PathTable`] that produced them.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("path '{0}' is not absolute")]
    NotAbsolute(String),

    #[error("path '{0}' is not valid UTF-8")]
    NonUtf8(String),

    #[error("path '{0}' escapes its root")]
    EscapesRoot(String),

    #[error("'{0}' is not a valid path segment")]
    InvalidSegment(String),

    #[error("'{0}' is not a valid root")]
    InvalidRoot(String),

    #[error("parent path handle is not valid in this table")]
    InvalidParent,
}

/// Handle to an interned path. `AbsolutePath::INVALID` (id 0) stands for
/// "no path".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsolutePath(u32);

impl AbsolutePath {
    pub const INVALID: AbsolutePath = AbsolutePath(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

struct Node {
    parent: AbsolutePath,
    name: Arc<str>,
}

#[derive(Default)]
struct Names {
    // nodes[i] backs AbsolutePath(i + 1)
    nodes: Vec<Node>,
    // Roots are keyed under AbsolutePath::INVALID.
    children: HashMap<AbsolutePath, HashMap<Arc<str>, AbsolutePath>>,
}

impl Names {
    fn node(&self, path: AbsolutePath) -> Option<&Node> {
        path.0.checked_sub(1).and_then(|idx| self.nodes.get(idx as usize))
    }

    fn child(&self, parent: AbsolutePath, name: &str) -> Option<AbsolutePath> {
        self.children.get(&parent).and_then(|names| names.get(name)).copied()
    }

    fn insert(&mut self, parent: AbsolutePath, name: &str) -> AbsolutePath {
        let name: Arc<str> = Arc::from(name);
        self.nodes.push(Node {
            parent,
            name: name.clone(),
        });
        let path = AbsolutePath(self.nodes.len() as u32);
        self.children.entry(parent).or_default().insert(name, path);
        path
    }
}

/// Shared, internally synchronised path namespace. Clones share storage.
#[derive(Clone, Default)]
pub struct PathTable {
    names: Arc<RwLock<Names>>,
}

impl fmt::Debug for PathTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathTable").field("len", &self.len()).finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RootStyle {
    Unix,
    Drive,
}

impl RootStyle {
    fn is_separator(self, c: char) -> bool {
        match self {
            RootStyle::Unix => c == '/',
            RootStyle::Drive => c == '/' || c == '\\',
        }
    }

    fn separator(self) -> char {
        match self {
            RootStyle::Unix => '/',
            RootStyle::Drive => '\\',
        }
    }

    fn of_root_name(name: &str) -> Self {
        if name.ends_with('\\') {
            RootStyle::Drive
        } else {
            RootStyle::Unix
        }
    }
}

/// Splits an absolute path into its normalised root name and the remainder.
fn split_root(path: &str) -> Option<(String, &str, RootStyle)> {
    if let Some(rest) = path.strip_prefix('/') {
        return Some(("/".to_string(), rest, RootStyle::Unix));
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let rest = match bytes.get(2) {
            None => "",
            Some(b'/') | Some(b'\\') => &path[3..],
            Some(_) => return None,
        };
        return Some((format!("{}:\\", &path[..1]), rest, RootStyle::Drive));
    }
    None
}

/// Applies trailing-separator normalisation to a root received by name.
pub fn normalize_root(name: &str) -> Result<String, PathError> {
    match split_root(if name.is_empty() { "/" } else { name }) {
        Some((root, "", _)) => Ok(root),
        _ => Err(PathError::InvalidRoot(name.to_string())),
    }
}

pub fn validate_segment(name: &str) -> Result<(), PathError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(|c| c == '/' || c == '\\' || c == '\0');
    if invalid {
        Err(PathError::InvalidSegment(name.to_string()))
    } else {
        Ok(())
    }
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of interned paths.
    pub fn len(&self) -> usize {
        self.names.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Interns an absolute path given as text. `.` segments and repeated
    /// separators are dropped; `..` walks to the parent.
    pub fn create(&self, path: &str) -> Result<AbsolutePath, PathError> {
        let (root, rest, style) =
            split_root(path).ok_or_else(|| PathError::NotAbsolute(path.to_string()))?;

        let mut current = self.intern(AbsolutePath::INVALID, &root);
        for segment in rest.split(|c| style.is_separator(c)) {
            match segment {
                "" | "." => {}
                ".." => {
                    current = self.parent(current);
                    if !current.is_valid() {
                        return Err(PathError::EscapesRoot(path.to_string()));
                    }
                }
                name => {
                    validate_segment(name)?;
                    current = self.intern(current, name);
                }
            }
        }
        Ok(current)
    }

    pub fn from_path(&self, path: &Path) -> Result<AbsolutePath, PathError> {
        let text = path
            .to_str()
            .ok_or_else(|| PathError::NonUtf8(path.to_string_lossy().into_owned()))?;
        self.create(text)
    }

    /// Looks a path up without interning it.
    pub fn get(&self, path: &str) -> Option<AbsolutePath> {
        let (root, rest, style) = split_root(path)?;
        let names = self.names.read();
        let mut current = names.child(AbsolutePath::INVALID, &root)?;
        for segment in rest.split(|c| style.is_separator(c)) {
            current = match segment {
                "" | "." => current,
                ".." => names.node(current).map(|n| n.parent).filter(|p| p.is_valid())?,
                name => names.child(current, name)?,
            };
        }
        Some(current)
    }

    /// Interns a root entry by name, normalising its trailing separator.
    pub fn root(&self, name: &str) -> Result<AbsolutePath, PathError> {
        let root = normalize_root(name)?;
        Ok(self.intern(AbsolutePath::INVALID, &root))
    }

    /// Interns `parent/name`. `name` must be a single segment.
    pub fn combine(&self, parent: AbsolutePath, name: &str) -> Result<AbsolutePath, PathError> {
        if !self.contains(parent) {
            return Err(PathError::InvalidParent);
        }
        validate_segment(name)?;
        Ok(self.intern(parent, name))
    }

    pub fn contains(&self, path: AbsolutePath) -> bool {
        path.is_valid() && self.names.read().node(path).is_some()
    }

    /// Parent of `path`, or `INVALID` for roots and unknown handles.
    pub fn parent(&self, path: AbsolutePath) -> AbsolutePath {
        self.names.read().node(path).map(|n| n.parent).unwrap_or(AbsolutePath::INVALID)
    }

    /// Last segment of `path`; for roots, the normalised root name.
    pub fn name(&self, path: AbsolutePath) -> Option<String> {
        self.names.read().node(path).map(|n| n.name.to_string())
    }

    pub fn is_root(&self, path: AbsolutePath) -> bool {
        self.names.read().node(path).is_some_and(|n| !n.parent.is_valid())
    }

    /// True when `path` equals `ancestor` or lies beneath it.
    pub fn is_within(&self, path: AbsolutePath, ancestor: AbsolutePath) -> bool {
        if !ancestor.is_valid() {
            return false;
        }
        let names = self.names.read();
        let mut cursor = path;
        while let Some(node) = names.node(cursor) {
            if cursor == ancestor {
                return true;
            }
            cursor = node.parent;
        }
        false
    }

    /// Full textual form, or an empty string for `INVALID`.
    pub fn expand(&self, path: AbsolutePath) -> String {
        let names = self.names.read();
        let mut segments = Vec::new();
        let mut cursor = path;
        while let Some(node) = names.node(cursor) {
            segments.push(node.name.clone());
            cursor = node.parent;
        }

        let Some(root) = segments.pop() else {
            return String::new();
        };
        let separator = RootStyle::of_root_name(&root).separator();
        let mut text = root.to_string();
        for (i, segment) in segments.iter().rev().enumerate() {
            if i > 0 {
                text.push(separator);
            }
            text.push_str(segment);
        }
        text
    }

    pub fn to_path_buf(&self, path: AbsolutePath) -> PathBuf {
        PathBuf::from(self.expand(path))
    }

    fn intern(&self, parent: AbsolutePath, name: &str) -> AbsolutePath {
        let names = self.names.upgradable_read();
        if let Some(existing) = names.child(parent, name) {
            return existing;
        }
        let mut names = RwLockUpgradableReadGuard::upgrade(names);
        names.insert(parent, name)
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File access policies and the scoped manifest the sandbox enforces.

use std::collections::HashMap;

use bitflags::bitflags;
use remex_pips::{AbsolutePath, PathTable};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FileAccessPolicy: u16 {
        const ALLOW_READ = 1 << 0;
        const ALLOW_WRITE = 1 << 1;
        const ALLOW_READ_IF_NONEXISTENT = 1 << 2;
        const ALLOW_CREATE_DIRECTORY = 1 << 3;
        const ALLOW_SYMLINK_CREATION = 1 << 4;
        /// Accesses under this scope are returned in the access report
        const REPORT_ACCESS = 1 << 5;
        /// Inputs see their real timestamps instead of a fixed value
        const ALLOW_REAL_INPUT_TIMESTAMPS = 1 << 6;

        const ALLOW_ALL = Self::ALLOW_READ.bits()
            | Self::ALLOW_WRITE.bits()
            | Self::ALLOW_READ_IF_NONEXISTENT.bits()
            | Self::ALLOW_CREATE_DIRECTORY.bits()
            | Self::ALLOW_SYMLINK_CREATION.bits();
    }
}

/// How a scope modifies the policy inherited from its parent:
/// `(inherited & mask) | values`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Scope {
    pub mask: FileAccessPolicy,
    pub values: FileAccessPolicy,
}

impl Scope {
    pub fn apply(&self, inherited: FileAccessPolicy) -> FileAccessPolicy {
        (inherited & self.mask) | self.values
    }
}

#[derive(Clone)]
pub struct FileAccessManifest {
    table: PathTable,
    default_policy: FileAccessPolicy,
    scopes: HashMap<AbsolutePath, Scope>,
}

impl FileAccessManifest {
    pub fn new(table: PathTable) -> Self {
        Self {
            table,
            default_policy: FileAccessPolicy::ALLOW_READ | FileAccessPolicy::ALLOW_READ_IF_NONEXISTENT,
            scopes: HashMap::new(),
        }
    }

    pub fn with_default_policy(mut self, policy: FileAccessPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn path_table(&self) -> &PathTable {
        &self.table
    }

    pub fn default_policy(&self) -> FileAccessPolicy {
        self.default_policy
    }

    /// Adds or tightens the scope at `path`. A second call for the same
    /// path intersects the masks and unions the values.
    pub fn add_scope(&mut self, path: AbsolutePath, mask: FileAccessPolicy, values: FileAccessPolicy) {
        self.scopes
            .entry(path)
            .and_modify(|scope| {
                scope.mask &= mask;
                scope.values |= values;
            })
            .or_insert(Scope { mask, values });
    }

    pub fn scope(&self, path: AbsolutePath) -> Option<Scope> {
        self.scopes.get(&path).copied()
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Effective policy at `path`, applying every scope from the root down.
    pub fn policy_for(&self, path: AbsolutePath) -> FileAccessPolicy {
        let mut chain = Vec::new();
        let mut current = path;
        while current.is_valid() {
            chain.push(current);
            current = self.table.parent(current);
        }
        chain
            .iter()
            .rev()
            .fold(self.default_policy, |policy, node| match self.scopes.get(node) {
                Some(scope) => scope.apply(policy),
                None => policy,
            })
    }

    /// Scope paths whose accesses must be reported, in no particular order.
    pub fn reported_scopes(&self) -> impl Iterator<Item = AbsolutePath> + '_ {
        self.scopes
            .keys()
            .copied()
            .filter(|path| self.policy_for(*path).contains(FileAccessPolicy::REPORT_ACCESS))
    }
}

impl std::fmt::Debug for FileAccessManifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (path, scope) in &self.scopes {
            map.entry(&self.table.expand(*path), scope);
        }
        map.finish()
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Orchestrator-side knowledge the synchroniser consults: which content
//! each input file has, and which files a sealed directory holds.

use std::collections::HashMap;

use parking_lot::RwLock;
use remex_pips::{AbsolutePath, ContentHash, DirectoryArtifact, FileArtifact, SealDirectory};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileContentInfo {
    pub hash: ContentHash,
    pub length: u64,
}

#[cfg_attr(test, mockall::automock)]
pub trait FileContentRegistry: Send + Sync {
    /// Content recorded for an input file, if it has been hashed.
    fn try_get_input_content(&self, artifact: FileArtifact) -> Option<FileContentInfo>;
}

#[cfg_attr(test, mockall::automock)]
pub trait SealedDirectoryLister: Send + Sync {
    /// Member files of a sealed directory, or `None` if it is unknown.
    fn list_sealed_directory_contents(&self, directory: DirectoryArtifact) -> Option<Vec<FileArtifact>>;
}

/// Registry fed as the orchestrator hashes files.
#[derive(Debug, Default)]
pub struct ContentRegistry {
    entries: RwLock<HashMap<FileArtifact, FileContentInfo>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, artifact: FileArtifact, info: FileContentInfo) {
        self.entries.write().insert(artifact, info);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl FileContentRegistry for ContentRegistry {
    fn try_get_input_content(&self, artifact: FileArtifact) -> Option<FileContentInfo> {
        self.entries.read().get(&artifact).copied()
    }
}

/// Sealed directory members keyed by the directory's path and seal id.
#[derive(Debug, Default)]
pub struct SealedDirectoryIndex {
    seals: RwLock<HashMap<(AbsolutePath, u32), Vec<FileArtifact>>>,
}

impl SealedDirectoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_seal(&self, seal: &SealDirectory) {
        let key = (seal.directory.path(), seal.directory.partial_seal_id());
        self.seals.write().insert(key, seal.contents.clone());
    }
}

impl SealedDirectoryLister for SealedDirectoryIndex {
    fn list_sealed_directory_contents(&self, directory: DirectoryArtifact) -> Option<Vec<FileArtifact>> {
        self.seals
            .read()
            .get(&(directory.path(), directory.partial_seal_id()))
            .cloned()
    }
}

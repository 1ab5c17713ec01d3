// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File and directory artifacts.

use crate::path::AbsolutePath;

/// A path at a particular write version. Rewrite count 0 is a source file;
/// every declared write of the same path bumps the count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileArtifact {
    path: AbsolutePath,
    rewrite_count: u32,
}

impl FileArtifact {
    pub const INVALID: FileArtifact = FileArtifact {
        path: AbsolutePath::INVALID,
        rewrite_count: 0,
    };

    pub fn new(path: AbsolutePath, rewrite_count: u32) -> Self {
        Self {
            path,
            rewrite_count,
        }
    }

    pub fn source(path: AbsolutePath) -> Self {
        Self::new(path, 0)
    }

    /// First written version of `path`.
    pub fn output(path: AbsolutePath) -> Self {
        Self::new(path, 1)
    }

    pub fn path(&self) -> AbsolutePath {
        self.path
    }

    pub fn rewrite_count(&self) -> u32 {
        self.rewrite_count
    }

    pub fn is_valid(&self) -> bool {
        self.path.is_valid()
    }

    pub fn is_source_file(&self) -> bool {
        self.rewrite_count == 0
    }

    pub fn is_output_file(&self) -> bool {
        self.rewrite_count > 0
    }

    pub fn create_next_written_version(&self) -> Self {
        Self::new(self.path, self.rewrite_count.saturating_add(1))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileExistence {
    /// Must exist when the pip finishes
    #[default]
    Required = 0,
    /// May be deleted by the pip before it finishes
    Temporary = 1,
    Optional = 2,
}

impl FileExistence {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(FileExistence::Required),
            1 => Some(FileExistence::Temporary),
            2 => Some(FileExistence::Optional),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct FileArtifactWithAttributes {
    artifact: FileArtifact,
    existence: FileExistence,
}

impl FileArtifactWithAttributes {
    pub fn new(artifact: FileArtifact, existence: FileExistence) -> Self {
        Self {
            artifact,
            existence,
        }
    }

    pub fn required(artifact: FileArtifact) -> Self {
        Self::new(artifact, FileExistence::Required)
    }

    pub fn artifact(&self) -> FileArtifact {
        self.artifact
    }

    pub fn path(&self) -> AbsolutePath {
        self.artifact.path()
    }

    pub fn existence(&self) -> FileExistence {
        self.existence
    }

    pub fn is_valid(&self) -> bool {
        self.artifact.is_valid()
    }
}

/// A sealed or opaque directory. Members are resolved separately and never
/// enumerated inside the artifact itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryArtifact {
    path: AbsolutePath,
    partial_seal_id: u32,
    is_shared_opaque: bool,
}

impl DirectoryArtifact {
    pub const INVALID: DirectoryArtifact = DirectoryArtifact {
        path: AbsolutePath::INVALID,
        partial_seal_id: 0,
        is_shared_opaque: false,
    };

    pub fn new(path: AbsolutePath, partial_seal_id: u32, is_shared_opaque: bool) -> Self {
        Self {
            path,
            partial_seal_id,
            is_shared_opaque,
        }
    }

    pub fn path(&self) -> AbsolutePath {
        self.path
    }

    pub fn partial_seal_id(&self) -> u32 {
        self.partial_seal_id
    }

    pub fn is_shared_opaque(&self) -> bool {
        self.is_shared_opaque
    }

    pub fn is_valid(&self) -> bool {
        self.path.is_valid()
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Build graph vocabulary shared by the orchestrator and remote agents:
//! interned paths, file and directory artifacts, content hashes, pips, and
//! the [`SerializationContext`] that moves them across the wire.

pub mod artifact;
pub mod codec;
pub mod hash;
pub mod path;
pub mod pip;

pub use artifact::{DirectoryArtifact, FileArtifact, FileArtifactWithAttributes, FileExistence};
pub use codec::{
    content_hash_from_proto, content_hash_to_proto, duration_from_proto, duration_to_proto,
    CodecError, Mode, SerializationContext, WireFormat,
};
pub use hash::{
    hash_bytes, hash_file, hash_reader, ContentHash, ContentHasher, HashError, HashType,
    WellKnownContentHashes, HASH_LENGTH,
};
pub use path::{AbsolutePath, PathError, PathTable};
pub use pip::{
    format_semi_stable_hash, CopyFile, EnvironmentValue, EnvironmentVariable, Pip, PipData,
    PipFragment, PipType, Process, SealDirectory,
};

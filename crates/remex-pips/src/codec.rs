// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Translation between process-local paths and a transmission-scoped wire
//! id space.
//!
//! A [`SerializationContext`] is created per dispatch. In write mode,
//! [`add_path`](SerializationContext::add_path) assigns dense wire ids and
//! records one `{id, parent, name}` entry per unseen path component, parents
//! first. The receiver rebuilds those entries into its own [`PathTable`] with
//! [`receive_path_table`](SerializationContext::receive_path_table) and
//! resolves ids with [`path_from_proto`](SerializationContext::path_from_proto).
//!
//! Calling an operation in the wrong mode is a bug in the caller and panics.
//! Malformed tables from the wire are reported as [`CodecError`].

use std::collections::HashMap;
use std::time::Duration;

use remex_proto as proto;
use thiserror::Error;
use tracing::trace;

use crate::artifact::{DirectoryArtifact, FileArtifact, FileArtifactWithAttributes, FileExistence};
use crate::hash::{ContentHash, HashError};
use crate::path::{AbsolutePath, PathTable};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("wire path id {0} is not defined by the received path table")]
    UnknownPathId(u32),

    #[error("path entry {id} references parent {parent} before it was defined")]
    ParentNotYetDefined { id: u32, parent: u32 },

    #[error("path entry id {0} appears more than once")]
    DuplicatePathId(u32),

    #[error("path entry {id} has invalid name {name:?}")]
    InvalidName { id: u32, name: String },

    #[error("invalid {field} value {value}")]
    InvalidValue { field: &'static str, value: u64 },

    #[error("invalid content hash: {0}")]
    Hash(#[from] HashError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Uninitialized,
    Read,
    Write,
}

pub struct SerializationContext {
    path_table: PathTable,
    mode: Mode,
    next_wire_id: u32,
    local_to_wire: HashMap<AbsolutePath, u32>,
    wire_to_local: HashMap<u32, AbsolutePath>,
    outgoing: Vec<proto::AbsolutePath>,
}

impl SerializationContext {
    /// Starts in write mode with wire ids beginning at 1.
    pub fn new(path_table: PathTable) -> Self {
        Self {
            path_table,
            mode: Mode::Write,
            next_wire_id: 1,
            local_to_wire: HashMap::new(),
            wire_to_local: HashMap::new(),
            outgoing: Vec::new(),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn path_table(&self) -> &PathTable {
        &self.path_table
    }

    fn expect_mode(&self, expected: Mode, operation: &str) {
        assert_eq!(
            self.mode, expected,
            "{} called in {:?} mode, requires {:?}",
            operation, self.mode, expected
        );
    }

    /// Wire id for `path`, encoding any unseen ancestors first. Returns 0 for
    /// the invalid path.
    pub fn add_path(&mut self, path: AbsolutePath) -> u32 {
        self.expect_mode(Mode::Write, "add_path");
        if !path.is_valid() {
            return 0;
        }
        if let Some(&id) = self.local_to_wire.get(&path) {
            return id;
        }

        let mut pending = Vec::new();
        let mut cursor = path;
        while cursor.is_valid() && !self.local_to_wire.contains_key(&cursor) {
            pending.push(cursor);
            cursor = self.path_table.parent(cursor);
        }

        let mut parent_id = self.local_to_wire.get(&cursor).copied().unwrap_or(0);
        for local in pending.into_iter().rev() {
            let id = self.next_wire_id;
            self.next_wire_id += 1;
            let name = self.path_table.name(local).unwrap_or_default();
            self.outgoing.push(proto::AbsolutePath {
                id,
                parent: parent_id,
                name: name.into_bytes(),
            });
            self.local_to_wire.insert(local, id);
            self.wire_to_local.insert(id, local);
            parent_id = id;
        }
        parent_id
    }

    /// Local path for a received wire id. Id 0 is the invalid path.
    pub fn path_from_proto(&self, id: u32) -> Result<AbsolutePath, CodecError> {
        self.expect_mode(Mode::Read, "path_from_proto");
        if id == 0 {
            return Ok(AbsolutePath::INVALID);
        }
        self.wire_to_local.get(&id).copied().ok_or(CodecError::UnknownPathId(id))
    }

    /// Consumes a complete wire table and switches to read mode. Each
    /// transmission is self-contained: mappings from earlier tables are
    /// dropped. On error the context is left unchanged.
    pub fn receive_path_table(&mut self, table: &proto::PathTable) -> Result<(), CodecError> {
        assert_ne!(self.mode, Mode::Read, "receive_path_table called twice without resetting");

        let mut wire_to_local = HashMap::with_capacity(table.paths.len());
        let mut local_to_wire = HashMap::with_capacity(table.paths.len());
        let mut max_id = 0;

        for entry in &table.paths {
            if entry.id == 0 {
                continue;
            }
            if wire_to_local.contains_key(&entry.id) {
                return Err(CodecError::DuplicatePathId(entry.id));
            }

            let invalid_name = || CodecError::InvalidName {
                id: entry.id,
                name: String::from_utf8_lossy(&entry.name).into_owned(),
            };
            let name = std::str::from_utf8(&entry.name).map_err(|_| invalid_name())?;

            let local = if entry.parent == 0 {
                self.path_table.root(name).map_err(|_| invalid_name())?
            } else {
                let parent = wire_to_local.get(&entry.parent).copied().ok_or(
                    CodecError::ParentNotYetDefined {
                        id: entry.id,
                        parent: entry.parent,
                    },
                )?;
                self.path_table.combine(parent, name).map_err(|_| invalid_name())?
            };

            wire_to_local.insert(entry.id, local);
            local_to_wire.insert(local, entry.id);
            max_id = max_id.max(entry.id);
        }

        trace!(entries = table.paths.len(), "received path table");
        self.wire_to_local = wire_to_local;
        self.local_to_wire = local_to_wire;
        self.outgoing.clear();
        self.next_wire_id = self
            .next_wire_id
            .max(table.next_local_path_id)
            .max(max_id.saturating_add(1));
        self.mode = Mode::Read;
        Ok(())
    }

    /// Starts a fresh outgoing table. The id counter keeps counting so ids
    /// in the next table never collide with ones seen before.
    pub fn prepare_path_table_for_write(&mut self) {
        self.outgoing.clear();
        self.local_to_wire.clear();
        self.wire_to_local.clear();
        self.mode = Mode::Write;
    }

    /// Hands out the accumulated table and leaves write mode.
    pub fn send_path_table(&mut self) -> proto::PathTable {
        self.expect_mode(Mode::Write, "send_path_table");
        self.mode = Mode::Uninitialized;
        proto::PathTable {
            paths: std::mem::take(&mut self.outgoing),
            next_local_path_id: self.next_wire_id,
        }
    }

    pub fn to_proto_seq<T: WireFormat>(&mut self, items: &[T]) -> Vec<T::Proto> {
        items.iter().map(|item| item.to_proto(self)).collect()
    }

    pub fn from_proto_seq<T: WireFormat>(&self, items: &[T::Proto]) -> Result<Vec<T>, CodecError> {
        items.iter().map(|item| T::from_proto(item, self)).collect()
    }
}

/// Conversion to and from a wire message through a [`SerializationContext`].
pub trait WireFormat: Sized {
    type Proto;

    fn to_proto(&self, ctx: &mut SerializationContext) -> Self::Proto;

    fn from_proto(proto: &Self::Proto, ctx: &SerializationContext) -> Result<Self, CodecError>;
}

impl WireFormat for AbsolutePath {
    type Proto = u32;

    fn to_proto(&self, ctx: &mut SerializationContext) -> u32 {
        ctx.add_path(*self)
    }

    fn from_proto(proto: &u32, ctx: &SerializationContext) -> Result<Self, CodecError> {
        ctx.path_from_proto(*proto)
    }
}

impl WireFormat for FileArtifact {
    type Proto = proto::FileArtifact;

    fn to_proto(&self, ctx: &mut SerializationContext) -> Self::Proto {
        if !self.is_valid() {
            return proto::FileArtifact::default();
        }
        proto::FileArtifact {
            path_id: ctx.add_path(self.path()),
            rewrite_count: self.rewrite_count(),
        }
    }

    fn from_proto(proto: &Self::Proto, ctx: &SerializationContext) -> Result<Self, CodecError> {
        if proto.path_id == 0 {
            return Ok(FileArtifact::INVALID);
        }
        Ok(FileArtifact::new(ctx.path_from_proto(proto.path_id)?, proto.rewrite_count))
    }
}

impl WireFormat for FileArtifactWithAttributes {
    type Proto = proto::FileArtifactWithAttributes;

    fn to_proto(&self, ctx: &mut SerializationContext) -> Self::Proto {
        if !self.is_valid() {
            return proto::FileArtifactWithAttributes::default();
        }
        let artifact = self.artifact().to_proto(ctx);
        proto::FileArtifactWithAttributes {
            path_id: artifact.path_id,
            rewrite_count: artifact.rewrite_count,
            file_existence: self.existence() as u8,
        }
    }

    fn from_proto(proto: &Self::Proto, ctx: &SerializationContext) -> Result<Self, CodecError> {
        let artifact = FileArtifact::from_proto(
            &proto::FileArtifact {
                path_id: proto.path_id,
                rewrite_count: proto.rewrite_count,
            },
            ctx,
        )?;
        let existence =
            FileExistence::from_wire(proto.file_existence).ok_or(CodecError::InvalidValue {
                field: "file_existence",
                value: proto.file_existence as u64,
            })?;
        Ok(FileArtifactWithAttributes::new(artifact, existence))
    }
}

impl WireFormat for DirectoryArtifact {
    type Proto = proto::DirectoryArtifact;

    fn to_proto(&self, ctx: &mut SerializationContext) -> Self::Proto {
        if !self.is_valid() {
            return proto::DirectoryArtifact::default();
        }
        proto::DirectoryArtifact {
            path_id: ctx.add_path(self.path()),
            partial_seal_id: self.partial_seal_id(),
            is_shared: self.is_shared_opaque(),
        }
    }

    fn from_proto(proto: &Self::Proto, ctx: &SerializationContext) -> Result<Self, CodecError> {
        if proto.path_id == 0 {
            return Ok(DirectoryArtifact::INVALID);
        }
        Ok(DirectoryArtifact::new(
            ctx.path_from_proto(proto.path_id)?,
            proto.partial_seal_id,
            proto.is_shared,
        ))
    }
}

impl WireFormat for ContentHash {
    type Proto = proto::ContentHashAndHashTypeData;

    fn to_proto(&self, _ctx: &mut SerializationContext) -> Self::Proto {
        content_hash_to_proto(self)
    }

    fn from_proto(proto: &Self::Proto, _ctx: &SerializationContext) -> Result<Self, CodecError> {
        Ok(content_hash_from_proto(proto)?)
    }
}

/// Content hashes carry no paths, so they also convert without a context.
pub fn content_hash_to_proto(hash: &ContentHash) -> proto::ContentHashAndHashTypeData {
    proto::ContentHashAndHashTypeData {
        hash_type: hash.hash_type().to_wire(),
        content_hash: hash.as_bytes().to_vec(),
    }
}

pub fn content_hash_from_proto(
    proto: &proto::ContentHashAndHashTypeData,
) -> Result<ContentHash, HashError> {
    ContentHash::from_wire(proto.hash_type, &proto.content_hash)
}

/// Durations travel as whole milliseconds; 0 means "not set".
pub fn duration_to_proto(duration: Option<Duration>) -> u64 {
    duration.map(|d| (d.as_millis() as u64).max(1)).unwrap_or(0)
}

pub fn duration_from_proto(millis: u64) -> Option<Duration> {
    (millis != 0).then(|| Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: u32, parent: u32, name: &str) -> proto::AbsolutePath {
        proto::AbsolutePath {
            id,
            parent,
            name: name.as_bytes().to_vec(),
        }
    }

    #[remex_test_utils::logged_test]
    fn add_path_emits_parents_first_and_dedups() {
        let table = PathTable::new();
        let c = table.create("/a/b/c").unwrap();
        let d = table.create("/a/b/d").unwrap();

        let mut ctx = SerializationContext::new(table);
        let c_id = ctx.add_path(c);
        let d_id = ctx.add_path(d);
        assert_eq!(ctx.add_path(c), c_id);

        let wire = ctx.send_path_table();
        let names: Vec<_> = wire.paths.iter().map(|p| String::from_utf8_lossy(&p.name)).collect();
        assert_eq!(names, ["/", "a", "b", "c", "d"]);
        assert_eq!(wire.paths[3].parent, wire.paths[2].id);
        assert_eq!(wire.paths[4].parent, wire.paths[2].id);
        assert_eq!((c_id, d_id), (4, 5));
        assert_eq!(wire.next_local_path_id, 6);
        assert_eq!(ctx.mode(), Mode::Uninitialized);
    }

    #[remex_test_utils::logged_test]
    fn invalid_path_is_wire_zero_both_ways() {
        let mut ctx = SerializationContext::new(PathTable::new());
        assert_eq!(ctx.add_path(AbsolutePath::INVALID), 0);
        let wire = ctx.send_path_table();
        assert!(wire.paths.is_empty());

        let mut reader = SerializationContext::new(PathTable::new());
        reader.receive_path_table(&wire).unwrap();
        assert_eq!(reader.path_from_proto(0).unwrap(), AbsolutePath::INVALID);
    }

    #[remex_test_utils::logged_test]
    fn receive_rebuilds_paths_in_a_separate_table() {
        let sender_table = PathTable::new();
        // Shift local ids so they cannot coincide with wire ids.
        sender_table.create("/unrelated/noise").unwrap();
        let source = sender_table.create("/src/main.c").unwrap();

        let mut sender = SerializationContext::new(sender_table.clone());
        let wire_id = sender.add_path(source);
        let wire = sender.send_path_table();

        let receiver_table = PathTable::new();
        let mut receiver = SerializationContext::new(receiver_table.clone());
        receiver.receive_path_table(&wire).unwrap();
        let received = receiver.path_from_proto(wire_id).unwrap();

        assert_eq!(receiver_table.expand(received), "/src/main.c");
        assert_eq!(receiver_table.len(), 3);
    }

    #[remex_test_utils::logged_test]
    fn child_before_parent_is_a_protocol_violation() {
        let wire = proto::PathTable {
            paths: vec![entry(2, 1, "a"), entry(1, 0, "/")],
            next_local_path_id: 3,
        };
        let mut ctx = SerializationContext::new(PathTable::new());
        assert_eq!(
            ctx.receive_path_table(&wire),
            Err(CodecError::ParentNotYetDefined { id: 2, parent: 1 })
        );
        assert_eq!(ctx.mode(), Mode::Write, "failed receive leaves the context untouched");
    }

    #[remex_test_utils::logged_test]
    fn duplicate_ids_and_bad_names_are_rejected() {
        let duplicate = proto::PathTable {
            paths: vec![entry(1, 0, "/"), entry(1, 0, "/")],
            next_local_path_id: 2,
        };
        let mut ctx = SerializationContext::new(PathTable::new());
        assert_eq!(ctx.receive_path_table(&duplicate), Err(CodecError::DuplicatePathId(1)));

        let bad_name = proto::PathTable {
            paths: vec![entry(1, 0, "/"), entry(2, 1, "x/y")],
            next_local_path_id: 3,
        };
        assert!(matches!(
            ctx.receive_path_table(&bad_name),
            Err(CodecError::InvalidName { id: 2, .. })
        ));
    }

    #[remex_test_utils::logged_test]
    fn unknown_id_lookup_fails() {
        let mut ctx = SerializationContext::new(PathTable::new());
        ctx.receive_path_table(&proto::PathTable::default()).unwrap();
        assert_eq!(ctx.path_from_proto(7), Err(CodecError::UnknownPathId(7)));
    }

    #[remex_test_utils::logged_test]
    fn id_zero_entries_are_skipped() {
        let wire = proto::PathTable {
            paths: vec![entry(0, 0, "ignored"), entry(1, 0, "/")],
            next_local_path_id: 2,
        };
        let mut ctx = SerializationContext::new(PathTable::new());
        ctx.receive_path_table(&wire).unwrap();
        assert!(ctx.path_from_proto(1).unwrap().is_valid());
    }

    #[remex_test_utils::logged_test]
    fn response_ids_continue_after_request_ids() {
        let table = PathTable::new();
        let wire = proto::PathTable {
            paths: vec![entry(1, 0, "/"), entry(2, 1, "out")],
            next_local_path_id: 3,
        };
        let mut ctx = SerializationContext::new(table.clone());
        ctx.receive_path_table(&wire).unwrap();
        let out = ctx.path_from_proto(2).unwrap();

        ctx.prepare_path_table_for_write();
        let file = table.combine(out, "a.txt").unwrap();
        let file_id = ctx.add_path(file);
        let response = ctx.send_path_table();

        assert_eq!(response.paths.len(), 3, "the response table is self-contained");
        assert!(response.paths.iter().all(|p| p.id >= 3));
        assert_eq!(response.paths.last().map(|p| p.id), Some(file_id));
    }

    #[remex_test_utils::logged_test]
    #[should_panic(expected = "path_from_proto called in Write mode")]
    fn lookup_in_write_mode_panics() {
        let ctx = SerializationContext::new(PathTable::new());
        let _ = ctx.path_from_proto(1);
    }

    #[remex_test_utils::logged_test]
    #[should_panic(expected = "add_path called in Read mode")]
    fn add_in_read_mode_panics() {
        let table = PathTable::new();
        let path = table.create("/x").unwrap();
        let mut ctx = SerializationContext::new(table);
        ctx.receive_path_table(&proto::PathTable::default()).unwrap();
        ctx.add_path(path);
    }

    #[remex_test_utils::logged_test]
    fn invalid_artifacts_encode_as_default_protos() {
        let mut ctx = SerializationContext::new(PathTable::new());
        assert_eq!(FileArtifact::INVALID.to_proto(&mut ctx), proto::FileArtifact::default());
        assert_eq!(
            DirectoryArtifact::INVALID.to_proto(&mut ctx),
            proto::DirectoryArtifact::default()
        );
    }

    #[remex_test_utils::logged_test]
    fn artifact_attributes_survive_the_wire() {
        let table = PathTable::new();
        let path = table.create("/out/log.txt").unwrap();
        let dir = table.create("/out/objs").unwrap();
        let output = FileArtifactWithAttributes::new(FileArtifact::new(path, 3), FileExistence::Optional);
        let directory = DirectoryArtifact::new(dir, 9, true);

        let mut writer = SerializationContext::new(table);
        let output_proto = output.to_proto(&mut writer);
        let directory_proto = directory.to_proto(&mut writer);
        let wire = writer.send_path_table();

        let remote = PathTable::new();
        let mut reader = SerializationContext::new(remote.clone());
        reader.receive_path_table(&wire).unwrap();
        let output_back = FileArtifactWithAttributes::from_proto(&output_proto, &reader).unwrap();
        let directory_back = DirectoryArtifact::from_proto(&directory_proto, &reader).unwrap();

        assert_eq!(remote.expand(output_back.path()), "/out/log.txt");
        assert_eq!(output_back.artifact().rewrite_count(), 3);
        assert_eq!(output_back.existence(), FileExistence::Optional);
        assert_eq!(remote.expand(directory_back.path()), "/out/objs");
        assert_eq!(directory_back.partial_seal_id(), 9);
        assert!(directory_back.is_shared_opaque());
    }

    #[remex_test_utils::logged_test]
    fn out_of_range_file_existence_is_rejected() {
        let mut ctx = SerializationContext::new(PathTable::new());
        ctx.receive_path_table(&proto::PathTable::default()).unwrap();
        let bad = proto::FileArtifactWithAttributes {
            path_id: 0,
            rewrite_count: 0,
            file_existence: 7,
        };
        assert!(matches!(
            FileArtifactWithAttributes::from_proto(&bad, &ctx),
            Err(CodecError::InvalidValue { field: "file_existence", .. })
        ));
    }

    #[remex_test_utils::logged_test]
    fn durations_use_zero_for_none() {
        assert_eq!(duration_to_proto(None), 0);
        assert_eq!(duration_to_proto(Some(Duration::from_secs(2))), 2000);
        assert_eq!(duration_to_proto(Some(Duration::from_micros(10))), 1);
        assert_eq!(duration_from_proto(0), None);
        assert_eq!(duration_from_proto(1500), Some(Duration::from_millis(1500)));
    }
}

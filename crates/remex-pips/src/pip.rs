// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Pips: the schedulable units of build work.

use std::fmt;
use std::time::Duration;

use remex_proto as proto;

use crate::artifact::{DirectoryArtifact, FileArtifact, FileArtifactWithAttributes};
use crate::codec::{duration_from_proto, duration_to_proto, CodecError, SerializationContext, WireFormat};
use crate::path::{AbsolutePath, PathTable};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PipType {
    Process,
    CopyFile,
    SealDirectory,
}

impl fmt::Display for PipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipType::Process => "Process",
            PipType::CopyFile => "CopyFile",
            PipType::SealDirectory => "SealDirectory",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipFragment {
    Literal(String),
    Path(AbsolutePath),
}

/// Text with embedded path references, rendered against a [`PathTable`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipData {
    fragments: Vec<PipFragment>,
}

impl PipData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn literal(text: impl Into<String>) -> Self {
        Self::new().with_literal(text)
    }

    pub fn path(path: AbsolutePath) -> Self {
        Self::new().with_path(path)
    }

    pub fn with_literal(mut self, text: impl Into<String>) -> Self {
        self.fragments.push(PipFragment::Literal(text.into()));
        self
    }

    pub fn with_path(mut self, path: AbsolutePath) -> Self {
        self.fragments.push(PipFragment::Path(path));
        self
    }

    pub fn fragments(&self) -> &[PipFragment] {
        &self.fragments
    }

    pub fn render(&self, table: &PathTable) -> String {
        let mut text = String::new();
        for fragment in &self.fragments {
            match fragment {
                PipFragment::Literal(s) => text.push_str(s),
                PipFragment::Path(p) => text.push_str(&table.expand(*p)),
            }
        }
        text
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvironmentValue {
    /// Copied from the executing host's environment
    PassThrough,
    Value(PipData),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvironmentVariable {
    pub name: String,
    pub value: EnvironmentValue,
}

impl EnvironmentVariable {
    pub fn value(name: impl Into<String>, value: PipData) -> Self {
        Self {
            name: name.into(),
            value: EnvironmentValue::Value(value),
        }
    }

    pub fn pass_through(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: EnvironmentValue::PassThrough,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Process {
    pub semi_stable_hash: u64,
    pub executable: FileArtifact,
    pub arguments: Vec<PipData>,
    pub working_directory: AbsolutePath,
    pub dependencies: Vec<FileArtifact>,
    pub directory_dependencies: Vec<DirectoryArtifact>,
    pub outputs: Vec<FileArtifactWithAttributes>,
    pub directory_outputs: Vec<DirectoryArtifact>,
    pub environment: Vec<EnvironmentVariable>,
    /// `None` uses the executor's default
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyFile {
    pub semi_stable_hash: u64,
    pub source: FileArtifact,
    pub destination: FileArtifact,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SealDirectory {
    pub semi_stable_hash: u64,
    pub directory: DirectoryArtifact,
    pub contents: Vec<FileArtifact>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pip {
    Process(Process),
    CopyFile(CopyFile),
    SealDirectory(SealDirectory),
}

impl Pip {
    pub fn pip_type(&self) -> PipType {
        match self {
            Pip::Process(_) => PipType::Process,
            Pip::CopyFile(_) => PipType::CopyFile,
            Pip::SealDirectory(_) => PipType::SealDirectory,
        }
    }

    pub fn semi_stable_hash(&self) -> u64 {
        match self {
            Pip::Process(p) => p.semi_stable_hash,
            Pip::CopyFile(p) => p.semi_stable_hash,
            Pip::SealDirectory(p) => p.semi_stable_hash,
        }
    }

    /// Short display form used in logs, e.g. `Pip00000000000000A1`.
    pub fn formatted_semi_stable_hash(&self) -> String {
        format_semi_stable_hash(self.semi_stable_hash())
    }

    pub fn as_process(&self) -> Option<&Process> {
        match self {
            Pip::Process(p) => Some(p),
            _ => None,
        }
    }
}

pub fn format_semi_stable_hash(hash: u64) -> String {
    format!("Pip{:016X}", hash)
}

impl WireFormat for PipData {
    type Proto = proto::PipData;

    fn to_proto(&self, ctx: &mut SerializationContext) -> Self::Proto {
        let fragments = self
            .fragments
            .iter()
            .map(|fragment| match fragment {
                PipFragment::Literal(s) => proto::PipFragment::Literal(s.as_bytes().to_vec()),
                PipFragment::Path(p) => proto::PipFragment::Path(ctx.add_path(*p)),
            })
            .collect();
        proto::PipData { fragments }
    }

    fn from_proto(proto: &Self::Proto, ctx: &SerializationContext) -> Result<Self, CodecError> {
        let fragments = proto
            .fragments
            .iter()
            .map(|fragment| match fragment {
                proto::PipFragment::Literal(bytes) => {
                    Ok(PipFragment::Literal(String::from_utf8_lossy(bytes).into_owned()))
                }
                proto::PipFragment::Path(id) => ctx.path_from_proto(*id).map(PipFragment::Path),
            })
            .collect::<Result<_, _>>()?;
        Ok(PipData { fragments })
    }
}

impl WireFormat for EnvironmentVariable {
    type Proto = proto::EnvironmentVariable;

    fn to_proto(&self, ctx: &mut SerializationContext) -> Self::Proto {
        let (is_pass_through, value) = match &self.value {
            EnvironmentValue::PassThrough => (true, proto::PipData::default()),
            EnvironmentValue::Value(data) => (false, data.to_proto(ctx)),
        };
        proto::EnvironmentVariable {
            name: self.name.as_bytes().to_vec(),
            is_pass_through,
            value,
        }
    }

    fn from_proto(proto: &Self::Proto, ctx: &SerializationContext) -> Result<Self, CodecError> {
        let value = if proto.is_pass_through {
            EnvironmentValue::PassThrough
        } else {
            EnvironmentValue::Value(PipData::from_proto(&proto.value, ctx)?)
        };
        Ok(EnvironmentVariable {
            name: String::from_utf8_lossy(&proto.name).into_owned(),
            value,
        })
    }
}

impl WireFormat for Process {
    type Proto = proto::Process;

    fn to_proto(&self, ctx: &mut SerializationContext) -> Self::Proto {
        proto::Process {
            semi_stable_hash: self.semi_stable_hash,
            executable: self.executable.to_proto(ctx),
            arguments: ctx.to_proto_seq(&self.arguments),
            working_directory: ctx.add_path(self.working_directory),
            dependencies: ctx.to_proto_seq(&self.dependencies),
            directory_dependencies: ctx.to_proto_seq(&self.directory_dependencies),
            file_outputs: ctx.to_proto_seq(&self.outputs),
            directory_outputs: ctx.to_proto_seq(&self.directory_outputs),
            environment_variables: ctx.to_proto_seq(&self.environment),
            timeout_ms: duration_to_proto(self.timeout),
        }
    }

    fn from_proto(proto: &Self::Proto, ctx: &SerializationContext) -> Result<Self, CodecError> {
        Ok(Process {
            semi_stable_hash: proto.semi_stable_hash,
            executable: FileArtifact::from_proto(&proto.executable, ctx)?,
            arguments: ctx.from_proto_seq(&proto.arguments)?,
            working_directory: ctx.path_from_proto(proto.working_directory)?,
            dependencies: ctx.from_proto_seq(&proto.dependencies)?,
            directory_dependencies: ctx.from_proto_seq(&proto.directory_dependencies)?,
            outputs: ctx.from_proto_seq(&proto.file_outputs)?,
            directory_outputs: ctx.from_proto_seq(&proto.directory_outputs)?,
            environment: ctx.from_proto_seq(&proto.environment_variables)?,
            timeout: duration_from_proto(proto.timeout_ms),
        })
    }
}

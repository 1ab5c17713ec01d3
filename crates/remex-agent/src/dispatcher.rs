// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Turns a received `RunProcess` call into a sandboxed, hashed execution.
//!
//! Each dispatch moves through [`DispatchPhase`] in order:
//! decode the path table and pip, build the access manifest, run the
//! process, hash what it wrote, and re-encode a response table that only
//! holds the paths the response refers to.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use remex_cas::{CasError, ContentStore};
use remex_pips::{
    content_hash_to_proto, format_semi_stable_hash, AbsolutePath, CodecError, ContentHash,
    DirectoryArtifact, EnvironmentValue, FileArtifact, HashType, PathError, PathTable, Process,
    SerializationContext, WireFormat,
};
use remex_proto::{
    exit_code_to_wire, BuildRequest, BuildResponse, BuildStatus, DispatchErrorCode, OutputFile,
};
use remex_sandbox::{
    FileAccessManifest, FileAccessPolicy, ProcessStatus, Sandbox, SandboxError, SandboxedProcessInfo,
    SandboxedProcessResult, DEFAULT_OUTPUT_CAPTURE_BYTES,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPhase {
    Received,
    Decoded,
    PolicyBuilt,
    Executing,
    Completed,
    Encoded,
}

#[derive(Error, Debug)]
pub enum DispatchFailure {
    #[error("malformed request: {0}")]
    Codec(#[from] CodecError),

    #[error("malformed path: {0}")]
    Path(#[from] PathError),

    #[error("sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to store output {path}: {source}")]
    StoreOutput {
        path: PathBuf,
        #[source]
        source: CasError,
    },

    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchFailure {
    pub fn code(&self) -> DispatchErrorCode {
        match self {
            DispatchFailure::Codec(_) | DispatchFailure::Path(_) => DispatchErrorCode::ProtocolViolation,
            DispatchFailure::Sandbox(_) | DispatchFailure::Prepare { .. } => {
                DispatchErrorCode::SandboxInfrastructureFailure
            }
            DispatchFailure::StoreOutput { .. } => DispatchErrorCode::Internal,
            DispatchFailure::Cancelled => DispatchErrorCode::Cancelled,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub default_timeout: Duration,
    pub hash_type: HashType,
    pub output_capture_bytes: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(crate::config::DEFAULT_TIMEOUT_SECS),
            hash_type: HashType::default(),
            output_capture_bytes: DEFAULT_OUTPUT_CAPTURE_BYTES,
        }
    }
}

/// What the sandbox may touch and which artifact each declared output
/// path resolves to.
#[derive(Debug)]
pub struct AccessPlan {
    pub manifest: FileAccessManifest,
    /// Declared outputs by path. A path that is also a dependency maps to
    /// the dependency's next written version.
    pub outputs: HashMap<AbsolutePath, FileArtifact>,
    pub output_directories: Vec<DirectoryArtifact>,
}

impl AccessPlan {
    /// Output artifact for a written `path`, if it is part of the output
    /// contract at all.
    pub fn output_for(&self, table: &PathTable, path: AbsolutePath) -> Option<FileArtifact> {
        if let Some(artifact) = self.outputs.get(&path) {
            return Some(*artifact);
        }
        self.output_directories
            .iter()
            .any(|dir| table.is_within(path, dir.path()))
            .then(|| FileArtifact::output(path))
    }
}

fn output_policy() -> (FileAccessPolicy, FileAccessPolicy) {
    (
        !FileAccessPolicy::REPORT_ACCESS,
        FileAccessPolicy::ALLOW_ALL
            | FileAccessPolicy::REPORT_ACCESS
            | FileAccessPolicy::ALLOW_REAL_INPUT_TIMESTAMPS,
    )
}

fn input_policy() -> (FileAccessPolicy, FileAccessPolicy) {
    (
        !FileAccessPolicy::REPORT_ACCESS & !FileAccessPolicy::ALLOW_REAL_INPUT_TIMESTAMPS,
        FileAccessPolicy::ALLOW_READ | FileAccessPolicy::ALLOW_READ_IF_NONEXISTENT,
    )
}

/// Classifies every declared path before the process starts. Outputs win
/// over dependencies on the same path.
pub fn build_access_plan(table: &PathTable, process: &Process) -> AccessPlan {
    let mut manifest = FileAccessManifest::new(table.clone());
    let mut outputs = HashMap::new();

    let (out_mask, out_values) = output_policy();
    for output in &process.outputs {
        outputs.insert(output.path(), output.artifact());
        manifest.add_scope(output.path(), out_mask, out_values);
    }
    for dir in &process.directory_outputs {
        manifest.add_scope(dir.path(), out_mask, out_values);
    }

    let (in_mask, in_values) = input_policy();
    for dependency in std::iter::once(&process.executable).chain(&process.dependencies) {
        if !dependency.is_valid() {
            continue;
        }
        if let Some(declared) = outputs.get_mut(&dependency.path()) {
            *declared = dependency.create_next_written_version();
            continue;
        }
        manifest.add_scope(dependency.path(), in_mask, in_values);
    }
    for dir in &process.directory_dependencies {
        if !outputs.contains_key(&dir.path()) {
            manifest.add_scope(dir.path(), in_mask, in_values);
        }
    }

    AccessPlan {
        manifest,
        outputs,
        output_directories: process.directory_outputs.clone(),
    }
}

/// Decodes a request into a path table of its own, so nothing a dispatch
/// interns outlives it.
fn decode_request(request: &BuildRequest) -> Result<(SerializationContext, Process), DispatchFailure> {
    let mut ctx = SerializationContext::new(PathTable::new());
    ctx.receive_path_table(&request.path_table)?;
    let process = Process::from_proto(&request.process, &ctx)?;
    Ok((ctx, process))
}

/// Executes remote pips against a local content store and sandbox.
pub struct RemoteExecutionDispatcher {
    store: Arc<dyn ContentStore>,
    sandbox: Arc<dyn Sandbox>,
    settings: DispatcherSettings,
}

struct ProducedOutput {
    artifact: FileArtifact,
    hash: ContentHash,
    length: u64,
}

impl RemoteExecutionDispatcher {
    pub fn new(store: Arc<dyn ContentStore>, sandbox: Arc<dyn Sandbox>, settings: DispatcherSettings) -> Self {
        Self {
            store,
            sandbox,
            settings,
        }
    }

    pub async fn run_process(
        &self,
        request: BuildRequest,
        cancel: CancellationToken,
    ) -> Result<BuildResponse, DispatchFailure> {
        let trace_id = request.header.trace_id_lossy();
        let pip = format_semi_stable_hash(request.process.semi_stable_hash);
        let span = info_span!("dispatch", trace_id = %trace_id, pip = %pip);
        async move {
            let result = self.dispatch(request, cancel).await;
            match &result {
                Ok(response) => info!(
                    operation = "dispatch",
                    status = response.status,
                    outputs = response.output_file.len(),
                    "dispatch finished"
                ),
                Err(e) => error!(operation = "dispatch", code = ?e.code(), error = %e, "dispatch failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        request: BuildRequest,
        cancel: CancellationToken,
    ) -> Result<BuildResponse, DispatchFailure> {
        enter(DispatchPhase::Received);
        let (mut ctx, process) = decode_request(&request)?;
        let table = ctx.path_table().clone();
        enter(DispatchPhase::Decoded);

        let plan = build_access_plan(&table, &process);
        enter(DispatchPhase::PolicyBuilt);

        prepare_directories(&table, &process).await?;
        let info = self.render(&table, &process, plan.manifest.clone());
        enter(DispatchPhase::Executing);
        let result = self.sandbox.run(info, cancel.clone()).await?;
        if result.status == ProcessStatus::Cancelled || cancel.is_cancelled() {
            return Err(DispatchFailure::Cancelled);
        }
        enter(DispatchPhase::Completed);

        let produced = match result.status {
            ProcessStatus::Exited => self.collect_outputs(&table, &plan, &result).await?,
            // Outputs of a killed process are not part of any contract.
            _ => Vec::new(),
        };

        ctx.prepare_path_table_for_write();
        let output_file = produced
            .iter()
            .map(|output| OutputFile {
                file: output.artifact.to_proto(&mut ctx),
                content_hash: content_hash_to_proto(&output.hash),
                length: output.length,
            })
            .collect();
        let path_table = ctx.send_path_table();
        enter(DispatchPhase::Encoded);

        let status = match result.status {
            ProcessStatus::TimedOut => BuildStatus::TimedOut,
            _ if result.exit_code == 0 => BuildStatus::Succeeded,
            _ => BuildStatus::ExecutionFailed,
        };
        Ok(BuildResponse {
            exit_code: exit_code_to_wire(result.exit_code),
            status: status as u8,
            output_file,
            path_table,
            standard_output: result.stdout.bytes,
            standard_error: result.stderr.bytes,
            execution_time_ms: result.duration.as_millis() as u64,
        })
    }

    fn render(&self, table: &PathTable, process: &Process, manifest: FileAccessManifest) -> SandboxedProcessInfo {
        let environment = process
            .environment
            .iter()
            .filter_map(|var| match &var.value {
                EnvironmentValue::PassThrough => std::env::var(&var.name).ok().map(|v| (var.name.clone(), v)),
                EnvironmentValue::Value(data) => Some((var.name.clone(), data.render(table))),
            })
            .collect();

        SandboxedProcessInfo {
            executable: table.to_path_buf(process.executable.path()),
            arguments: process.arguments.iter().map(|arg| arg.render(table)).collect(),
            working_directory: table.to_path_buf(process.working_directory),
            environment,
            manifest,
            timeout: process.timeout.unwrap_or(self.settings.default_timeout),
            output_capture_bytes: self.settings.output_capture_bytes,
        }
    }

    /// Hashes every written file that belongs to the output contract, once
    /// per path, and stores its content.
    async fn collect_outputs(
        &self,
        table: &PathTable,
        plan: &AccessPlan,
        result: &SandboxedProcessResult,
    ) -> Result<Vec<ProducedOutput>, DispatchFailure> {
        let mut seen = HashSet::new();
        let mut produced = Vec::new();

        for access in result.file_accesses.iter().filter(|a| a.is_write()) {
            let path = if access.manifest_path.is_valid() {
                access.manifest_path
            } else {
                match table.from_path(&access.path) {
                    Ok(path) => path,
                    // Names the wire table cannot carry are not reportable.
                    Err(e) => {
                        warn!(
                            operation = "collect_output",
                            path = %access.path.display(),
                            error = %e,
                            "skipping write that cannot be named"
                        );
                        continue;
                    }
                }
            };
            let Some(artifact) = plan.output_for(table, path) else {
                continue;
            };
            if !seen.insert(path) {
                continue;
            }

            let (hash, length) = self.store_output(&access.path).await?;
            debug!(
                operation = "collect_output",
                path = %access.path.display(),
                rewrite_count = artifact.rewrite_count(),
                hash = %hash,
                length,
                "output stored"
            );
            produced.push(ProducedOutput {
                artifact,
                hash,
                length,
            });
        }
        Ok(produced)
    }

    async fn store_output(&self, path: &Path) -> Result<(ContentHash, u64), DispatchFailure> {
        self.store
            .store(path, self.settings.hash_type)
            .await
            .map_err(|source| DispatchFailure::StoreOutput {
                path: path.to_path_buf(),
                source,
            })
    }
}

async fn prepare_directories(table: &PathTable, process: &Process) -> Result<(), DispatchFailure> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    if process.working_directory.is_valid() {
        dirs.push(table.to_path_buf(process.working_directory));
    }
    for output in &process.outputs {
        let parent = table.parent(output.path());
        if parent.is_valid() {
            dirs.push(table.to_path_buf(parent));
        }
    }
    dirs.extend(process.directory_outputs.iter().map(|d| table.to_path_buf(d.path())));
    dirs.sort();
    dirs.dedup();

    for dir in dirs {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| DispatchFailure::Prepare { path: dir.clone(), source })?;
    }
    Ok(())
}

fn enter(phase: DispatchPhase) {
    debug!(operation = "dispatch_phase", phase = ?phase);
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_pips::{FileArtifactWithAttributes, FileExistence, PipData};

    fn process_with(table: &PathTable) -> Process {
        let out = table.create("/out/a.txt").unwrap();
        let input = table.create("/src/in.txt").unwrap();
        Process {
            executable: FileArtifact::source(table.create("/bin/tool").unwrap()),
            arguments: vec![PipData::path(out)],
            working_directory: table.create("/work").unwrap(),
            dependencies: vec![FileArtifact::source(input), FileArtifact::source(out)],
            outputs: vec![FileArtifactWithAttributes::new(
                FileArtifact::output(out),
                FileExistence::Required,
            )],
            directory_outputs: vec![DirectoryArtifact::new(table.create("/out/gen").unwrap(), 0, true)],
            ..Default::default()
        }
    }

    #[remex_test_utils::logged_test]
    fn dependency_that_is_also_an_output_becomes_a_rewrite() {
        let table = PathTable::new();
        let process = process_with(&table);
        let out = table.create("/out/a.txt").unwrap();

        let plan = build_access_plan(&table, &process);

        assert_eq!(plan.outputs[&out], FileArtifact::source(out).create_next_written_version());
        let policy = plan.manifest.policy_for(out);
        assert!(policy.contains(FileAccessPolicy::ALLOW_WRITE | FileAccessPolicy::REPORT_ACCESS));
    }

    #[remex_test_utils::logged_test]
    fn inputs_are_read_only_with_fake_timestamps() {
        let table = PathTable::new();
        let process = process_with(&table);
        let input = table.create("/src/in.txt").unwrap();

        let plan = build_access_plan(&table, &process);
        let policy = plan.manifest.policy_for(input);

        assert!(policy.contains(FileAccessPolicy::ALLOW_READ | FileAccessPolicy::ALLOW_READ_IF_NONEXISTENT));
        assert!(!policy.contains(FileAccessPolicy::ALLOW_WRITE));
        assert!(!policy.contains(FileAccessPolicy::REPORT_ACCESS));
        assert!(!policy.contains(FileAccessPolicy::ALLOW_REAL_INPUT_TIMESTAMPS));
        assert!(!plan.outputs.contains_key(&input));
    }

    #[remex_test_utils::logged_test]
    fn files_under_output_directories_are_fresh_outputs() {
        let table = PathTable::new();
        let process = process_with(&table);
        let plan = build_access_plan(&table, &process);

        let generated = table.create("/out/gen/x/y.o").unwrap();
        let stray = table.create("/tmp/stray").unwrap();
        assert_eq!(plan.output_for(&table, generated), Some(FileArtifact::output(generated)));
        assert_eq!(plan.output_for(&table, stray), None);
        assert!(plan.manifest.policy_for(generated).contains(FileAccessPolicy::REPORT_ACCESS));
    }

    fn request_for_batch(client: &PathTable, batch: usize) -> BuildRequest {
        let dependencies = (0..20)
            .map(|i| FileArtifact::source(client.create(&format!("/work/batch{batch}/dep{i}.c")).unwrap()))
            .collect();
        let process = Process {
            executable: FileArtifact::source(client.create("/bin/tool").unwrap()),
            working_directory: client.create("/work").unwrap(),
            dependencies,
            ..Default::default()
        };
        let mut ctx = SerializationContext::new(client.clone());
        let process = process.to_proto(&mut ctx);
        BuildRequest {
            header: remex_proto::RequestHeader::new("trace-decode"),
            path_table: ctx.send_path_table(),
            process,
        }
    }

    #[remex_test_utils::logged_test]
    fn each_request_decodes_into_its_own_path_table() {
        let client = PathTable::new();
        let sizes: Vec<usize> = (0..5)
            .map(|batch| {
                let (ctx, process) = decode_request(&request_for_batch(&client, batch)).unwrap();
                assert_eq!(process.dependencies.len(), 20);
                if batch > 0 {
                    assert_eq!(ctx.path_table().get(&format!("/work/batch{}/dep0.c", batch - 1)), None);
                }
                ctx.path_table().len()
            })
            .collect();

        assert!(sizes.iter().all(|&len| len == sizes[0]), "table sizes grew: {sizes:?}");
    }

    #[remex_test_utils::logged_test]
    fn failure_codes_distinguish_protocol_from_infrastructure() {
        assert_eq!(
            DispatchFailure::Codec(CodecError::UnknownPathId(9)).code(),
            DispatchErrorCode::ProtocolViolation
        );
        assert_eq!(
            DispatchFailure::Sandbox(SandboxError::InvalidCommand("x".into())).code(),
            DispatchErrorCode::SandboxInfrastructureFailure
        );
        assert_eq!(DispatchFailure::Cancelled.code(), DispatchErrorCode::Cancelled);
    }
}

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Dispatches real `/bin/sh` pips through the process sandbox, encoding
//! requests and decoding responses the way a client would.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use remex_agent::{DispatchFailure, DispatcherSettings, RemoteExecutionDispatcher};
use remex_cas::{ContentStore, InMemoryContentStore};
use remex_pips::{
    content_hash_from_proto, hash_bytes, DirectoryArtifact, EnvironmentVariable, FileArtifact,
    FileArtifactWithAttributes, HashType, PathTable, PipData, Process, SerializationContext,
    WireFormat,
};
use remex_proto::{
    exit_code_from_wire, BuildRequest, BuildResponse, BuildStatus, DispatchErrorCode, RequestHeader,
};
use remex_sandbox::ProcessSandbox;
use tokio_util::sync::CancellationToken;

struct Harness {
    client_table: PathTable,
    store: Arc<InMemoryContentStore>,
    dispatcher: RemoteExecutionDispatcher,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(InMemoryContentStore::new());
        let dispatcher = RemoteExecutionDispatcher::new(
            store.clone(),
            Arc::new(ProcessSandbox::new()),
            DispatcherSettings::default(),
        );
        Self {
            client_table: PathTable::new(),
            store,
            dispatcher,
        }
    }

    fn path(&self, path: &Path) -> remex_pips::AbsolutePath {
        self.client_table.from_path(path).unwrap()
    }

    fn shell(&self, cwd: &Path, script: &str) -> Process {
        Process {
            semi_stable_hash: 0xA1,
            executable: FileArtifact::source(self.path(Path::new("/bin/sh"))),
            arguments: vec![PipData::literal("-c"), PipData::literal(script)],
            working_directory: self.path(cwd),
            environment: vec![EnvironmentVariable::value("PATH", PipData::literal("/usr/bin:/bin"))],
            ..Default::default()
        }
    }

    fn request(&self, process: &Process) -> (SerializationContext, BuildRequest) {
        let mut ctx = SerializationContext::new(self.client_table.clone());
        let process = process.to_proto(&mut ctx);
        let path_table = ctx.send_path_table();
        let request = BuildRequest {
            header: RequestHeader::new("trace-dispatch"),
            path_table,
            process,
        };
        (ctx, request)
    }

    async fn run(&self, process: &Process) -> (SerializationContext, Result<BuildResponse, DispatchFailure>) {
        let (ctx, request) = self.request(process);
        let result = self.dispatcher.run_process(request, CancellationToken::new()).await;
        (ctx, result)
    }
}

fn decoded_outputs(
    ctx: &mut SerializationContext,
    response: &BuildResponse,
) -> Vec<(FileArtifact, remex_pips::ContentHash, u64)> {
    ctx.receive_path_table(&response.path_table).unwrap();
    response
        .output_file
        .iter()
        .map(|output| {
            (
                FileArtifact::from_proto(&output.file, ctx).unwrap(),
                content_hash_from_proto(&output.content_hash).unwrap(),
                output.length,
            )
        })
        .collect()
}

#[remex_test_utils::logged_tokio_test]
async fn successful_pip_reports_hashed_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::write(root.join("rewrite.txt"), b"v1").unwrap();
    let harness = Harness::new();

    let declared = harness.path(&root.join("out/a.txt"));
    let rewritten = harness.path(&root.join("rewrite.txt"));
    let generated_dir = harness.path(&root.join("out/gen"));
    let mut process = harness.shell(
        root,
        "printf hello > out/a.txt; printf generated > out/gen/b.txt; \
         printf version-two > rewrite.txt; printf stray > stray.txt; echo done",
    );
    process.dependencies = vec![FileArtifact::source(rewritten)];
    process.outputs = vec![
        FileArtifactWithAttributes::required(FileArtifact::output(declared)),
        FileArtifactWithAttributes::required(FileArtifact::source(rewritten).create_next_written_version()),
    ];
    process.directory_outputs = vec![DirectoryArtifact::new(generated_dir, 1, true)];

    let (mut ctx, result) = harness.run(&process).await;
    let response = result.unwrap();

    assert_eq!(BuildStatus::from_u8(response.status), Some(BuildStatus::Succeeded));
    assert_eq!(exit_code_from_wire(response.exit_code), 0);
    assert_eq!(response.standard_output, b"done\n");

    let mut outputs = decoded_outputs(&mut ctx, &response);
    outputs.sort_by_key(|(artifact, _, _)| harness.client_table.expand(artifact.path()));
    let hash_type = HashType::default();
    let generated = harness.path(&root.join("out/gen/b.txt"));
    assert_eq!(
        outputs,
        vec![
            (FileArtifact::output(declared), hash_bytes(hash_type, b"hello"), 5),
            (FileArtifact::output(generated), hash_bytes(hash_type, b"generated"), 9),
            (FileArtifact::new(rewritten, 1), hash_bytes(hash_type, b"version-two"), 11),
        ]
    );
    for (_, hash, _) in &outputs {
        assert!(harness.store.exists(hash).await.unwrap());
    }
    assert_eq!(harness.store.len(), 3);
}

#[remex_test_utils::logged_tokio_test]
async fn nonzero_exit_is_an_execution_failure() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let process = harness.shell(dir.path(), "echo broken >&2; exit 7");

    let (_, result) = harness.run(&process).await;
    let response = result.unwrap();

    assert_eq!(BuildStatus::from_u8(response.status), Some(BuildStatus::ExecutionFailed));
    assert_eq!(exit_code_from_wire(response.exit_code), 7);
    assert_eq!(response.standard_error, b"broken\n");
    assert!(response.output_file.is_empty());
}

#[remex_test_utils::logged_tokio_test]
async fn pip_timeout_overrides_the_default_and_discards_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let out = harness.path(&dir.path().join("late.txt"));
    let mut process = harness.shell(dir.path(), "printf early > late.txt; sleep 30");
    process.outputs = vec![FileArtifactWithAttributes::required(FileArtifact::output(out))];
    process.timeout = Some(Duration::from_millis(300));

    let (_, result) = harness.run(&process).await;
    let response = result.unwrap();

    assert_eq!(BuildStatus::from_u8(response.status), Some(BuildStatus::TimedOut));
    assert!(response.output_file.is_empty());
    assert!(harness.store.is_empty());
}

#[remex_test_utils::logged_tokio_test]
async fn malformed_path_table_is_a_protocol_violation() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (_, mut request) = harness.request(&harness.shell(dir.path(), "true"));
    // Point the first non-root entry at a parent that is never defined.
    let entry = request.path_table.paths.iter_mut().find(|p| p.parent != 0).unwrap();
    entry.parent = 9_999;

    let err = harness
        .dispatcher
        .run_process(request, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchFailure::Codec(_)));
    assert_eq!(err.code(), DispatchErrorCode::ProtocolViolation);
}

#[remex_test_utils::logged_tokio_test]
async fn cancellation_surfaces_as_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let (_, request) = harness.request(&harness.shell(dir.path(), "sleep 30"));
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = harness.dispatcher.run_process(request, cancel).await.unwrap_err();
    assert!(matches!(err, DispatchFailure::Cancelled));
    assert_eq!(err.code(), DispatchErrorCode::Cancelled);
}

#[remex_test_utils::logged_tokio_test]
async fn unnameable_writes_are_skipped_without_failing_the_pip() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let harness = Harness::new();
    let generated_dir = harness.path(&root.join("gen"));
    let mut process = harness.shell(root, "printf x > 'gen/a\\b.txt'; printf y > gen/ok.txt");
    process.directory_outputs = vec![DirectoryArtifact::new(generated_dir, 1, true)];

    let (mut ctx, result) = harness.run(&process).await;
    let response = result.unwrap();

    assert_eq!(BuildStatus::from_u8(response.status), Some(BuildStatus::Succeeded));
    assert!(root.join("gen/a\\b.txt").exists());
    let outputs = decoded_outputs(&mut ctx, &response);
    let ok = harness.path(&root.join("gen/ok.txt"));
    assert_eq!(
        outputs,
        vec![(FileArtifact::output(ok), hash_bytes(HashType::default(), b"y"), 1)]
    );
    assert_eq!(harness.store.len(), 1);
}

#[remex_test_utils::logged_tokio_test]
async fn pass_through_variables_come_from_the_agent_environment() {
    std::env::set_var("REMEX_DISPATCH_PASS_THROUGH", "from-agent");
    std::env::remove_var("REMEX_DISPATCH_UNSET");
    let dir = tempfile::tempdir().unwrap();
    let harness = Harness::new();
    let mut process = harness.shell(
        dir.path(),
        "printf '%s|%s' \"$REMEX_DISPATCH_PASS_THROUGH\" \"${REMEX_DISPATCH_UNSET-absent}\"",
    );
    process.environment.push(EnvironmentVariable::pass_through("REMEX_DISPATCH_PASS_THROUGH"));
    process.environment.push(EnvironmentVariable::pass_through("REMEX_DISPATCH_UNSET"));

    let (_, result) = harness.run(&process).await;
    let response = result.unwrap();

    assert_eq!(BuildStatus::from_u8(response.status), Some(BuildStatus::Succeeded));
    assert_eq!(response.standard_output, b"from-agent|absent");
}

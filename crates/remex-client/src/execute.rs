// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Runs one pip on a remote worker: synchronise inputs, send the encoded
//! process, decode what came back.

use std::sync::Arc;
use std::time::Duration;

use remex_pips::{
    content_hash_from_proto, format_semi_stable_hash, ContentHash, FileArtifact, PathTable, Pip,
    Process, SerializationContext, WireFormat,
};
use remex_proto::{exit_code_from_wire, BuildRequest, BuildResponse, BuildStatus, RequestHeader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::channel::{AgentChannel, RemoteWorker};
use crate::error::DispatchError;
use crate::registry::{FileContentRegistry, SealedDirectoryLister};
use crate::sync::ContentSynchronizer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub artifact: FileArtifact,
    pub hash: ContentHash,
    pub length: u64,
}

/// A process that ran to completion on the agent, whatever its outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: BuildStatus,
    pub exit_code: i32,
    pub outputs: Vec<ExecutionOutput>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub execution_time: Duration,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == BuildStatus::Succeeded
    }
}

pub struct RemoteExecutionClient {
    path_table: PathTable,
    synchronizer: ContentSynchronizer,
    worker: Arc<dyn RemoteWorker>,
}

impl RemoteExecutionClient {
    pub fn new(path_table: PathTable, synchronizer: ContentSynchronizer, worker: Arc<dyn RemoteWorker>) -> Self {
        Self {
            path_table,
            synchronizer,
            worker,
        }
    }

    /// Client whose content and execution calls both go through `channel`.
    pub fn connect(
        channel: AgentChannel,
        path_table: PathTable,
        registry: Arc<dyn FileContentRegistry>,
        lister: Arc<dyn SealedDirectoryLister>,
    ) -> Self {
        let uploads = channel.config().upload_concurrency();
        let channel = Arc::new(channel);
        let synchronizer = ContentSynchronizer::new(path_table.clone(), channel.clone(), registry, lister)
            .with_upload_concurrency(uploads);
        Self::new(path_table, synchronizer, channel)
    }

    /// Executes `pip` remotely. `trace_id` correlates every call this
    /// dispatch makes; cancelling `cancel` drops the in-flight call, which
    /// makes the agent stop the process.
    pub async fn execute(
        &self,
        pip: &Pip,
        trace_id: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, DispatchError> {
        let Some(process) = pip.as_process() else {
            return Err(DispatchError::NotRemotable(pip.pip_type()));
        };
        let span = info_span!(
            "dispatch",
            trace_id = %trace_id,
            pip = %format_semi_stable_hash(process.semi_stable_hash)
        );

        async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(DispatchError::Cancelled),
                result = self.dispatch(process, trace_id) => result,
            };
            match &result {
                Ok(execution) => info!(
                    operation = "remote_execute",
                    status = ?execution.status,
                    exit_code = execution.exit_code,
                    outputs = execution.outputs.len(),
                    "remote execution finished"
                ),
                Err(e) => warn!(
                    operation = "remote_execute",
                    attempted = e.execution_attempted(),
                    error = %e,
                    "remote execution failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, process: &Process, trace_id: &str) -> Result<ExecutionResult, DispatchError> {
        self.synchronizer.synchronize(process, trace_id).await?;

        let mut ctx = SerializationContext::new(self.path_table.clone());
        let encoded = process.to_proto(&mut ctx);
        let request = BuildRequest {
            header: RequestHeader::new(trace_id),
            path_table: ctx.send_path_table(),
            process: encoded,
        };
        let response = self.worker.run_process(request).await?;
        decode_response(&mut ctx, response)
    }
}

fn decode_response(ctx: &mut SerializationContext, response: BuildResponse) -> Result<ExecutionResult, DispatchError> {
    let status = BuildStatus::from_u8(response.status)
        .ok_or_else(|| DispatchError::ProtocolViolation(format!("unknown build status {}", response.status)))?;
    ctx.receive_path_table(&response.path_table)?;

    let outputs = response
        .output_file
        .iter()
        .map(|output| {
            Ok(ExecutionOutput {
                artifact: FileArtifact::from_proto(&output.file, ctx)?,
                hash: content_hash_from_proto(&output.content_hash)
                    .map_err(|e| DispatchError::ProtocolViolation(e.to_string()))?,
                length: output.length,
            })
        })
        .collect::<Result<Vec<_>, DispatchError>>()?;

    Ok(ExecutionResult {
        status,
        exit_code: exit_code_from_wire(response.exit_code),
        outputs,
        stdout: response.standard_output,
        stderr: response.standard_error,
        execution_time: Duration::from_millis(response.execution_time_ms),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{MockRemoteCas, MockRemoteWorker};
    use crate::error::ChannelError;
    use crate::registry::{ContentRegistry, FileContentInfo, SealedDirectoryIndex};
    use async_trait::async_trait;
    use remex_pips::{
        content_hash_to_proto, hash_bytes, CopyFile, FileArtifactWithAttributes, HashType, PipType,
    };
    use remex_proto::{
        exit_code_to_wire, DispatchErrorCode, IndexedResponseHeader, OutputFile, PinBulkRequest,
        PinBulkResponse, PinResultCode, ResponseHeader,
    };

    fn client(
        table: &PathTable,
        registry: Arc<ContentRegistry>,
        cas: MockRemoteCas,
        worker: Arc<dyn RemoteWorker>,
    ) -> RemoteExecutionClient {
        let synchronizer = ContentSynchronizer::new(
            table.clone(),
            Arc::new(cas),
            registry,
            Arc::new(SealedDirectoryIndex::new()),
        );
        RemoteExecutionClient::new(table.clone(), synchronizer, worker)
    }

    /// Answers like an agent would: decodes the request against its own
    /// table and reports every declared output with `content`.
    fn agent_reply(request: &BuildRequest, content: &[u8]) -> BuildResponse {
        let mut ctx = SerializationContext::new(PathTable::new());
        ctx.receive_path_table(&request.path_table).unwrap();
        let process = Process::from_proto(&request.process, &ctx).unwrap();
        ctx.prepare_path_table_for_write();
        let hash = hash_bytes(HashType::Blake3, content);
        let output_file = process
            .outputs
            .iter()
            .map(|output| OutputFile {
                file: output.artifact().to_proto(&mut ctx),
                content_hash: content_hash_to_proto(&hash),
                length: content.len() as u64,
            })
            .collect();
        BuildResponse {
            exit_code: exit_code_to_wire(0),
            status: BuildStatus::Succeeded as u8,
            output_file,
            path_table: ctx.send_path_table(),
            standard_output: b"ok\n".to_vec(),
            standard_error: Vec::new(),
            execution_time_ms: 12,
        }
    }

    fn compile_pip(table: &PathTable, registry: &ContentRegistry) -> (Pip, FileArtifact) {
        let source = FileArtifact::source(table.create("/repo/src/main.c").unwrap());
        registry.register(
            source,
            FileContentInfo {
                hash: hash_bytes(HashType::Blake3, b"int main(void);"),
                length: 15,
            },
        );
        let object = FileArtifact::output(table.create("/repo/out/main.o").unwrap());
        let process = Process {
            semi_stable_hash: 0xC0FFEE,
            executable: FileArtifact::source(table.create("/usr/bin/cc").unwrap()),
            dependencies: vec![source],
            outputs: vec![FileArtifactWithAttributes::required(object)],
            working_directory: table.create("/repo").unwrap(),
            ..Default::default()
        };
        (Pip::Process(process), object)
    }

    fn all_present(_: PinBulkRequest) -> Result<PinBulkResponse, ChannelError> {
        Ok(PinBulkResponse {
            results: vec![IndexedResponseHeader {
                index: 0,
                header: ResponseHeader::success(0),
            }],
        })
    }

    #[remex_test_utils::logged_tokio_test]
    async fn outputs_decode_into_the_local_path_table() {
        let table = PathTable::new();
        let registry = Arc::new(ContentRegistry::new());
        let (pip, object) = compile_pip(&table, &registry);
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().times(1).returning(all_present);
        let mut worker = MockRemoteWorker::new();
        worker
            .expect_run_process()
            .withf(|request| request.header.trace_id == b"trace-exec")
            .times(1)
            .returning(|request| Ok(agent_reply(&request, b"OBJ")));

        let result = client(&table, registry, cas, Arc::new(worker))
            .execute(&pip, "trace-exec", &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"ok\n");
        assert_eq!(result.execution_time, Duration::from_millis(12));
        assert_eq!(
            result.outputs,
            vec![ExecutionOutput {
                artifact: object,
                hash: hash_bytes(HashType::Blake3, b"OBJ"),
                length: 3,
            }]
        );
    }

    #[remex_test_utils::logged_tokio_test]
    async fn unavailable_content_never_reaches_the_worker() {
        let table = PathTable::new();
        let registry = Arc::new(ContentRegistry::new());
        let (pip, _) = compile_pip(&table, &registry);
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().returning(|_| {
            Ok(PinBulkResponse {
                results: vec![IndexedResponseHeader {
                    index: 0,
                    header: ResponseHeader::failure(PinResultCode::Error, "disk full".into(), 0),
                }],
            })
        });
        let mut worker = MockRemoteWorker::new();
        worker.expect_run_process().never();

        let err = client(&table, registry, cas, Arc::new(worker))
            .execute(&pip, "t", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ContentUnavailable { .. }));
        assert!(!err.execution_attempted());
    }

    #[remex_test_utils::logged_tokio_test]
    async fn failed_upload_never_starts_the_process() {
        let table = PathTable::new();
        let registry = Arc::new(ContentRegistry::new());
        let (pip, _) = compile_pip(&table, &registry);
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().times(1).returning(|_| {
            Ok(PinBulkResponse {
                results: vec![IndexedResponseHeader {
                    index: 0,
                    header: ResponseHeader::failure(PinResultCode::ContentNotFound, "missing".into(), 0),
                }],
            })
        });
        cas.expect_store_file()
            .times(1)
            .returning(|_, _, _| Err(ChannelError::Closed));
        let mut worker = MockRemoteWorker::new();
        worker.expect_run_process().never();

        let err = client(&table, registry, cas, Arc::new(worker))
            .execute(&pip, "t", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ContentUnavailable { .. }));
        assert!(!err.execution_attempted());
    }

    #[remex_test_utils::logged_tokio_test]
    async fn only_process_pips_are_remotable() {
        let table = PathTable::new();
        let mut worker = MockRemoteWorker::new();
        worker.expect_run_process().never();
        let copy = Pip::CopyFile(CopyFile {
            semi_stable_hash: 1,
            source: FileArtifact::source(table.create("/a").unwrap()),
            destination: FileArtifact::output(table.create("/b").unwrap()),
        });

        let err = client(&table, Arc::new(ContentRegistry::new()), MockRemoteCas::new(), Arc::new(worker))
            .execute(&copy, "t", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotRemotable(PipType::CopyFile)));
    }

    #[remex_test_utils::logged_tokio_test]
    async fn agent_sandbox_failures_are_attempted_executions() {
        let table = PathTable::new();
        let registry = Arc::new(ContentRegistry::new());
        let (pip, _) = compile_pip(&table, &registry);
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().returning(all_present);
        let mut worker = MockRemoteWorker::new();
        worker.expect_run_process().returning(|_| {
            Err(ChannelError::Remote {
                code: DispatchErrorCode::SandboxInfrastructureFailure as u32,
                message: "spawn failed".into(),
            })
        });

        let err = client(&table, registry, cas, Arc::new(worker))
            .execute(&pip, "t", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::SandboxInfrastructureFailure(_)));
        assert!(err.execution_attempted());
    }

    #[remex_test_utils::logged_tokio_test]
    async fn garbled_response_table_is_a_protocol_violation() {
        let table = PathTable::new();
        let registry = Arc::new(ContentRegistry::new());
        let (pip, _) = compile_pip(&table, &registry);
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().returning(all_present);
        let mut worker = MockRemoteWorker::new();
        worker.expect_run_process().returning(|request| {
            let mut response = agent_reply(&request, b"x");
            response.path_table.paths.clear();
            Ok(response)
        });

        let err = client(&table, registry, cas, Arc::new(worker))
            .execute(&pip, "t", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ProtocolViolation(_)));
    }

    struct StalledWorker;

    #[async_trait]
    impl RemoteWorker for StalledWorker {
        async fn run_process(&self, _request: BuildRequest) -> Result<BuildResponse, ChannelError> {
            futures::future::pending().await
        }
    }

    #[remex_test_utils::logged_tokio_test]
    async fn cancellation_abandons_the_call() {
        let table = PathTable::new();
        let registry = Arc::new(ContentRegistry::new());
        let (pip, _) = compile_pip(&table, &registry);
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().returning(all_present);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = client(&table, registry, cas, Arc::new(StalledWorker))
            .execute(&pip, "t", &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }
}

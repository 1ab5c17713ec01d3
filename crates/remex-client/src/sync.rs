// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Makes every input of a pip present in the agent's store before it runs.
//!
//! One bulk pin covers all distinct input hashes. Content the agent lacks
//! is uploaded; anything that still cannot be made available fails the
//! whole dispatch.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use remex_pips::{content_hash_to_proto, ContentHash, FileArtifact, PathTable, Process};
use remex_proto::{PinBulkRequest, PinResultCode, RequestHeader};
use tracing::{debug, info, warn};

use crate::channel::RemoteCas;
use crate::error::DispatchError;
use crate::registry::{FileContentRegistry, SealedDirectoryLister};

/// One distinct piece of input content and a file that holds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequiredContent {
    pub artifact: FileArtifact,
    pub hash: ContentHash,
    pub length: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub required: usize,
    pub uploaded: usize,
}

pub struct ContentSynchronizer {
    path_table: PathTable,
    cas: Arc<dyn RemoteCas>,
    registry: Arc<dyn FileContentRegistry>,
    lister: Arc<dyn SealedDirectoryLister>,
    upload_concurrency: usize,
}

impl ContentSynchronizer {
    pub fn new(
        path_table: PathTable,
        cas: Arc<dyn RemoteCas>,
        registry: Arc<dyn FileContentRegistry>,
        lister: Arc<dyn SealedDirectoryLister>,
    ) -> Self {
        Self {
            path_table,
            cas,
            registry,
            lister,
            upload_concurrency: 4,
        }
    }

    pub fn with_upload_concurrency(mut self, uploads: usize) -> Self {
        self.upload_concurrency = uploads.max(1);
        self
    }

    /// Distinct input content of `process`, in declaration order. Files
    /// of sealed directory dependencies follow the plain file dependencies.
    pub fn required_content(&self, process: &Process) -> Result<Vec<RequiredContent>, DispatchError> {
        let mut files: Vec<FileArtifact> = process.dependencies.clone();
        for directory in &process.directory_dependencies {
            let members = self
                .lister
                .list_sealed_directory_contents(*directory)
                .ok_or_else(|| DispatchError::MissingInputContent {
                    path: self.path_table.to_path_buf(directory.path()),
                })?;
            files.extend(members);
        }

        let mut seen = HashMap::new();
        let mut required = Vec::new();
        for artifact in files {
            let info = self.registry.try_get_input_content(artifact).ok_or_else(|| {
                DispatchError::MissingInputContent {
                    path: self.path_table.to_path_buf(artifact.path()),
                }
            })?;
            if info.hash.is_untracked() {
                return Err(DispatchError::UntrackedContentDeclared {
                    path: self.path_table.to_path_buf(artifact.path()),
                });
            }
            if seen.insert(info.hash, artifact).is_none() {
                required.push(RequiredContent {
                    artifact,
                    hash: info.hash,
                    length: info.length,
                });
            }
        }
        Ok(required)
    }

    /// Pins every input and uploads what the agent is missing. Returns only
    /// once all content is present.
    pub async fn synchronize(&self, process: &Process, trace_id: &str) -> Result<SyncReport, DispatchError> {
        let required = self.required_content(process)?;
        if required.is_empty() {
            debug!(operation = "synchronize", "no input content to pin");
            return Ok(SyncReport::default());
        }

        let request = PinBulkRequest {
            header: RequestHeader::new(trace_id),
            hashes: required.iter().map(|r| content_hash_to_proto(&r.hash)).collect(),
        };
        let response = self.cas.pin_bulk(request).await?;

        let mut outcomes: Vec<Option<(PinResultCode, String)>> = vec![None; required.len()];
        for result in &response.results {
            let Some(slot) = outcomes.get_mut(result.index as usize) else {
                warn!(operation = "pin_bulk", index = result.index, "pin result for unknown index");
                continue;
            };
            let code = PinResultCode::from_u32(result.header.result).unwrap_or(PinResultCode::Error);
            *slot = Some((code, result.header.error_message_lossy()));
        }

        let mut missing = Vec::new();
        for (content, outcome) in required.iter().zip(outcomes) {
            match outcome {
                Some((PinResultCode::Success, _)) => {}
                Some((PinResultCode::ContentNotFound, _)) => missing.push(*content),
                Some((PinResultCode::Error, message)) => {
                    return Err(DispatchError::ContentUnavailable {
                        hash: content.hash,
                        message,
                    })
                }
                None => {
                    return Err(DispatchError::ContentUnavailable {
                        hash: content.hash,
                        message: "agent returned no pin result".to_string(),
                    })
                }
            }
        }
        debug!(
            operation = "pin_bulk",
            required = required.len(),
            missing = missing.len(),
            "pinned input content"
        );

        let uploaded = missing.len();
        let mut uploads = stream::iter(missing)
            .map(|content| self.upload(content, trace_id))
            .buffer_unordered(self.upload_concurrency);
        while let Some(outcome) = uploads.next().await {
            outcome?;
        }

        if uploaded > 0 {
            info!(operation = "synchronize", uploaded, required = required.len(), "uploaded missing content");
        }
        Ok(SyncReport {
            required: required.len(),
            uploaded,
        })
    }

    async fn upload(&self, content: RequiredContent, trace_id: &str) -> Result<(), DispatchError> {
        let path = self.path_table.to_path_buf(content.artifact.path());
        let unavailable = |message: String| DispatchError::ContentUnavailable {
            hash: content.hash,
            message,
        };
        let response = self
            .cas
            .store_file(RequestHeader::new(trace_id), content.hash, path.clone())
            .await
            .map_err(|e| unavailable(format!("uploading {}: {e}", path.display())))?;
        if !response.header.succeeded {
            return Err(unavailable(response.header.error_message_lossy()));
        }
        debug!(operation = "store_file", hash = %content.hash, path = %path.display(), "content uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockRemoteCas;
    use crate::registry::{ContentRegistry, FileContentInfo, SealedDirectoryIndex};
    use remex_pips::{hash_bytes, DirectoryArtifact, HashType, SealDirectory, WellKnownContentHashes};
    use remex_proto::{
        IndexedResponseHeader, PinBulkResponse, ResponseHeader, StoreFileResponse,
    };

    struct Fixture {
        table: PathTable,
        registry: Arc<ContentRegistry>,
        seals: Arc<SealedDirectoryIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                table: PathTable::new(),
                registry: Arc::new(ContentRegistry::new()),
                seals: Arc::new(SealedDirectoryIndex::new()),
            }
        }

        fn input(&self, path: &str, content: &[u8]) -> (FileArtifact, ContentHash) {
            let artifact = FileArtifact::source(self.table.create(path).unwrap());
            let hash = hash_bytes(HashType::Blake3, content);
            self.registry.register(
                artifact,
                FileContentInfo {
                    hash,
                    length: content.len() as u64,
                },
            );
            (artifact, hash)
        }

        fn synchronizer(&self, cas: MockRemoteCas) -> ContentSynchronizer {
            ContentSynchronizer::new(
                self.table.clone(),
                Arc::new(cas),
                self.registry.clone(),
                self.seals.clone(),
            )
        }
    }

    fn pin_results(codes: &[PinResultCode]) -> PinBulkResponse {
        PinBulkResponse {
            results: codes
                .iter()
                .enumerate()
                .map(|(index, code)| IndexedResponseHeader {
                    index: index as u32,
                    header: match code {
                        PinResultCode::Success => ResponseHeader::success(0),
                        other => ResponseHeader::failure(*other, format!("{other:?}"), 0),
                    },
                })
                .collect(),
        }
    }

    #[remex_test_utils::logged_tokio_test]
    async fn empty_input_set_skips_the_pin_call() {
        let fixture = Fixture::new();
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().never();
        cas.expect_store_file().never();

        let report = fixture
            .synchronizer(cas)
            .synchronize(&Process::default(), "trace")
            .await
            .unwrap();
        assert_eq!(report, SyncReport::default());
    }

    #[remex_test_utils::logged_tokio_test]
    async fn duplicate_content_is_pinned_once_and_missing_content_uploaded() {
        let fixture = Fixture::new();
        let (a, hash_a) = fixture.input("/src/a.c", b"same");
        let (b, _) = fixture.input("/src/b.c", b"same");
        let (c, hash_c) = fixture.input("/src/c.c", b"other");
        let process = Process {
            dependencies: vec![a, b, c],
            ..Default::default()
        };
        let c_path = fixture.table.to_path_buf(c.path());

        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk()
            .withf(move |request| {
                request.header.trace_id == b"trace-1"
                    && request.hashes
                        == vec![content_hash_to_proto(&hash_a), content_hash_to_proto(&hash_c)]
            })
            .times(1)
            .returning(|_| Ok(pin_results(&[PinResultCode::Success, PinResultCode::ContentNotFound])));
        cas.expect_store_file()
            .withf(move |_, hash, path| *hash == hash_c && *path == c_path)
            .times(1)
            .returning(|_, _, _| {
                Ok(StoreFileResponse {
                    header: ResponseHeader::success(0),
                })
            });

        let report = fixture.synchronizer(cas).synchronize(&process, "trace-1").await.unwrap();
        assert_eq!(report, SyncReport { required: 2, uploaded: 1 });
    }

    #[remex_test_utils::logged_tokio_test]
    async fn untracked_dependency_is_rejected_before_pinning() {
        let fixture = Fixture::new();
        let artifact = FileArtifact::source(fixture.table.create("/tmp/scratch").unwrap());
        fixture.registry.register(
            artifact,
            FileContentInfo {
                hash: WellKnownContentHashes::UNTRACKED_FILE,
                length: 0,
            },
        );
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().never();

        let process = Process {
            dependencies: vec![artifact],
            ..Default::default()
        };
        let err = fixture.synchronizer(cas).synchronize(&process, "t").await.unwrap_err();
        assert!(matches!(err, DispatchError::UntrackedContentDeclared { .. }));
    }

    #[remex_test_utils::logged_tokio_test]
    async fn pin_error_aborts_without_uploading() {
        let fixture = Fixture::new();
        let (a, _) = fixture.input("/src/a", b"a");
        let (b, hash_b) = fixture.input("/src/b", b"b");
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk()
            .returning(|_| Ok(pin_results(&[PinResultCode::ContentNotFound, PinResultCode::Error])));
        cas.expect_store_file().never();

        let process = Process {
            dependencies: vec![a, b],
            ..Default::default()
        };
        let err = fixture.synchronizer(cas).synchronize(&process, "t").await.unwrap_err();
        assert!(matches!(err, DispatchError::ContentUnavailable { hash, .. } if hash == hash_b));
    }

    #[remex_test_utils::logged_tokio_test]
    async fn failed_upload_is_content_unavailable() {
        let fixture = Fixture::new();
        let (a, _) = fixture.input("/src/a", b"a");
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk()
            .returning(|_| Ok(pin_results(&[PinResultCode::ContentNotFound])));
        cas.expect_store_file().returning(|_, _, _| {
            Ok(StoreFileResponse {
                header: ResponseHeader::failure(PinResultCode::Error, "hash mismatch".into(), 0),
            })
        });

        let process = Process {
            dependencies: vec![a],
            ..Default::default()
        };
        let err = fixture.synchronizer(cas).synchronize(&process, "t").await.unwrap_err();
        assert!(matches!(err, DispatchError::ContentUnavailable { message, .. } if message == "hash mismatch"));
    }

    #[remex_test_utils::logged_tokio_test]
    async fn missing_pin_result_is_content_unavailable() {
        let fixture = Fixture::new();
        let (a, _) = fixture.input("/src/a", b"a");
        let mut cas = MockRemoteCas::new();
        cas.expect_pin_bulk().returning(|_| Ok(PinBulkResponse { results: Vec::new() }));

        let process = Process {
            dependencies: vec![a],
            ..Default::default()
        };
        let err = fixture.synchronizer(cas).synchronize(&process, "t").await.unwrap_err();
        assert!(matches!(err, DispatchError::ContentUnavailable { .. }));
    }

    #[remex_test_utils::logged_tokio_test]
    async fn sealed_directory_members_are_required() {
        let fixture = Fixture::new();
        let (member, hash) = fixture.input("/out/pkg/lib.a", b"archive");
        let directory = DirectoryArtifact::new(fixture.table.create("/out/pkg").unwrap(), 3, false);
        fixture.seals.add_seal(&SealDirectory {
            semi_stable_hash: 9,
            directory,
            contents: vec![member],
        });
        let synchronizer = fixture.synchronizer(MockRemoteCas::new());

        let process = Process {
            directory_dependencies: vec![directory],
            ..Default::default()
        };
        let required = synchronizer.required_content(&process).unwrap();
        assert_eq!(required.len(), 1);
        assert_eq!(required[0].hash, hash);

        let unsealed = Process {
            directory_dependencies: vec![DirectoryArtifact::new(directory.path(), 4, false)],
            ..Default::default()
        };
        assert!(matches!(
            synchronizer.required_content(&unsealed),
            Err(DispatchError::MissingInputContent { .. })
        ));
    }
}

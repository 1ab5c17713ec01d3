// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server side of the PinBulk and StoreFile calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{Stream, StreamExt};
use remex_pips::{content_hash_from_proto, ContentHash};
use remex_proto::{
    IndexedResponseHeader, PinBulkRequest, PinBulkResponse, PinResultCode, ResponseHeader,
    StoreFileHeader, StoreFileRequest, StoreFileResponse,
};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{CasError, CasResult};
use crate::store::{ContentStore, PinResult};

pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

pub struct ContentServer {
    store: Arc<dyn ContentStore>,
    staging_dir: PathBuf,
}

impl ContentServer {
    pub async fn new(store: Arc<dyn ContentStore>, staging_dir: impl Into<PathBuf>) -> CasResult<Self> {
        let staging_dir = staging_dir.into();
        tokio::fs::create_dir_all(&staging_dir).await?;
        Ok(Self { store, staging_dir })
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Pins every requested hash concurrently. Results come back sorted by
    /// request index and a malformed hash only fails its own slot.
    ///
    /// On cancellation the outstanding pins are aborted without waiting.
    pub async fn pin_bulk(
        &self,
        request: &PinBulkRequest,
        cancel: &CancellationToken,
    ) -> CasResult<PinBulkResponse> {
        let receipt = now_ms();
        let trace_id = request.header.trace_id_lossy();
        let mut slots: Vec<Option<ResponseHeader>> = vec![None; request.hashes.len()];
        let mut tasks = JoinSet::new();

        for (index, wire) in request.hashes.iter().enumerate() {
            match content_hash_from_proto(wire) {
                Ok(hash) => {
                    let store = Arc::clone(&self.store);
                    tasks.spawn(async move { (index, store.pin(&hash).await) });
                }
                Err(e) => {
                    slots[index] = Some(ResponseHeader::failure(
                        PinResultCode::Error,
                        format!("invalid content hash: {}", e),
                        receipt,
                    ));
                }
            }
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(operation = "pin_bulk", trace_id = %trace_id, pending = tasks.len(), "pin bulk cancelled");
                    // Dropping the set aborts whatever is still running.
                    drop(tasks);
                    return Err(CasError::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((index, result))) => slots[index] = Some(pin_header(result, receipt)),
                    Some(Err(e)) => {
                        warn!(operation = "pin_bulk", trace_id = %trace_id, error = %e, "pin task failed");
                    }
                },
            }
        }

        let results: Vec<IndexedResponseHeader> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| IndexedResponseHeader {
                index: index as u32,
                header: slot.unwrap_or_else(|| {
                    ResponseHeader::failure(PinResultCode::Error, "pin task did not complete".into(), receipt)
                }),
            })
            .collect();

        debug!(
            operation = "pin_bulk",
            trace_id = %trace_id,
            requested = results.len(),
            pinned = results.iter().filter(|r| r.header.succeeded).count(),
            "pin bulk finished"
        );
        Ok(PinBulkResponse { results })
    }

    /// Receives a header followed by chunks, then ingests the staged file
    /// under the declared hash once the stream ends.
    ///
    /// An `Err` item aborts the upload. Anything that goes wrong with the
    /// content itself is reported in the response header; only cancellation
    /// is returned as an error.
    pub async fn store_file<S>(&self, stream: S, cancel: &CancellationToken) -> CasResult<StoreFileResponse>
    where
        S: Stream<Item = CasResult<StoreFileRequest>> + Unpin + Send,
    {
        let receipt = now_ms();
        match self.receive_and_ingest(stream, cancel).await {
            Ok(hash) => {
                debug!(operation = "store_file", hash = %hash, "content stored");
                Ok(StoreFileResponse {
                    header: ResponseHeader::success(receipt),
                })
            }
            Err(CasError::Cancelled) => Err(CasError::Cancelled),
            Err(e) => {
                warn!(operation = "store_file", error = %e, "store file failed");
                Ok(StoreFileResponse {
                    header: ResponseHeader::failure(PinResultCode::Error, e.to_string(), receipt),
                })
            }
        }
    }

    async fn receive_and_ingest<S>(&self, mut stream: S, cancel: &CancellationToken) -> CasResult<ContentHash>
    where
        S: Stream<Item = CasResult<StoreFileRequest>> + Unpin + Send,
    {
        let header = match next_item(&mut stream, cancel).await? {
            Some(StoreFileRequest::Header(header)) => header,
            Some(StoreFileRequest::Chunk(_)) => {
                return Err(CasError::Stream("first message must be a header".into()))
            }
            None => return Err(CasError::Stream("stream ended before header".into())),
        };
        let hash = content_hash_from_proto(&header.content_hash)?;
        if hash.is_special() {
            return Err(CasError::SpecialHash(hash));
        }
        debug!(
            operation = "store_file",
            trace_id = %header.header.trace_id_lossy(),
            hash = %hash,
            path = %String::from_utf8_lossy(&header.path),
            "receiving upload"
        );

        let mut staged = StagedFile::create(&self.staging_dir, &header).await?;
        while let Some(item) = next_item(&mut stream, cancel).await? {
            match item {
                StoreFileRequest::Chunk(chunk) => staged.append(&chunk.content).await?,
                StoreFileRequest::Header(_) => {
                    return Err(CasError::Stream("duplicate header in upload".into()))
                }
            }
        }
        staged.finish().await?;
        self.store.put_file(&hash, staged.path()).await?;
        Ok(hash)
    }
}

fn pin_header(result: PinResult, receipt: u64) -> ResponseHeader {
    match result {
        PinResult::Success => ResponseHeader::success(receipt),
        PinResult::ContentNotFound => ResponseHeader::failure(
            PinResultCode::ContentNotFound,
            "content not found".into(),
            receipt,
        ),
        PinResult::Error(message) => ResponseHeader::failure(PinResultCode::Error, message, receipt),
    }
}

async fn next_item<S>(stream: &mut S, cancel: &CancellationToken) -> CasResult<Option<StoreFileRequest>>
where
    S: Stream<Item = CasResult<StoreFileRequest>> + Unpin + Send,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CasError::Cancelled),
        item = stream.next() => item.transpose(),
    }
}

/// A partially received upload. The file is removed when this guard drops;
/// a successful ingest has already moved or copied it into the store.
struct StagedFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
}

impl StagedFile {
    async fn create(dir: &Path, header: &StoreFileHeader) -> CasResult<Self> {
        let hint = staging_name_hint(&header.path);
        let path = dir.join(format!("{}-{}", uuid::Uuid::new_v4(), hint));
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Some(file),
            written: 0,
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&mut self, bytes: &[u8]) -> CasResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| CasError::Stream("chunk after upload finished".into()))?;
        file.write_all(bytes).await?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> CasResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        debug!(operation = "store_file", path = %self.path.display(), bytes = self.written, "upload staged");
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        drop(self.file.take());
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove staged upload"),
        }
    }
}

/// Last segment of the client's destination path, restricted to characters
/// that are safe in a file name.
fn staging_name_hint(path: &[u8]) -> String {
    let text = String::from_utf8_lossy(path);
    let base = text.rsplit(['/', '\\']).next().unwrap_or_default();
    let hint: String = base
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .take(64)
        .collect();
    if hint.is_empty() || hint.chars().all(|c| c == '.') {
        "upload".to_string()
    } else {
        hint
    }
}

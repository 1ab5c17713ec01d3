// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connection to a remote agent.
//!
//! Every call opens its own connection and handshakes first, so concurrent
//! dispatches never share a stream.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use remex_pips::{content_hash_to_proto, ContentHash};
use remex_proto::{
    read_frame, write_frame, BuildRequest, BuildResponse, Endpoint, PinBulkRequest,
    PinBulkResponse, Request, RequestHeader, Response, StoreFileResponse, Transport,
    DEFAULT_CHUNK_SIZE, MAX_FRAME_LEN,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, trace};

use crate::error::ChannelError;

/// Content operations of the remote store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteCas: Send + Sync {
    async fn pin_bulk(&self, request: PinBulkRequest) -> Result<PinBulkResponse, ChannelError>;

    /// Streams the file at `path` to the agent under `hash`.
    async fn store_file(
        &self,
        header: RequestHeader,
        hash: ContentHash,
        path: PathBuf,
    ) -> Result<StoreFileResponse, ChannelError>;
}

/// Process execution on the remote worker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteWorker: Send + Sync {
    async fn run_process(&self, request: BuildRequest) -> Result<BuildResponse, ChannelError>;
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    endpoint: Endpoint,
    client_name: String,
    max_frame_bytes: usize,
    chunk_bytes: usize,
    connect_timeout: Duration,
    upload_concurrency: usize,
}

impl ChannelConfig {
    pub fn builder(endpoint: Endpoint) -> ChannelConfigBuilder {
        ChannelConfigBuilder {
            endpoint,
            client_name: None,
            max_frame_bytes: MAX_FRAME_LEN,
            chunk_bytes: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(10),
            upload_concurrency: 4,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Uploads the synchroniser may run at once.
    pub fn upload_concurrency(&self) -> usize {
        self.upload_concurrency
    }
}

/// Builder for [`ChannelConfig`].
pub struct ChannelConfigBuilder {
    endpoint: Endpoint,
    client_name: Option<String>,
    max_frame_bytes: usize,
    chunk_bytes: usize,
    connect_timeout: Duration,
    upload_concurrency: usize,
}

impl ChannelConfigBuilder {
    /// Name logged by the agent on handshake (defaults to `remex-client`).
    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    /// Upload chunk size. Clamped to fit in a frame.
    pub fn chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = bytes;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn upload_concurrency(mut self, uploads: usize) -> Self {
        self.upload_concurrency = uploads;
        self
    }

    pub fn build(self) -> ChannelConfig {
        // Leave room for the union tag and length prefixes around a chunk.
        let frame_payload = self.max_frame_bytes.saturating_sub(64).max(1);
        ChannelConfig {
            endpoint: self.endpoint,
            client_name: self.client_name.unwrap_or_else(|| "remex-client".to_string()),
            max_frame_bytes: self.max_frame_bytes,
            chunk_bytes: self.chunk_bytes.clamp(1, frame_payload),
            connect_timeout: self.connect_timeout,
            upload_concurrency: self.upload_concurrency.max(1),
        }
    }
}

/// Agent client implementing [`RemoteCas`] and [`RemoteWorker`].
#[derive(Clone, Debug)]
pub struct AgentChannel {
    config: ChannelConfig,
}

struct Connection {
    stream: Box<dyn Transport>,
    max_frame_bytes: usize,
}

impl Connection {
    async fn send(&mut self, request: &Request) -> Result<(), ChannelError> {
        Ok(write_frame(&mut self.stream, request).await?)
    }

    async fn receive(&mut self) -> Result<Response, ChannelError> {
        match read_frame(&mut self.stream, self.max_frame_bytes).await? {
            Some(response) => Ok(response),
            None => Err(ChannelError::Closed),
        }
    }

    async fn call(&mut self, request: &Request) -> Result<Response, ChannelError> {
        self.send(request).await?;
        self.receive().await
    }
}

fn response_kind(response: &Response) -> &'static str {
    match response {
        Response::Handshake(_) => "handshake",
        Response::RunProcess(_) => "run_process",
        Response::PinBulk(_) => "pin_bulk",
        Response::StoreFile(_) => "store_file",
        Response::Error(_) => "error",
    }
}

fn unexpected(expected: &'static str, response: Response) -> ChannelError {
    match response {
        Response::Error(e) => ChannelError::Remote {
            code: e.code,
            message: e.message_lossy(),
        },
        other => ChannelError::UnexpectedResponse {
            expected,
            got: response_kind(&other),
        },
    }
}

impl AgentChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    async fn open(&self) -> Result<Connection, ChannelError> {
        let endpoint = &self.config.endpoint;
        let stream = tokio::time::timeout(self.config.connect_timeout, endpoint.connect())
            .await
            .map_err(|_| ChannelError::ConnectTimeout(endpoint.clone()))?
            .map_err(|source| ChannelError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        let mut connection = Connection {
            stream,
            max_frame_bytes: self.config.max_frame_bytes,
        };

        match connection.call(&Request::handshake(&self.config.client_name)).await? {
            Response::Handshake(hello) if hello.success => {
                trace!(operation = "handshake", endpoint = %endpoint, "connected to agent");
                Ok(connection)
            }
            Response::Handshake(hello) => Err(ChannelError::HandshakeRejected(
                hello
                    .error_message
                    .map(|m| String::from_utf8_lossy(&m).into_owned())
                    .unwrap_or_default(),
            )),
            other => Err(unexpected("handshake", other)),
        }
    }

    async fn upload(
        &self,
        connection: &mut Connection,
        header: RequestHeader,
        hash: &ContentHash,
        path: &Path,
    ) -> Result<u64, ChannelError> {
        let mut file = tokio::fs::File::open(path).await?;
        let destination = path.to_string_lossy();
        connection
            .send(&Request::store_file_header(header.clone(), content_hash_to_proto(hash), &destination))
            .await?;

        let mut sent = 0u64;
        let mut buffer = vec![0u8; self.config.chunk_bytes];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            connection.send(&Request::store_file_chunk(buffer[..read].to_vec())).await?;
            sent += read as u64;
        }
        connection.send(&Request::StoreFileComplete(header)).await?;
        Ok(sent)
    }
}

#[async_trait]
impl RemoteCas for AgentChannel {
    async fn pin_bulk(&self, request: PinBulkRequest) -> Result<PinBulkResponse, ChannelError> {
        let mut connection = self.open().await?;
        match connection.call(&Request::PinBulk(request)).await? {
            Response::PinBulk(response) => Ok(response),
            other => Err(unexpected("pin_bulk", other)),
        }
    }

    async fn store_file(
        &self,
        header: RequestHeader,
        hash: ContentHash,
        path: PathBuf,
    ) -> Result<StoreFileResponse, ChannelError> {
        let mut connection = self.open().await?;
        let sent = self.upload(&mut connection, header, &hash, &path).await?;
        debug!(operation = "store_file", hash = %hash, path = %path.display(), bytes = sent, "upload sent");
        match connection.receive().await? {
            Response::StoreFile(response) => Ok(response),
            other => Err(unexpected("store_file", other)),
        }
    }
}

#[async_trait]
impl RemoteWorker for AgentChannel {
    async fn run_process(&self, request: BuildRequest) -> Result<BuildResponse, ChannelError> {
        let mut connection = self.open().await?;
        match connection.call(&Request::RunProcess(request)).await? {
            Response::RunProcess(response) => Ok(response),
            other => Err(unexpected("run_process", other)),
        }
    }
}

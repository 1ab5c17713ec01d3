// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Agent RPC server.
//!
//! Every connection starts with a handshake and then carries any number of
//! calls, one at a time. A `StoreFile` call is a header frame, any number
//! of chunk frames and a closing `StoreFileComplete`; the chunks are pumped
//! into [`ContentServer::store_file`] while they arrive.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use remex_cas::{CasError, ContentServer};
use remex_proto::{
    read_frame, write_frame, DispatchErrorCode, Endpoint, FrameError, Request, Response,
    StoreFileRequest, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::dispatcher::RemoteExecutionDispatcher;

/// Buffered chunks per upload before the reader waits on the store.
const UPLOAD_QUEUE_DEPTH: usize = 8;

pub struct AgentServices {
    pub dispatcher: RemoteExecutionDispatcher,
    pub content: ContentServer,
    pub max_frame_bytes: usize,
}

enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

pub struct AgentServer {
    listener: Listener,
    services: Arc<AgentServices>,
}

impl AgentServer {
    pub async fn bind(endpoint: &Endpoint, services: Arc<AgentServices>) -> Result<Self> {
        let listener = match endpoint {
            Endpoint::Unix(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating socket directory {}", parent.display()))?;
                }
                if path.exists() {
                    warn!(operation = "server_bind", socket_path = %path.display(), "removing stale socket");
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)
                    .with_context(|| format!("binding {}", path.display()))?;
                Listener::Unix {
                    listener,
                    path: path.clone(),
                }
            }
            Endpoint::Tcp(addr) => Listener::Tcp(
                TcpListener::bind(addr.as_str())
                    .await
                    .with_context(|| format!("binding {addr}"))?,
            ),
        };
        let server = Self { listener, services };
        info!(operation = "server_bind", endpoint = %server.local_endpoint()?, "agent listening");
        Ok(server)
    }

    /// The bound address; for TCP this carries the actual port.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(match &self.listener {
            Listener::Unix { path, .. } => Endpoint::Unix(path.clone()),
            Listener::Tcp(listener) => Endpoint::Tcp(listener.local_addr()?.to_string()),
        })
    }

    /// Accepts connections until `shutdown` fires. In-flight calls observe
    /// the same token and stop with it.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let connections = AtomicU64::new(0);
        loop {
            let accepted: std::io::Result<Box<dyn remex_proto::Transport>> = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = accept(&self.listener) => accepted,
            };
            let connection = connections.fetch_add(1, Ordering::Relaxed) + 1;
            match accepted {
                Ok(stream) => {
                    let services = Arc::clone(&self.services);
                    let cancel = shutdown.child_token();
                    let span = info_span!("connection", connection);
                    tokio::spawn(
                        async move {
                            match handle_connection(stream, services, cancel).await {
                                Ok(()) => debug!(operation = "handle_connection", "connection closed"),
                                Err(e) => warn!(operation = "handle_connection", error = %e, "connection ended with error"),
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => warn!(operation = "accept_connection", error = %e, "accept failed"),
            }
        }

        let released_pins = self.services.content.store().release_pins();
        info!(
            operation = "shutdown",
            connections = connections.load(Ordering::Relaxed),
            released_pins,
            "agent stopped accepting connections"
        );
        if let Listener::Unix { path, .. } = &self.listener {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(operation = "shutdown", error = %e, "socket already removed");
            }
        }
        Ok(())
    }
}

async fn accept(listener: &Listener) -> std::io::Result<Box<dyn remex_proto::Transport>> {
    match listener {
        Listener::Unix { listener, .. } => Ok(Box::new(listener.accept().await?.0)),
        Listener::Tcp(listener) => {
            let (stream, _) = listener.accept().await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
    }
}

async fn respond<W: AsyncWrite + Unpin>(writer: &mut W, response: &Response) -> Result<()> {
    write_frame(writer, response).await.map_err(|e| anyhow!("writing response: {e}"))
}

async fn handle_connection<S>(stream: S, services: Arc<AgentServices>, cancel: CancellationToken) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let max = services.max_frame_bytes;

    match read_frame::<_, Request>(&mut reader, max).await {
        Ok(Some(Request::Handshake(hello))) if hello.version == PROTOCOL_VERSION => {
            debug!(
                operation = "handshake",
                client = %String::from_utf8_lossy(&hello.client),
                "client connected"
            );
            respond(&mut writer, &Response::handshake_ok()).await?;
        }
        Ok(Some(Request::Handshake(hello))) => {
            let message = format!(
                "unsupported protocol version {:?}",
                String::from_utf8_lossy(&hello.version)
            );
            respond(&mut writer, &Response::handshake_rejected(message)).await?;
            return Ok(());
        }
        Ok(Some(other)) => {
            let message = format!("expected handshake, got {}", other.kind());
            respond(&mut writer, &Response::error(message, DispatchErrorCode::ProtocolViolation)).await?;
            return Ok(());
        }
        Ok(None) => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    loop {
        let request = match read_frame::<_, Request>(&mut reader, max).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(FrameError::Io(e)) => return Err(e.into()),
            Err(e) => {
                let _ = respond(&mut writer, &Response::error(e.to_string(), DispatchErrorCode::ProtocolViolation)).await;
                return Err(e.into());
            }
        };
        debug!(operation = "request", kind = request.kind(), "request received");

        let response = match request {
            Request::PinBulk(pin) => match services.content.pin_bulk(&pin, &cancel).await {
                Ok(response) => Response::PinBulk(response),
                Err(e) => cas_error_response(e),
            },
            Request::StoreFile(first) => {
                match receive_upload(&mut reader, first, &services, &cancel).await {
                    Ok(response) => response,
                    Err(e) => {
                        // The stream is no longer framed; nothing more can be read.
                        let _ = respond(
                            &mut writer,
                            &Response::error(e.to_string(), DispatchErrorCode::ProtocolViolation),
                        )
                        .await;
                        return Err(e);
                    }
                }
            }
            Request::RunProcess(build) => {
                match run_process(&mut reader, build, &services, &cancel).await {
                    Some(response) => response,
                    None => return Ok(()),
                }
            }
            other => Response::error(
                format!("unexpected {} request", other.kind()),
                DispatchErrorCode::ProtocolViolation,
            ),
        };
        respond(&mut writer, &response).await?;
    }
}

fn cas_error_response(e: CasError) -> Response {
    let code = match e {
        CasError::Cancelled => DispatchErrorCode::Cancelled,
        _ => DispatchErrorCode::Internal,
    };
    Response::error(e.to_string(), code)
}

/// Feeds upload frames to the content server until `StoreFileComplete`.
/// Frames are drained to the end even after the store gives up early so
/// the connection stays usable. Returns an error when the connection can
/// no longer be read.
async fn receive_upload<R>(
    reader: &mut ReadHalf<R>,
    first: StoreFileRequest,
    services: &AgentServices,
    cancel: &CancellationToken,
) -> Result<Response>
where
    R: AsyncRead + AsyncWrite + Unpin + Send,
{
    let max = services.max_frame_bytes;
    let (tx, rx) = mpsc::channel::<Result<StoreFileRequest, CasError>>(UPLOAD_QUEUE_DEPTH);

    let pump = async move {
        let mut tx = Some(tx);
        let mut item = Some(first);
        loop {
            if let Some(item) = item.take() {
                if let Some(sender) = &tx {
                    if sender.send(Ok(item)).await.is_err() {
                        tx = None;
                    }
                }
            }
            match read_frame::<_, Request>(reader, max).await {
                Ok(Some(Request::StoreFile(next))) => item = Some(next),
                Ok(Some(Request::StoreFileComplete(_))) => return Ok(()),
                outcome => {
                    let reason = match outcome {
                        Ok(Some(other)) => anyhow!("unexpected {} request during upload", other.kind()),
                        Ok(None) => anyhow!("connection closed during upload"),
                        Err(e) => anyhow!("reading upload: {e}"),
                    };
                    if let Some(sender) = tx.take() {
                        let _ = sender.send(Err(CasError::Stream(reason.to_string()))).await;
                    }
                    return Err(reason);
                }
            }
        }
    };

    let (pumped, stored) = tokio::join!(pump, services.content.store_file(ReceiverStream::new(rx), cancel));
    pumped?;
    Ok(match stored {
        Ok(response) => Response::StoreFile(response),
        Err(e) => cas_error_response(e),
    })
}

/// Runs one dispatch. The peer must stay silent until the response; data
/// or a closed connection in the meantime cancels the dispatch and
/// returns `None`.
async fn run_process<R>(
    reader: &mut ReadHalf<R>,
    build: remex_proto::BuildRequest,
    services: &AgentServices,
    cancel: &CancellationToken,
) -> Option<Response>
where
    R: AsyncRead + AsyncWrite + Unpin + Send,
{
    let dispatch_cancel = cancel.child_token();
    let dispatch = services.dispatcher.run_process(build, dispatch_cancel.clone());
    tokio::pin!(dispatch);

    let mut probe = [0u8; 1];
    let result = tokio::select! {
        result = &mut dispatch => result,
        read = reader.read(&mut probe) => {
            match read {
                Ok(0) => info!(operation = "run_process", "client disconnected, cancelling dispatch"),
                Ok(_) => warn!(operation = "run_process", "client sent data during dispatch, cancelling"),
                Err(e) => warn!(operation = "run_process", error = %e, "connection failed during dispatch"),
            }
            dispatch_cancel.cancel();
            if let Err(e) = dispatch.await {
                debug!(operation = "run_process", error = %e, "cancelled dispatch finished");
            }
            return None;
        }
    };

    Some(match result {
        Ok(response) => Response::RunProcess(response),
        Err(e) => {
            error!(operation = "run_process", code = ?e.code(), error = %e, "dispatch failed");
            Response::error(e.to_string(), e.code())
        }
    })
}

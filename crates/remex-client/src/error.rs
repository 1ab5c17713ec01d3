// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;

use remex_pips::{CodecError, ContentHash, PipType};
use remex_proto::{DispatchErrorCode, Endpoint, FrameError};
use thiserror::Error;

/// Transport-level failures talking to an agent.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {0}")]
    ConnectTimeout(Endpoint),

    #[error("agent rejected handshake: {0}")]
    HandshakeRejected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    #[error("agent closed the connection before responding")]
    Closed,

    #[error("expected {expected} response, got {got}")]
    UnexpectedResponse { expected: &'static str, got: &'static str },

    /// The agent answered with an error response.
    #[error("agent error ({code}): {message}")]
    Remote { code: u32, message: String },
}

/// Why a remote dispatch produced no execution result.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("untracked file {path} is declared as a dependency")]
    UntrackedContentDeclared { path: PathBuf },

    #[error("no content registered for dependency {path}")]
    MissingInputContent { path: PathBuf },

    #[error("content {hash} unavailable on the agent: {message}")]
    ContentUnavailable { hash: ContentHash, message: String },

    #[error("sandbox failure on the agent: {0}")]
    SandboxInfrastructureFailure(String),

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("{0} pips cannot run remotely")]
    NotRemotable(PipType),

    #[error(transparent)]
    Transport(ChannelError),

    #[error("agent failure ({code:?}): {message}")]
    Remote {
        code: Option<DispatchErrorCode>,
        message: String,
    },
}

impl DispatchError {
    /// True when the agent started the process before the dispatch failed.
    /// Everything else failed before any execution could begin.
    pub fn execution_attempted(&self) -> bool {
        matches!(
            self,
            DispatchError::SandboxInfrastructureFailure(_) | DispatchError::Remote { .. }
        )
    }

    /// Failures reported by the agent keep their category.
    pub fn from_remote(code: u32, message: String) -> Self {
        match DispatchErrorCode::from_u32(code) {
            Some(DispatchErrorCode::ProtocolViolation) => DispatchError::ProtocolViolation(message),
            Some(DispatchErrorCode::SandboxInfrastructureFailure) => {
                DispatchError::SandboxInfrastructureFailure(message)
            }
            Some(DispatchErrorCode::Cancelled) => DispatchError::Cancelled,
            code => DispatchError::Remote { code, message },
        }
    }
}

impl From<ChannelError> for DispatchError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::Remote { code, message } => DispatchError::from_remote(code, message),
            other => DispatchError::Transport(other),
        }
    }
}

impl From<CodecError> for DispatchError {
    fn from(e: CodecError) -> Self {
        DispatchError::ProtocolViolation(e.to_string())
    }
}

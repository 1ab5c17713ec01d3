// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Orchestrator side of remote execution.
//!
//! [`RemoteExecutionClient`] sequences a dispatch: the
//! [`ContentSynchronizer`] pins (and if needed uploads) every input, the
//! process is encoded with a fresh [`remex_pips::SerializationContext`] and
//! sent over an [`AgentChannel`], and the response is decoded back into the
//! local path table.

pub mod channel;
pub mod error;
pub mod execute;
pub mod registry;
pub mod sync;

pub use channel::{AgentChannel, ChannelConfig, ChannelConfigBuilder, RemoteCas, RemoteWorker};
pub use error::{ChannelError, DispatchError};
pub use execute::{ExecutionOutput, ExecutionResult, RemoteExecutionClient};
pub use registry::{
    ContentRegistry, FileContentInfo, FileContentRegistry, SealedDirectoryIndex, SealedDirectoryLister,
};
pub use sync::{ContentSynchronizer, RequiredContent, SyncReport};

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Failures of the sandbox itself. A process that runs and exits non-zero
/// is not an error.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lost track of the sandboxed process: {0}")]
    Monitoring(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

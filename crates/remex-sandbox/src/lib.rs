// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Sandboxed process execution for remote agents.
//!
//! A [`FileAccessManifest`] states what the process may touch and which
//! accesses must be reported back; a [`Sandbox`] runs the process under it.

pub mod access;
pub mod error;
pub mod policy;
pub mod process;

pub use access::{ReportedFileAccess, RequestedAccess};
pub use error::{Result, SandboxError};
pub use policy::{FileAccessManifest, FileAccessPolicy, Scope};
pub use process::{
    CapturedOutput, ProcessSandbox, ProcessStatus, Sandbox, SandboxedProcessInfo,
    SandboxedProcessResult, DEFAULT_OUTPUT_CAPTURE_BYTES,
};

// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Remote execution agent: the server side of pin, upload and dispatch calls.

pub mod config;
pub mod dispatcher;
pub mod server;

pub use config::{AgentConfig, ConfigError};
pub use dispatcher::{
    build_access_plan, AccessPlan, DispatchFailure, DispatchPhase, DispatcherSettings,
    RemoteExecutionDispatcher,
};
pub use server::{AgentServer, AgentServices};

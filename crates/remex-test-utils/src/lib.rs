// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Shared test infrastructure for the remex workspace.
//!
//! Every test creates a unique log file and keeps its console output to a
//! single line on success. Use `#[logged_test]` / `#[logged_tokio_test]`
//! instead of the bare harness attributes.

// Lets the attribute macros resolve `::remex_test_utils` inside this crate.
extern crate self as remex_test_utils;

pub mod guard;
pub mod logging;
pub mod macros;

pub use guard::TestLoggerGuard;
pub use logging::{create_unique_test_log, TestLogError, TestLogger};
pub use remex_test_utils_macros::{logged_test, logged_tokio_test};

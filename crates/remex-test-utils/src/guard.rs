// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guard that finalizes a [`TestLogger`] exactly once.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

use crate::{TestLogError, TestLogger};

/// Records success when `finish_success` is called. Dropping the guard
/// without finishing (early `?` return, panic unwind) records a failure.
pub struct TestLoggerGuard {
    logger: Option<TestLogger>,
    log_path: PathBuf,
    completed: bool,
}

impl TestLoggerGuard {
    pub fn new(test_name: &str) -> Result<Self, TestLogError> {
        let logger = TestLogger::new(test_name)?;
        let log_path = logger.log_path().to_path_buf();
        Ok(Self {
            logger: Some(logger),
            log_path,
            completed: false,
        })
    }

    pub fn logger(&mut self) -> &mut TestLogger {
        self.logger.as_mut().expect("test logger already finalized")
    }

    /// Routes `tracing` events on the current thread into the test log until
    /// the returned guard is dropped. `RUST_LOG` overrides the default
    /// `debug` filter.
    pub fn capture_tracing(&self) -> Option<DefaultGuard> {
        let file = OpenOptions::new().append(true).open(&self.log_path).ok()?;
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .with_target(true)
            .finish();
        Some(tracing::subscriber::set_default(subscriber))
    }

    pub fn finish_success(mut self) -> Result<PathBuf, TestLogError> {
        self.completed = true;
        match self.logger.take() {
            Some(logger) => logger.finish_success(),
            None => Ok(self.log_path.clone()),
        }
    }

    pub fn finish_failure<S: AsRef<str>>(mut self, message: S) -> Result<PathBuf, TestLogError> {
        self.completed = true;
        match self.logger.take() {
            Some(logger) => logger.finish_failure(message.as_ref()),
            None => Ok(self.log_path.clone()),
        }
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }
}

impl Drop for TestLoggerGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let Some(logger) = self.logger.take() else {
            return;
        };
        let reason = if std::thread::panicking() {
            "test panicked"
        } else {
            "test returned before finishing its log"
        };
        if let Err(err) = logger.finish_failure(reason) {
            eprintln!("failed to finalize test log {}: {}", self.log_path.display(), err);
        }
    }
}
